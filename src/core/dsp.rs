use anyhow::{anyhow, Context};
use ndarray::{Array2, ArrayView2, Axis};
use rubato::{
    InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction,
};

use crate::{error::Result, types::AudioData};

const RESAMPLE_CHUNK: usize = 1024;
const SINC_LEN: usize = 128;

/// Interleaved samples as a `(frames, channels)` view. Trailing samples that
/// do not fill a whole frame are ignored.
fn frames_view(audio: &AudioData, frames: usize) -> Result<ArrayView2<'_, f32>> {
    let ch = audio.channels as usize;
    let view = ArrayView2::from_shape((frames, ch), &audio.samples[..frames * ch])
        .context("audio buffer does not match its channel layout")?;
    Ok(view)
}

fn from_frames(frames: Array2<f32>, sample_rate: u32) -> AudioData {
    let channels = frames.ncols() as u16;
    let samples = if frames.is_standard_layout() {
        frames.into_raw_vec()
    } else {
        frames.iter().copied().collect()
    };
    AudioData {
        samples,
        sample_rate,
        channels,
    }
}

/// Up- or down-mixes to `target` channels. Mono is duplicated, anything
/// folded to mono is averaged, other layouts wrap around the source channels.
pub fn convert_channels(audio: &AudioData, target: u16) -> Result<AudioData> {
    if target == 0 || audio.channels == 0 {
        return Err(anyhow!("cannot convert {} channels to {}", audio.channels, target).into());
    }
    if audio.channels == target {
        return Ok(audio.clone());
    }

    let src = frames_view(audio, audio.frames())?;
    let out = if target == 1 {
        src.mean_axis(Axis(1))
            .context("empty channel axis")?
            .insert_axis(Axis(1))
    } else {
        let src_ch = src.ncols();
        Array2::from_shape_fn((src.nrows(), target as usize), |(f, c)| src[(f, c % src_ch)])
    };
    Ok(from_frames(out, audio.sample_rate))
}

/// Band-limited sample-rate conversion. The output has
/// `round(frames * target / source)` frames.
pub fn resample(audio: &AudioData, target_rate: u32) -> Result<AudioData> {
    if target_rate == 0 {
        return Err(anyhow!("target sample rate must be positive").into());
    }
    if audio.sample_rate == target_rate || audio.frames() == 0 {
        return Ok(AudioData {
            sample_rate: target_rate,
            ..audio.clone()
        });
    }

    let channels = audio.channels as usize;
    let frames = audio.frames();
    let ratio = target_rate as f64 / audio.sample_rate as f64;
    let expected = (frames as f64 * ratio).round() as usize;
    let delay = (SINC_LEN as f64 * ratio / 2.0) as usize;

    let params = InterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: InterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, channels)
        .context("failed to build resampler")?;

    let planar = frames_view(audio, frames)?.reversed_axes();
    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];
    let mut pos = 0usize;

    // Zero chunks past the end flush the filter's delay line.
    while out[0].len() < expected + delay {
        let chunk: Vec<Vec<f32>> = planar
            .outer_iter()
            .map(|ch| {
                let mut buf = vec![0.0f32; RESAMPLE_CHUNK];
                if pos < frames {
                    let end = (pos + RESAMPLE_CHUNK).min(frames);
                    for (dst, src) in buf.iter_mut().zip(ch.slice(ndarray::s![pos..end])) {
                        *dst = *src;
                    }
                }
                buf
            })
            .collect();

        let produced = resampler
            .process(&chunk, None)
            .context("resampling failed")?;
        for (dst, src) in out.iter_mut().zip(produced) {
            dst.extend(src);
        }
        pos += RESAMPLE_CHUNK;
    }

    let resampled = Array2::from_shape_fn((expected, channels), |(f, c)| out[c][f + delay]);
    Ok(from_frames(resampled, target_rate))
}

/// Brings `audio` to the given rate and channel count.
pub fn conform(audio: &AudioData, sample_rate: u32, channels: u16) -> Result<AudioData> {
    let mixed = convert_channels(audio, channels)?;
    resample(&mixed, sample_rate)
}

/// Sample-domain sum of two stems.
///
/// `overlay` is conformed to the rate and channel layout of `base`, then both
/// are truncated to the shorter length. No limiting is applied.
pub fn combine_stems(base: &AudioData, overlay: &AudioData) -> Result<AudioData> {
    let overlay = conform(overlay, base.sample_rate, base.channels)?;
    let frames = base.frames().min(overlay.frames());

    let summed = &frames_view(base, frames)? + &frames_view(&overlay, frames)?;
    Ok(from_frames(summed, base.sample_rate))
}
