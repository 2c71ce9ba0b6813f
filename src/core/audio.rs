use std::{
    fs::File,
    io::{Cursor, Seek, Write},
    path::Path,
};

use anyhow::{anyhow, Context};
use hound::{SampleFormat, WavSpec, WavWriter};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};
use tracing::debug;

use crate::{error::Result, types::AudioData};

/// Sample encoding used when writing WAV files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavEncoding {
    /// 16-bit integer PCM, for delivered files.
    Pcm16,
    /// 32-bit float, for intermediate artifacts that are mixed again.
    Float32,
}

/// Decodes any container/codec symphonia understands into interleaved f32.
pub fn read_audio<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    let path: &Path = path.as_ref();

    let file: File =
        File::open(path).with_context(|| format!("Failed to open audio file: {:?}", path))?;

    let mss: MediaSourceStream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint: Hint = Hint::new();

    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("Unsupported audio container: {:?}", path))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio track found")?;
    let track_id = track.id;

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Unsupported audio codec")?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate: u32 = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels: u16 = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => return Err(anyhow!("Failed to read packet from {:?}: {e}", path).into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("skipping undecodable packet in {:?}: {e}", path);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to decode {:?}: {e}", path).into()),
        };
        sample_rate = decoded.spec().rate;
        channels = decoded.spec().channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);

        samples.extend_from_slice(buffer.samples());
    }

    if channels == 0 || sample_rate == 0 {
        return Err(anyhow!("No decodable audio in {:?}", path).into());
    }

    debug!(
        "read audio {:?}: sample_rate={}, channels={}, samples={}",
        path,
        sample_rate,
        channels,
        samples.len()
    );

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
    })
}

pub fn write_wav<P: AsRef<Path>>(path: P, audio: &AudioData, encoding: WavEncoding) -> Result<()> {
    let writer = WavWriter::create(path, wav_spec(audio, encoding))?;
    write_samples(writer, audio, encoding)
}

/// Encodes `audio` as a complete WAV file in memory.
pub fn encode_wav(audio: &AudioData, encoding: WavEncoding) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let writer = WavWriter::new(&mut cursor, wav_spec(audio, encoding))?;
        write_samples(writer, audio, encoding)?;
    }
    Ok(cursor.into_inner())
}

fn wav_spec(audio: &AudioData, encoding: WavEncoding) -> WavSpec {
    let (bits_per_sample, sample_format) = match encoding {
        WavEncoding::Pcm16 => (16, SampleFormat::Int),
        WavEncoding::Float32 => (32, SampleFormat::Float),
    };
    WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample,
        sample_format,
    }
}

fn write_samples<W: Write + Seek>(
    mut writer: WavWriter<W>,
    audio: &AudioData,
    encoding: WavEncoding,
) -> Result<()> {
    match encoding {
        WavEncoding::Pcm16 => {
            for sample in &audio.samples {
                let s = (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                writer.write_sample(s)?;
            }
        }
        WavEncoding::Float32 => {
            for sample in &audio.samples {
                writer.write_sample(*sample)?;
            }
        }
    }
    writer.finalize()?;
    Ok(())
}
