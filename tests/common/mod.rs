#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use vocal_remover_core::{
    core::memory::FixedProbe, downcast_weights, read_audio, write_wav, AudioData, Downloader,
    FailureKind, FormatPreference, InferenceAdapter, MemoryMonitor, MemoryProbe, ModePolicy,
    ModelDescriptor, ModelRegistry, ModelWeights, Orchestrator, ProcessingService,
    ResidencyCache, Result, StemArtifact, StemError, Topology, WavEncoding, WorkerPool,
};

pub const THRESHOLD_GB: f64 = 6.0;

pub fn topology() -> Topology {
    Topology::default()
}

/// Deterministic stereo signal.
pub fn tone(frames: usize, sample_rate: u32, step: f32) -> AudioData {
    let samples = (0..frames * 2)
        .map(|i| ((i as f32) * step).sin() * 0.25)
        .collect();
    AudioData {
        samples,
        sample_rate,
        channels: 2,
    }
}

pub fn audio(samples: Vec<f32>, channels: u16, sample_rate: u32) -> AudioData {
    AudioData {
        samples,
        sample_rate,
        channels,
    }
}

pub fn write_fixture(dir: &Path, name: &str, data: &AudioData) -> PathBuf {
    let path = dir.join(name);
    write_wav(&path, data, WavEncoding::Float32).unwrap();
    path
}

pub fn decode_bytes(bytes: &[u8]) -> AudioData {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decoded.wav");
    fs::write(&path, bytes).unwrap();
    read_audio(&path).unwrap()
}

/// What a stub model writes for one labeled output.
#[derive(Clone)]
pub enum StubOutput {
    Fixed(AudioData),
    /// Copies the input audio.
    Passthrough,
}

pub struct StubWeights {
    pub model_id: String,
}

/// Adapter that writes scripted Float32 WAV files and records every call.
pub struct StubAdapter {
    scripts: HashMap<String, Vec<(String, StubOutput)>>,
    load_delay: Duration,
    loads: Mutex<HashMap<String, usize>>,
    separations: Mutex<Vec<String>>,
    releases: Mutex<Vec<String>>,
    reclaims: Mutex<usize>,
    load_failures: Mutex<HashMap<String, VecDeque<FailureKind>>>,
    separate_failures: Mutex<HashMap<String, VecDeque<FailureKind>>>,
}

impl StubAdapter {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            load_delay: Duration::ZERO,
            loads: Mutex::new(HashMap::new()),
            separations: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            reclaims: Mutex::new(0),
            load_failures: Mutex::new(HashMap::new()),
            separate_failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_outputs(mut self, model_id: &str, outputs: Vec<(&str, StubOutput)>) -> Self {
        self.scripts.insert(
            model_id.to_string(),
            outputs
                .into_iter()
                .map(|(label, out)| (label.to_string(), out))
                .collect(),
        );
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// The next load of `model_id` fails with `kind`.
    pub fn fail_load(&self, model_id: &str, kind: FailureKind) {
        self.load_failures
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_default()
            .push_back(kind);
    }

    /// The next separation with `model_id` fails with `kind`.
    pub fn fail_separate(&self, model_id: &str, kind: FailureKind) {
        self.separate_failures
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_default()
            .push_back(kind);
    }

    pub fn load_count(&self, model_id: &str) -> usize {
        self.loads
            .lock()
            .unwrap()
            .get(model_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().unwrap().values().sum()
    }

    pub fn separations(&self) -> Vec<String> {
        self.separations.lock().unwrap().clone()
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().unwrap().clone()
    }

    pub fn reclaims(&self) -> usize {
        *self.reclaims.lock().unwrap()
    }

    pub fn total_calls(&self) -> usize {
        self.total_loads() + self.separations().len() + self.releases().len()
    }

    fn next_failure(
        queue: &Mutex<HashMap<String, VecDeque<FailureKind>>>,
        model_id: &str,
    ) -> Option<FailureKind> {
        queue
            .lock()
            .unwrap()
            .get_mut(model_id)
            .and_then(|q| q.pop_front())
    }
}

impl InferenceAdapter for StubAdapter {
    fn load(&self, descriptor: &ModelDescriptor, _model_dir: &Path) -> Result<ModelWeights> {
        *self
            .loads
            .lock()
            .unwrap()
            .entry(descriptor.id.clone())
            .or_default() += 1;
        if !self.load_delay.is_zero() {
            thread::sleep(self.load_delay);
        }
        if let Some(kind) = Self::next_failure(&self.load_failures, &descriptor.id) {
            return Err(kind.into_error(&descriptor.id, "injected load failure"));
        }
        Ok(Box::new(StubWeights {
            model_id: descriptor.id.clone(),
        }))
    }

    fn separate(
        &self,
        descriptor: &ModelDescriptor,
        weights: &ModelWeights,
        input: &Path,
        output_dir: &Path,
    ) -> Result<Vec<StemArtifact>> {
        let weights = downcast_weights::<StubWeights>(descriptor, weights)?;
        assert_eq!(weights.model_id, descriptor.id);
        self.separations.lock().unwrap().push(descriptor.id.clone());

        if let Some(kind) = Self::next_failure(&self.separate_failures, &descriptor.id) {
            return Err(kind.into_error(&descriptor.id, "injected separation failure"));
        }

        let default_script = vec![("Instrumental".to_string(), StubOutput::Passthrough)];
        let script = self.scripts.get(&descriptor.id).unwrap_or(&default_script);

        let mut artifacts = Vec::new();
        for (i, (label, output)) in script.iter().enumerate() {
            let data = match output {
                StubOutput::Fixed(data) => data.clone(),
                StubOutput::Passthrough => read_audio(input)?,
            };
            let path = output_dir.join(format!("{i}_({label}).wav"));
            write_wav(&path, &data, WavEncoding::Float32)?;
            artifacts.push(StemArtifact {
                path,
                label: label.clone(),
            });
        }
        Ok(artifacts)
    }

    fn release(&self, descriptor: &ModelDescriptor, weights: ModelWeights) {
        drop(weights);
        self.releases.lock().unwrap().push(descriptor.id.clone());
    }

    fn reclaim(&self) {
        *self.reclaims.lock().unwrap() += 1;
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Writes a fixture WAV instead of downloading.
pub struct StubDownloader {
    audio: AudioData,
    fail_preferred: bool,
    always_fail: bool,
    calls: Mutex<Vec<FormatPreference>>,
}

impl StubDownloader {
    pub fn new(audio: AudioData) -> Self {
        Self {
            audio,
            fail_preferred: false,
            always_fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_preferred(mut self) -> Self {
        self.fail_preferred = true;
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn calls(&self) -> Vec<FormatPreference> {
        self.calls.lock().unwrap().clone()
    }
}

impl Downloader for StubDownloader {
    fn fetch(&self, url: &str, dest_dir: &Path, format: FormatPreference) -> Result<PathBuf> {
        self.calls.lock().unwrap().push(format);
        if self.always_fail || (self.fail_preferred && format == FormatPreference::Preferred) {
            return Err(StemError::DownloadFailure {
                url: url.to_string(),
                reason: "no audio stream found".into(),
            });
        }
        Ok(write_fixture(dest_dir, "audio.wav", &self.audio))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

pub struct Stack {
    pub adapter: Arc<StubAdapter>,
    pub probe: Arc<FixedProbe>,
    pub cache: Arc<ResidencyCache>,
    pub pool: WorkerPool,
    pub model_dir: tempfile::TempDir,
}

impl Stack {
    pub fn new(adapter: StubAdapter, policy: ModePolicy) -> Self {
        Self::with_probe(adapter, policy, FixedProbe::unlimited())
    }

    pub fn with_probe(adapter: StubAdapter, policy: ModePolicy, probe: FixedProbe) -> Self {
        let adapter = Arc::new(adapter);
        let probe = Arc::new(probe);
        let monitor = Arc::new(MemoryMonitor::new(
            probe.clone() as Arc<dyn MemoryProbe>,
            THRESHOLD_GB,
        ));
        let pool = WorkerPool::new(1, 2);
        let model_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ResidencyCache::new(
            Arc::new(ModelRegistry::builtin().unwrap()),
            adapter.clone() as Arc<dyn InferenceAdapter>,
            monitor,
            pool.clone(),
            model_dir.path().to_path_buf(),
            policy,
        ));
        Self {
            adapter,
            probe,
            cache,
            pool,
            model_dir,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.cache.clone(),
            self.adapter.clone() as Arc<dyn InferenceAdapter>,
            self.pool.clone(),
            topology(),
        )
    }

    pub fn service(&self, downloader: Arc<StubDownloader>, temp_root: &Path) -> ProcessingService {
        ProcessingService::new(
            self.orchestrator(),
            downloader as Arc<dyn Downloader>,
            temp_root.to_path_buf(),
        )
    }
}

/// Stub outputs for the preserve-vocals topology with known stems.
pub struct PreserveVocalsFixture {
    pub instrumental: AudioData,
    pub vocals: AudioData,
    pub singing: AudioData,
    pub speech: AudioData,
}

impl PreserveVocalsFixture {
    pub fn new() -> Self {
        Self {
            instrumental: audio(
                vec![0.10, -0.10, 0.20, -0.20, 0.30, -0.30, 0.40, -0.40, 0.50, -0.50],
                2,
                44_100,
            ),
            vocals: audio(vec![0.05; 10], 2, 44_100),
            singing: audio(vec![0.01, 0.02, 0.03, 0.04, 0.05, 0.06], 2, 44_100),
            speech: audio(vec![0.9; 6], 2, 44_100),
        }
    }

    pub fn adapter(&self) -> StubAdapter {
        let t = topology();
        StubAdapter::new()
            .with_outputs(
                &t.vocal_split,
                vec![
                    ("Vocals", StubOutput::Fixed(self.vocals.clone())),
                    ("Instrumental", StubOutput::Fixed(self.instrumental.clone())),
                ],
            )
            .with_outputs(
                &t.singing_split,
                vec![
                    ("Speech", StubOutput::Fixed(self.speech.clone())),
                    ("Music", StubOutput::Fixed(self.singing.clone())),
                ],
            )
            .with_outputs(
                &t.de_echo,
                vec![
                    ("Reverb", StubOutput::Fixed(self.speech.clone())),
                    ("No Echo", StubOutput::Passthrough),
                ],
            )
    }

    /// Instrumental plus singing over the shorter of the two.
    pub fn expected_mix(&self) -> Vec<f32> {
        self.singing
            .samples
            .iter()
            .zip(&self.instrumental.samples)
            .map(|(s, i)| i + s)
            .collect()
    }
}
