//! Request façade: download, run the chosen topology, hand back bytes.

use crate::{
    config::{AppConfig, MemoryModeSetting, ProbeSetting},
    core::{
        adapter::InferenceAdapter,
        audio::{read_audio, write_wav, WavEncoding},
        dsp::{convert_channels, resample},
        memory::{self, MemoryMonitor, MemoryProbe, NoAccelerator, NvidiaSmiProbe},
        pipeline::{Orchestrator, PipelineRun, RunReport, RunState},
        runner::{RunnerAdapter, RunnerSettings},
        workers::WorkerPool,
    },
    error::{Result, StemError},
    io::downloader::{Downloader, FormatPreference, YtDlpDownloader},
    model::{
        registry::ModelRegistry,
        residency::{CacheStats, MemoryMode, ModePolicy, ResidencyCache},
    },
    types::{ArchitectureKind, ProcessedAudio, ProcessingMethod, StemKind},
    utils::new_task_id,
};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tracing::{info, warn};

/// Minimal-processing options for fingerprinting extracts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub architecture: ArchitectureKind,
    pub primary_stem: StemKind,
    pub description: String,
    pub is_loaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub models_loaded: usize,
    pub resident_models: Vec<String>,
    pub accelerator_available: bool,
    pub available_memory_gb: Option<f64>,
    pub memory_mode: MemoryMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub average_processing_time_secs: f64,
    pub cache: CacheStats,
    pub cache_hit_ratio: f64,
    pub inference_workers: usize,
    pub io_workers: usize,
}

#[derive(Default)]
struct RequestCounters {
    total: AtomicU64,
    failed: AtomicU64,
    completed_micros: AtomicU64,
}

pub struct ProcessingService {
    orchestrator: Orchestrator,
    downloader: Arc<dyn Downloader>,
    temp_root: PathBuf,
    save_dir: Option<PathBuf>,
    counters: RequestCounters,
}

impl ProcessingService {
    pub fn new(
        orchestrator: Orchestrator,
        downloader: Arc<dyn Downloader>,
        temp_root: PathBuf,
    ) -> Self {
        Self {
            orchestrator,
            downloader,
            temp_root,
            save_dir: None,
            counters: RequestCounters::default(),
        }
    }

    /// Also writes every final output into `dir`.
    pub fn with_save_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.save_dir = dir;
        self
    }

    /// Wires the production collaborators described by `config`.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::builtin()?);
        for id in config.topology.all_models() {
            registry.get(id)?;
        }

        let probe: Arc<dyn MemoryProbe> = match config.memory.probe {
            ProbeSetting::NvidiaSmi => {
                NvidiaSmiProbe::start("nvidia-smi", memory::DEFAULT_REFRESH).await
            }
            ProbeSetting::None => Arc::new(NoAccelerator),
        };
        let monitor = Arc::new(MemoryMonitor::new(probe, config.memory.threshold_gb));
        let policy = match config.memory.mode {
            MemoryModeSetting::Auto => ModePolicy::Adaptive {
                latch: config.memory.latch,
            },
            MemoryModeSetting::Unbounded => ModePolicy::Fixed(MemoryMode::Unbounded),
            MemoryModeSetting::SingleSlot => ModePolicy::Fixed(MemoryMode::SingleSlot),
        };

        let adapter: Arc<dyn InferenceAdapter> = Arc::new(RunnerAdapter::new(RunnerSettings {
            program: config.runner_program.clone(),
            script: config.runner_script.clone(),
        }));
        let pool = WorkerPool::new(config.inference_workers, config.io_workers);
        let cache = Arc::new(ResidencyCache::new(
            registry,
            adapter.clone(),
            monitor,
            pool.clone(),
            config.model_dir.clone(),
            policy,
        ));
        let orchestrator = Orchestrator::new(cache, adapter, pool, config.topology.clone());
        let downloader = Arc::new(YtDlpDownloader::new(config.downloader_program.clone()));

        Ok(Self::new(orchestrator, downloader, config.temp_dir.clone())
            .with_save_dir(config.save_dir.clone()))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        self.orchestrator.cache()
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Loads `model_ids` ahead of the first request.
    pub async fn preload(&self, model_ids: &[String]) -> Result<()> {
        for id in model_ids {
            let lease = self.cache().acquire(id).await?;
            info!(model = lease.id(), "preloaded");
        }
        Ok(())
    }

    /// Downloads `url`, runs the topology for `method` and returns the final
    /// audio as `{method}_{task_id}.wav`.
    pub async fn process(&self, url: &str, method: ProcessingMethod) -> Result<ProcessedAudio> {
        validate_url(url)?;
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let result = self.process_inner(url, method).await;
        self.finish_request(started, result.is_ok());

        let report = result?;
        let processed = ProcessedAudio {
            filename: format!("{method}_{}.wav", report.task_id),
            task_id: report.task_id,
            bytes: report.bytes,
            models_used: report.models_used,
            processing_time_secs: started.elapsed().as_secs_f64(),
        };
        self.save_copy(&processed).await;
        Ok(processed)
    }

    /// Fingerprinting variant: no model, only decode and optional
    /// resample or channel conversion, written as 16-bit PCM.
    pub async fn extract(&self, url: &str, options: ExtractOptions) -> Result<ProcessedAudio> {
        validate_url(url)?;
        if options.sample_rate == Some(0) || options.channels == Some(0) {
            return Err(StemError::InvalidRequest(
                "sample_rate and channels must be positive".into(),
            ));
        }
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let result = self.extract_inner(url, options).await;
        self.finish_request(started, result.is_ok());

        let report = result?;
        let processed = ProcessedAudio {
            filename: format!("extracted_{}.wav", report.task_id),
            task_id: report.task_id,
            bytes: report.bytes,
            models_used: Vec::new(),
            processing_time_secs: started.elapsed().as_secs_f64(),
        };
        self.save_copy(&processed).await;
        Ok(processed)
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        let cache = self.cache();
        cache
            .registry()
            .iter()
            .map(|d| ModelInfo {
                id: d.id.clone(),
                architecture: d.architecture,
                primary_stem: d.primary_stem,
                description: d.description.clone(),
                is_loaded: cache.is_resident(&d.id),
            })
            .collect()
    }

    pub fn health(&self) -> HealthReport {
        let cache = self.cache();
        let monitor = cache.monitor();
        HealthReport {
            status: "healthy",
            models_loaded: cache.len(),
            resident_models: cache.resident_ids(),
            accelerator_available: monitor.has_accelerator(),
            available_memory_gb: monitor.available_memory().as_gb(),
            memory_mode: cache.mode(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        let total = self.counters.total.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let succeeded = total.saturating_sub(failed);
        let micros = self.counters.completed_micros.load(Ordering::Relaxed);
        let cache = self.cache().stats();
        let lookups = cache.hits + cache.misses;
        let pool = self.orchestrator.pool();

        ServiceStats {
            total_requests: total,
            failed_requests: failed,
            average_processing_time_secs: if succeeded == 0 {
                0.0
            } else {
                micros as f64 / succeeded as f64 / 1_000_000.0
            },
            cache_hit_ratio: if lookups == 0 {
                0.0
            } else {
                cache.hits as f64 / lookups as f64
            },
            cache,
            inference_workers: pool.inference_size(),
            io_workers: pool.io_size(),
        }
    }

    async fn process_inner(&self, url: &str, method: ProcessingMethod) -> Result<RunReport> {
        let mut run = PipelineRun::new(new_task_id(), &self.temp_root)?;
        info!(task = run.task_id(), %url, %method, "processing request");

        let outcome = match self.download(&mut run, url).await {
            Ok(input) => self.orchestrator.execute(&mut run, method, &input).await,
            Err(e) => Err(e),
        };
        self.orchestrator.conclude(run, outcome).await
    }

    async fn extract_inner(&self, url: &str, options: ExtractOptions) -> Result<RunReport> {
        let mut run = PipelineRun::new(new_task_id(), &self.temp_root)?;
        info!(task = run.task_id(), %url, "extracting audio");

        let outcome = match self.download(&mut run, url).await {
            Ok(input) => {
                run.set_state(RunState::Stage(1));
                let out = run.workdir().join("extracted.wav");
                let out_path = out.clone();
                self.orchestrator
                    .pool()
                    .run_io(move || {
                        let mut audio = read_audio(&input)?;
                        if let Some(channels) = options.channels {
                            audio = convert_channels(&audio, channels)?;
                        }
                        if let Some(rate) = options.sample_rate {
                            audio = resample(&audio, rate)?;
                        }
                        write_wav(&out_path, &audio, WavEncoding::Pcm16)
                    })
                    .await
                    .map(|_| out)
            }
            Err(e) => Err(e),
        };
        self.orchestrator.conclude(run, outcome).await
    }

    /// Preferred formats first, then one permissive retry.
    async fn download(&self, run: &mut PipelineRun, url: &str) -> Result<PathBuf> {
        run.set_state(RunState::Downloading);
        let dest = run.download_dir()?;

        match self.fetch(url, &dest, FormatPreference::Preferred).await {
            Ok(path) => Ok(path),
            Err(first) => {
                warn!(task = run.task_id(), %url, "{first}; retrying with permissive formats");
                self.fetch(url, &dest, FormatPreference::Permissive)
                    .await
                    .map_err(|e| match e {
                        e @ StemError::DownloadFailure { .. } => e,
                        other => StemError::DownloadFailure {
                            url: url.to_string(),
                            reason: other.to_string(),
                        },
                    })
            }
        }
    }

    async fn fetch(&self, url: &str, dest: &Path, format: FormatPreference) -> Result<PathBuf> {
        let downloader = self.downloader.clone();
        let (url, dest) = (url.to_string(), dest.to_path_buf());
        self.orchestrator
            .pool()
            .run_io(move || downloader.fetch(&url, &dest, format))
            .await
    }

    async fn save_copy(&self, processed: &ProcessedAudio) {
        let Some(dir) = self.save_dir.clone() else {
            return;
        };
        let path = dir.join(&processed.filename);
        let bytes = processed.bytes.clone();
        let target = path.clone();
        let saved = self
            .orchestrator
            .pool()
            .run_io(move || {
                fs::create_dir_all(&dir)?;
                fs::write(&target, bytes)?;
                Ok(())
            })
            .await;
        match saved {
            Ok(()) => info!(path = %path.display(), "output saved"),
            Err(e) => warn!(path = %path.display(), "could not save output: {e}"),
        }
    }

    fn finish_request(&self, started: Instant, ok: bool) {
        if ok {
            self.counters
                .completed_micros
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Only absolute http(s) URLs are accepted.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url.trim())
        .map_err(|e| StemError::InvalidRequest(format!("invalid url `{url}`: {e}")))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(StemError::InvalidRequest(format!(
            "unsupported url scheme `{scheme}`"
        ))),
    }
}
