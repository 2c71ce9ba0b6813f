//! Pipeline orchestration.
//!
//! A [`PipelineRun`] owns the per-request working directory. The
//! [`Orchestrator`] drives one or more separation stages over it, borrowing
//! resident models from the [`ResidencyCache`] one stage at a time, and falls
//! back to a single low-memory stage when the accelerator runs out of memory.

use crate::{
    core::{
        adapter::InferenceAdapter,
        audio::{read_audio, write_wav, WavEncoding},
        dsp::combine_stems,
        workers::WorkerPool,
    },
    error::{Result, StemError},
    model::residency::ResidencyCache,
    types::{ProcessingMethod, StemArtifact, StemKind},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Downloading,
    Stage(u8),
    Combining,
    Cleaning,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Created => f.write_str("created"),
            RunState::Downloading => f.write_str("downloading"),
            RunState::Stage(n) => write!(f, "stage{n}"),
            RunState::Combining => f.write_str("combining"),
            RunState::Cleaning => f.write_str("cleaning"),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub model_id: String,
    pub outputs: Vec<StemArtifact>,
}

/// Ephemeral state of one request. The working directory is removed when
/// the run is concluded or dropped, whichever comes first.
pub struct PipelineRun {
    task_id: String,
    workdir: TempDir,
    stages: Vec<StageRecord>,
    scratch: Vec<PathBuf>,
    current: Option<PathBuf>,
    state: RunState,
    fell_back: bool,
}

impl PipelineRun {
    pub fn new(task_id: impl Into<String>, temp_root: &Path) -> Result<Self> {
        let task_id = task_id.into();
        fs::create_dir_all(temp_root)?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{task_id}_"))
            .tempdir_in(temp_root)?;
        debug!(task = %task_id, dir = %workdir.path().display(), "run created");
        Ok(Self {
            task_id,
            workdir,
            stages: Vec::new(),
            scratch: Vec::new(),
            current: None,
            state: RunState::Created,
            fell_back: false,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    /// Most recent artifact produced by the run.
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    pub fn models_used(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.model_id.clone()).collect()
    }

    pub fn set_state(&mut self, state: RunState) {
        if self.state != state {
            info!(task = %self.task_id, from = %self.state, to = %state, "run state");
            self.state = state;
        }
    }

    /// Directory the downloader writes into.
    pub fn download_dir(&self) -> Result<PathBuf> {
        self.fresh_dir("download")
    }

    fn fresh_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.workdir().join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn stage_dir(&self) -> Result<PathBuf> {
        self.fresh_dir(&format!("stage{}", self.stages.len() + 1))
    }

    fn record(&mut self, model_id: &str, outputs: Vec<StemArtifact>, chosen: &Path) {
        self.stages.push(StageRecord {
            model_id: model_id.to_string(),
            outputs,
        });
        self.current = Some(chosen.to_path_buf());
    }

    fn track(&mut self, path: PathBuf) {
        self.current = Some(path.clone());
        self.scratch.push(path);
    }

    /// Deletes intermediate artifacts that nothing downstream needs.
    fn prune(&self, keep: &[&Path]) {
        let produced = self
            .stages
            .iter()
            .flat_map(|s| s.outputs.iter().map(|a| a.path.as_path()))
            .chain(self.scratch.iter().map(PathBuf::as_path));
        for path in produced {
            if keep.contains(&path) || !path.exists() {
                continue;
            }
            if let Err(e) = fs::remove_file(path) {
                warn!(task = %self.task_id, path = %path.display(), "could not prune artifact: {e}");
            }
        }
    }

    fn close(self) -> Result<()> {
        let task_id = self.task_id;
        let dir = self.workdir.path().to_path_buf();
        self.workdir.close().map_err(|e| {
            StemError::Anyhow(anyhow::anyhow!(
                "failed to remove working directory {} of task {task_id}: {e}",
                dir.display()
            ))
        })
    }
}

/// Which checkpoint each stage of each topology uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Karaoke split: instrumental plus a vocals stem for stage 2.
    pub vocal_split: String,
    /// Singing versus speech, run over the stage 1 vocals.
    pub singing_split: String,
    pub de_echo: String,
    pub instrumental: String,
    pub simple: String,
    /// Low-memory single stage used after an out-of-memory failure.
    pub fallback: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            vocal_split: "UVR_MDXNET_KARA_2.onnx".into(),
            singing_split: "UVR-BVE-4B_SN-44100-1.pth".into(),
            de_echo: "UVR-DeEcho-DeReverb.pth".into(),
            instrumental: "model_bs_roformer_ep_317_sdr_12.9755.ckpt".into(),
            simple: "UVR_MDXNET_Main.onnx".into(),
            fallback: "UVR-MDX-NET-Inst_HQ_3.onnx".into(),
        }
    }
}

impl Topology {
    /// Models a method may touch, fallback included.
    pub fn models_for(&self, method: ProcessingMethod) -> Vec<&str> {
        let mut ids = match method {
            ProcessingMethod::PreserveVocals => vec![
                self.vocal_split.as_str(),
                self.singing_split.as_str(),
                self.de_echo.as_str(),
            ],
            ProcessingMethod::InstrumentalOnly => vec![self.instrumental.as_str()],
            ProcessingMethod::Simple => vec![self.simple.as_str()],
        };
        if !ids.contains(&self.fallback.as_str()) {
            ids.push(self.fallback.as_str());
        }
        ids
    }

    pub fn all_models(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = ProcessingMethod::ALL
            .iter()
            .flat_map(|m| self.models_for(*m))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// First artifact whose label names `target`, else the first artifact at all.
pub fn select_artifact(outputs: &[StemArtifact], target: StemKind) -> Option<&StemArtifact> {
    outputs
        .iter()
        .find(|a| target.matches(&a.label))
        .or_else(|| outputs.first())
}

/// Outcome of a concluded run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub task_id: String,
    pub bytes: Vec<u8>,
    pub models_used: Vec<String>,
    pub final_model: Option<String>,
    pub fell_back: bool,
    pub state: RunState,
}

pub struct Orchestrator {
    cache: Arc<ResidencyCache>,
    adapter: Arc<dyn InferenceAdapter>,
    pool: WorkerPool,
    topology: Topology,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<ResidencyCache>,
        adapter: Arc<dyn InferenceAdapter>,
        pool: WorkerPool,
        topology: Topology,
    ) -> Self {
        Self {
            cache,
            adapter,
            pool,
            topology,
        }
    }

    pub fn cache(&self) -> &Arc<ResidencyCache> {
        &self.cache
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Runs the topology for `method`, falling back once to the low-memory
    /// model if the accelerator runs out of memory.
    pub async fn execute(
        &self,
        run: &mut PipelineRun,
        method: ProcessingMethod,
        input: &Path,
    ) -> Result<PathBuf> {
        let primary = match method {
            ProcessingMethod::PreserveVocals => self.run_preserve_vocals_pipeline(run, input).await,
            ProcessingMethod::InstrumentalOnly => {
                let model = self.topology.instrumental.clone();
                self.run_single_stage(run, &model, input, StemKind::Instrumental)
                    .await
            }
            ProcessingMethod::Simple => {
                let model = self.topology.simple.clone();
                self.run_single_stage(run, &model, input, StemKind::Instrumental)
                    .await
            }
        };

        match primary {
            Err(e) if e.is_out_of_memory() => {
                warn!(
                    task = run.task_id(),
                    %method,
                    fallback = %self.topology.fallback,
                    "{e}; falling back to single low-memory stage"
                );
                self.cache.evict_all().await;
                run.fell_back = true;
                let model = self.topology.fallback.clone();
                self.run_single_stage(run, &model, input, StemKind::Instrumental)
                    .await
            }
            other => other,
        }
    }

    /// One model over one file. Returns the artifact matching `target`.
    pub async fn run_single_stage(
        &self,
        run: &mut PipelineRun,
        model_id: &str,
        input: &Path,
        target: StemKind,
    ) -> Result<PathBuf> {
        let outputs = self.separate_stage(run, model_id, input).await?;
        let chosen = select_artifact(&outputs, target)
            .map(|a| a.path.clone())
            .ok_or_else(|| StemError::NoOutputArtifact {
                model_id: model_id.to_string(),
                expected: target.to_string(),
            })?;
        run.record(model_id, outputs, &chosen);
        Ok(chosen)
    }

    /// Karaoke split, singing/speech split, remix, de-echo.
    pub async fn run_preserve_vocals_pipeline(
        &self,
        run: &mut PipelineRun,
        input: &Path,
    ) -> Result<PathBuf> {
        let t = self.topology.clone();

        let split = self.separate_stage(run, &t.vocal_split, input).await?;
        let instrumental = select_artifact(&split, StemKind::Instrumental)
            .map(|a| a.path.clone())
            .ok_or_else(|| StemError::NoOutputArtifact {
                model_id: t.vocal_split.clone(),
                expected: StemKind::Instrumental.to_string(),
            })?;
        let vocals = split
            .iter()
            .find(|a| StemKind::Vocals.matches(&a.label))
            .or_else(|| split.iter().find(|a| a.path != instrumental))
            .map(|a| a.path.clone())
            .ok_or_else(|| StemError::NoOutputArtifact {
                model_id: t.vocal_split.clone(),
                expected: StemKind::Vocals.to_string(),
            })?;
        run.record(&t.vocal_split, split, &vocals);

        let singing = self
            .run_single_stage(run, &t.singing_split, &vocals, StemKind::Music)
            .await?;
        run.prune(&[instrumental.as_path(), singing.as_path()]);

        let combined = self.combine(run, &instrumental, &singing).await?;
        run.prune(&[combined.as_path()]);

        let cleaned = self
            .run_single_stage(run, &t.de_echo, &combined, StemKind::DeEcho)
            .await?;
        run.prune(&[cleaned.as_path()]);
        Ok(cleaned)
    }

    /// Reads the final artifact, removes the working directory and lets the
    /// cache shed models if the device is short on memory. Runs on every exit
    /// path; the original error is returned after cleanup.
    pub async fn conclude(
        &self,
        mut run: PipelineRun,
        outcome: Result<PathBuf>,
    ) -> Result<RunReport> {
        run.set_state(RunState::Cleaning);

        let read = match outcome {
            Ok(path) => self.pool.run_io(move || Ok(fs::read(path)?)).await,
            Err(e) => Err(e),
        };

        let task_id = run.task_id.clone();
        let models_used = run.models_used();
        let final_model = models_used.last().cloned();
        let fell_back = run.fell_back;
        let state = if read.is_ok() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        run.set_state(state);

        if let Err(e) = run.close() {
            warn!(task = %task_id, "{e}");
        }
        self.cache.relieve_pressure().await;

        let bytes = read?;
        info!(task = %task_id, models = ?models_used, fell_back, "run completed");
        Ok(RunReport {
            task_id,
            bytes,
            models_used,
            final_model,
            fell_back,
            state,
        })
    }

    async fn separate_stage(
        &self,
        run: &mut PipelineRun,
        model_id: &str,
        input: &Path,
    ) -> Result<Vec<StemArtifact>> {
        let stage = run.stages.len() as u8 + 1;
        run.set_state(RunState::Stage(stage));
        let out_dir = run.stage_dir()?;

        let lease = self.cache.acquire(model_id).await?;
        let adapter = self.adapter.clone();
        let input = input.to_path_buf();
        // The lease travels with the work and is returned as soon as the
        // separation finishes.
        let outputs = self
            .pool
            .run_inference(move || {
                adapter.separate(lease.descriptor(), lease.weights(), &input, &out_dir)
            })
            .await?;

        if outputs.is_empty() {
            return Err(StemError::NoOutputArtifact {
                model_id: model_id.to_string(),
                expected: "any stem".into(),
            });
        }
        debug!(task = run.task_id(), model = model_id, files = outputs.len(), "stage done");
        Ok(outputs)
    }

    async fn combine(
        &self,
        run: &mut PipelineRun,
        instrumental: &Path,
        singing: &Path,
    ) -> Result<PathBuf> {
        run.set_state(RunState::Combining);
        let out = run.fresh_dir("combine")?.join("combined.wav");

        let (base_path, overlay_path, out_path) =
            (instrumental.to_path_buf(), singing.to_path_buf(), out.clone());
        self.pool
            .run_io(move || {
                let base = read_audio(&base_path)?;
                let overlay = read_audio(&overlay_path)?;
                let mixed = combine_stems(&base, &overlay)?;
                write_wav(&out_path, &mixed, WavEncoding::Float32)
            })
            .await?;

        run.track(out.clone());
        Ok(out)
    }
}
