//! Inference adapter backed by an external separation runner.
//!
//! Each resident model is one long-lived runner process that has the
//! checkpoint loaded. Requests and responses are single JSON lines on the
//! child's stdin and stdout. Killing the process is what frees its device
//! memory.

use crate::{
    core::adapter::{downcast_weights, FailureKind, InferenceAdapter, ModelWeights},
    error::{Result, StemError},
    io::progress::{log_progress, ProgressFn},
    model::{model_manager::ensure_checkpoint, registry::ModelDescriptor},
    types::StemArtifact,
    utils::runner_script_path,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, TryLockError,
    },
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub program: String,
    pub script: PathBuf,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            script: PathBuf::from(runner_script_path()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum RunnerEvent {
    Ready,
    Error { kind: FailureKind, message: String },
}

#[derive(Debug, Serialize)]
struct SeparateRequest<'a> {
    input: &'a Path,
    output_dir: &'a Path,
}

#[derive(Debug, Deserialize)]
struct SeparateResponse {
    ok: bool,
    #[serde(default)]
    files: Vec<StemArtifact>,
    #[serde(default)]
    kind: Option<FailureKind>,
    #[serde(default)]
    message: String,
}

struct RunnerPipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl RunnerPipes {
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

/// Weights handle: the runner process that holds the checkpoint.
pub struct RunnerProcess {
    model_id: String,
    pipes: Mutex<RunnerPipes>,
    closed: AtomicBool,
}

impl RunnerProcess {
    /// False once the child has exited or closed its output. A process busy
    /// with a request counts as alive.
    pub fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut pipes = match self.pipes.try_lock() {
            Ok(pipes) => pipes,
            Err(TryLockError::WouldBlock) => return true,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        matches!(pipes.child.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> u32 {
        self.pipes.lock().unwrap_or_else(|e| e.into_inner()).child.id()
    }

    fn shutdown(&self) {
        let mut pipes = self.pipes.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(Some(_)) = pipes.child.try_wait() {
            return;
        }
        if let Err(e) = pipes.child.kill() {
            warn!(model = %self.model_id, "could not stop runner: {e}");
        }
        let _ = pipes.child.wait();
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct RunnerAdapter {
    settings: RunnerSettings,
    progress: ProgressFn,
}

impl RunnerAdapter {
    pub fn new(settings: RunnerSettings) -> Self {
        Self {
            settings,
            progress: log_progress(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    fn spawn(&self, descriptor: &ModelDescriptor, model_dir: &Path) -> Result<RunnerPipes> {
        let load_err = |cause: String| StemError::ModelLoad {
            model_id: descriptor.id.clone(),
            cause,
        };

        let mut child = Command::new(&self.settings.program)
            .arg(&self.settings.script)
            .arg("--model-file")
            .arg(&descriptor.id)
            .arg("--model-dir")
            .arg(model_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| load_err(format!("cannot start {}: {e}", self.settings.program)))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(RunnerPipes {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
            _ => {
                let _ = child.kill();
                Err(load_err("runner pipes unavailable".into()))
            }
        }
    }
}

impl InferenceAdapter for RunnerAdapter {
    fn load(&self, descriptor: &ModelDescriptor, model_dir: &Path) -> Result<ModelWeights> {
        let checkpoint = ensure_checkpoint(descriptor, model_dir, &self.progress)
            .map_err(|e| StemError::ModelLoad {
                model_id: descriptor.id.clone(),
                cause: e.to_string(),
            })?;
        debug!(model = %descriptor.id, path = %checkpoint.display(), "checkpoint ready");

        let mut pipes = self.spawn(descriptor, model_dir)?;
        let process_of = |pipes: RunnerPipes| RunnerProcess {
            model_id: descriptor.id.clone(),
            pipes: Mutex::new(pipes),
            closed: AtomicBool::new(false),
        };

        loop {
            let Some(line) = pipes.read_line()? else {
                let status = pipes.child.wait()?;
                return Err(StemError::ModelLoad {
                    model_id: descriptor.id.clone(),
                    cause: format!("runner exited before becoming ready ({status})"),
                });
            };
            match serde_json::from_str::<RunnerEvent>(&line) {
                Ok(RunnerEvent::Ready) => break,
                Ok(RunnerEvent::Error { kind, message }) => {
                    // Dropping the handle stops the child.
                    drop(process_of(pipes));
                    return Err(kind.into_error(&descriptor.id, message));
                }
                Err(_) => debug!(model = %descriptor.id, "runner: {line}"),
            }
        }

        let process = process_of(pipes);
        info!(model = %descriptor.id, pid = process.pid(), "runner ready");
        Ok(Box::new(process))
    }

    fn separate(
        &self,
        descriptor: &ModelDescriptor,
        weights: &ModelWeights,
        input: &Path,
        output_dir: &Path,
    ) -> Result<Vec<StemArtifact>> {
        let process = downcast_weights::<RunnerProcess>(descriptor, weights)?;
        let mut pipes = process.pipes.lock().unwrap_or_else(|e| e.into_inner());

        let request = serde_json::to_string(&SeparateRequest { input, output_dir })?;
        if let Err(e) = writeln!(pipes.stdin, "{request}").and_then(|_| pipes.stdin.flush()) {
            process.closed.store(true, Ordering::SeqCst);
            return Err(e.into());
        }

        let response = loop {
            let Some(line) = pipes.read_line()? else {
                process.closed.store(true, Ordering::SeqCst);
                return Err(FailureKind::Other.into_error(&descriptor.id, "runner exited mid-request"));
            };
            match serde_json::from_str::<SeparateResponse>(&line) {
                Ok(response) => break response,
                Err(_) => debug!(model = %descriptor.id, "runner: {line}"),
            }
        };

        if !response.ok {
            let kind = response.kind.unwrap_or(FailureKind::Other);
            return Err(kind.into_error(&descriptor.id, response.message));
        }

        Ok(response
            .files
            .into_iter()
            .map(|a| StemArtifact {
                path: if a.path.is_relative() {
                    output_dir.join(a.path)
                } else {
                    a.path
                },
                label: a.label,
            })
            .collect())
    }

    fn is_alive(&self, descriptor: &ModelDescriptor, weights: &ModelWeights) -> bool {
        downcast_weights::<RunnerProcess>(descriptor, weights)
            .map(RunnerProcess::is_alive)
            .unwrap_or(false)
    }

    fn release(&self, descriptor: &ModelDescriptor, weights: ModelWeights) {
        match weights.downcast::<RunnerProcess>() {
            Ok(process) => {
                info!(model = %descriptor.id, pid = process.pid(), "stopping runner");
                process.shutdown();
            }
            Err(other) => drop(other),
        }
    }

    fn name(&self) -> &'static str {
        "runner"
    }
}
