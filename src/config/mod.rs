mod file_config;

pub use file_config::{DownloaderConfig, FileConfig, MemoryConfig, RunnerConfig, WorkersConfig};

use crate::{
    core::{memory::DEFAULT_THRESHOLD_GB, pipeline::Topology},
    paths::default_model_dir,
    server::RequestsLoggingLevel,
    utils::{default_io_workers, runner_script_path, tmp_dir},
};
use anyhow::{bail, Result};
use clap::ValueEnum;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MemoryModeSetting {
    /// Re-evaluated from measured pressure on every model acquisition.
    #[default]
    Auto,
    Unbounded,
    SingleSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ProbeSetting {
    #[default]
    NvidiaSmi,
    /// No accelerator, memory is never under pressure.
    None,
}

/// CLI arguments that can be overridden by the TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub host: String,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub temp_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub save_dir: Option<PathBuf>,
    pub memory_threshold_gb: f64,
    pub memory_mode: MemoryModeSetting,
    pub memory_latch: bool,
    pub memory_probe: ProbeSetting,
    pub io_workers: Option<usize>,
    pub inference_workers: usize,
    pub runner_program: String,
    pub runner_script: Option<PathBuf>,
    pub downloader_program: String,
    pub preload: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            logging_level: RequestsLoggingLevel::default(),
            temp_dir: None,
            model_dir: None,
            save_dir: None,
            memory_threshold_gb: DEFAULT_THRESHOLD_GB,
            memory_mode: MemoryModeSetting::Auto,
            memory_latch: false,
            memory_probe: ProbeSetting::NvidiaSmi,
            io_workers: None,
            inference_workers: 1,
            runner_program: "python3".into(),
            runner_script: None,
            downloader_program: "yt-dlp".into(),
            preload: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemorySettings {
    pub threshold_gb: f64,
    pub mode: MemoryModeSetting,
    pub latch: bool,
    pub probe: ProbeSetting,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub temp_dir: PathBuf,
    pub model_dir: PathBuf,
    pub save_dir: Option<PathBuf>,
    pub memory: MemorySettings,
    pub io_workers: usize,
    pub inference_workers: usize,
    pub runner_program: String,
    pub runner_script: PathBuf,
    pub downloader_program: String,
    pub preload: Vec<String>,
    pub topology: Topology,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let host = file.host.unwrap_or_else(|| cli.host.clone());
        let port = file.port.unwrap_or(cli.port);

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let temp_dir = file
            .temp_dir
            .map(PathBuf::from)
            .or_else(|| cli.temp_dir.clone())
            .unwrap_or_else(tmp_dir);

        let model_dir = match file.model_dir.map(PathBuf::from).or_else(|| cli.model_dir.clone()) {
            Some(dir) => dir,
            None => default_model_dir()?,
        };
        if model_dir.exists() && !model_dir.is_dir() {
            bail!("model_dir is not a directory: {:?}", model_dir);
        }

        let save_dir = file
            .save_dir
            .map(PathBuf::from)
            .or_else(|| cli.save_dir.clone());

        let mem = file.memory.unwrap_or_default();
        let mode = match mem.mode {
            Some(s) => parse_enum::<MemoryModeSetting>("memory.mode", &s)?,
            None => cli.memory_mode,
        };
        let probe = match mem.probe {
            Some(s) => parse_enum::<ProbeSetting>("memory.probe", &s)?,
            None => cli.memory_probe,
        };
        let threshold_gb = mem.threshold_gb.unwrap_or(cli.memory_threshold_gb);
        if !threshold_gb.is_finite() || threshold_gb < 0.0 {
            bail!("memory.threshold_gb must be a non-negative number, got {threshold_gb}");
        }
        let memory = MemorySettings {
            threshold_gb,
            mode,
            latch: mem.latch.unwrap_or(cli.memory_latch),
            probe,
        };

        let workers = file.workers.unwrap_or_default();
        let io_workers = workers
            .io
            .or(cli.io_workers)
            .unwrap_or_else(default_io_workers);
        let inference_workers = workers.inference.unwrap_or(cli.inference_workers);
        if io_workers == 0 || inference_workers == 0 {
            bail!("worker pool sizes must be at least 1");
        }

        let runner = file.runner.unwrap_or_default();
        let runner_program = runner
            .program
            .unwrap_or_else(|| cli.runner_program.clone());
        let runner_script = runner
            .script
            .map(PathBuf::from)
            .or_else(|| cli.runner_script.clone())
            .unwrap_or_else(|| PathBuf::from(runner_script_path()));

        let downloader_program = file
            .downloader
            .and_then(|d| d.program)
            .unwrap_or_else(|| cli.downloader_program.clone());

        let preload = file.preload.unwrap_or_else(|| cli.preload.clone());
        let topology = file.topology.unwrap_or_default();

        Ok(Self {
            host,
            port,
            logging_level,
            temp_dir,
            model_dir,
            save_dir,
            memory,
            io_workers,
            inference_workers,
            runner_program,
            runner_script,
            downloader_program,
            preload,
            topology,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses a logging level string into RequestsLoggingLevel.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}

fn parse_enum<T: ValueEnum>(key: &str, value: &str) -> Result<T> {
    let normalized = value.replace('_', "-");
    match T::from_str(&normalized, true) {
        Ok(v) => Ok(v),
        Err(_) => bail!("invalid value `{value}` for {key}"),
    }
}
