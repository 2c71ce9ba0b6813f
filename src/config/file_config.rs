use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::core::pipeline::Topology;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub logging_level: Option<String>,
    pub temp_dir: Option<String>,
    pub model_dir: Option<String>,
    pub save_dir: Option<String>,
    pub preload: Option<Vec<String>>,

    pub memory: Option<MemoryConfig>,
    pub workers: Option<WorkersConfig>,
    pub runner: Option<RunnerConfig>,
    pub downloader: Option<DownloaderConfig>,
    pub topology: Option<Topology>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub threshold_gb: Option<f64>,
    /// "auto", "unbounded" or "single_slot"
    pub mode: Option<String>,
    pub latch: Option<bool>,
    /// "nvidia-smi" or "none"
    pub probe: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub io: Option<usize>,
    pub inference: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RunnerConfig {
    pub program: Option<String>,
    pub script: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DownloaderConfig {
    pub program: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
