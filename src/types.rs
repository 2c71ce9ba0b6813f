use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

/// Interleaved PCM samples.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioData {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames() as f64 / self.sample_rate as f64
        }
    }
}

/// Which pipeline topology runs for a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    /// Remove speech but keep singing vocals (4 stages).
    #[default]
    PreserveVocals,
    /// Remove all vocals.
    InstrumentalOnly,
    /// Basic speech removal with a single model.
    Simple,
}

impl ProcessingMethod {
    pub const ALL: [ProcessingMethod; 3] = [
        ProcessingMethod::PreserveVocals,
        ProcessingMethod::InstrumentalOnly,
        ProcessingMethod::Simple,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMethod::PreserveVocals => "preserve_vocals",
            ProcessingMethod::InstrumentalOnly => "instrumental_only",
            ProcessingMethod::Simple => "simple",
        }
    }
}

impl fmt::Display for ProcessingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessingMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown processing method `{s}`"))
    }
}

/// Network family of a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureKind {
    MdxNet,
    VrArch,
    Roformer,
    Onnx,
}

/// Stem a model is declared to isolate, also used to pick artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StemKind {
    Vocals,
    Instrumental,
    DeEcho,
    Music,
}

impl StemKind {
    /// Lower-case fragment expected inside an artifact label.
    pub fn label(&self) -> &'static str {
        match self {
            StemKind::Vocals => "vocals",
            StemKind::Instrumental => "instrumental",
            StemKind::DeEcho => "no echo",
            StemKind::Music => "music",
        }
    }

    pub fn matches(&self, artifact_label: &str) -> bool {
        artifact_label.to_lowercase().contains(self.label())
    }
}

impl fmt::Display for StemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One file written by a separation call, labeled by the model vendor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemArtifact {
    pub path: PathBuf,
    pub label: String,
}

/// Final product of a request.
#[derive(Clone, Debug)]
pub struct ProcessedAudio {
    pub task_id: String,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub models_used: Vec<String>,
    pub processing_time_secs: f64,
}
