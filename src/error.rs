use thiserror::Error;

/// Central error type for the vocal-remover-core crate.
#[derive(Debug, Error)]
pub enum StemError {
    // Generic fallback (wraps anyhow)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),

    // Domain-specific variants
    #[error("Model `{0}` not found in registry")]
    UnknownModel(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Failed to download audio from {url}: {reason}")]
    DownloadFailure { url: String, reason: String },

    #[error("Failed to load model {model_id}: {cause}")]
    ModelLoad { model_id: String, cause: String },

    #[error("Accelerator out of memory while running {model_id}: {detail}")]
    AcceleratorOutOfMemory { model_id: String, detail: String },

    #[error("Model {model_id} produced no output artifact (expected {expected})")]
    NoOutputArtifact { model_id: String, expected: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Checksum mismatch for {path}")]
    Checksum { path: String },

    #[error("Cache dir not available")]
    CacheDirUnavailable,
}

impl StemError {
    /// Stable tag reported to HTTP clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            StemError::Anyhow(_) => "internal",
            StemError::UnknownModel(_) => "unknown_model",
            StemError::Registry(_) => "registry",
            StemError::DownloadFailure { .. } => "download_failure",
            StemError::ModelLoad { .. } => "model_load_error",
            StemError::AcceleratorOutOfMemory { .. } => "accelerator_out_of_memory",
            StemError::NoOutputArtifact { .. } => "no_output_artifact",
            StemError::ServiceUnavailable(_) => "service_unavailable",
            StemError::InvalidRequest(_) => "invalid_request",
            StemError::Checksum { .. } => "checksum",
            StemError::CacheDirUnavailable => "cache_dir_unavailable",
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, StemError::AcceleratorOutOfMemory { .. })
    }
}

// --- Implement From conversions for common errors ---
impl From<std::io::Error> for StemError {
    fn from(e: std::io::Error) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<serde_json::Error> for StemError {
    fn from(e: serde_json::Error) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<reqwest::Error> for StemError {
    fn from(e: reqwest::Error) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<hex::FromHexError> for StemError {
    fn from(e: hex::FromHexError) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<hound::Error> for StemError {
    fn from(e: hound::Error) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<tokio::task::JoinError> for StemError {
    fn from(e: tokio::task::JoinError) -> Self {
        StemError::Anyhow(anyhow::anyhow!("worker task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, StemError>;
