use crate::error::{Result, StemError};
use directories::ProjectDirs;
use std::{env, path::PathBuf};

/// Where checkpoints are kept when neither the CLI nor the config file names
/// a directory. `VOCAL_REMOVER_MODEL_DIR` wins over the per-user cache.
pub fn default_model_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("VOCAL_REMOVER_MODEL_DIR") {
        return Ok(PathBuf::from(dir));
    }
    ProjectDirs::from("dev", "VocalRemover", "vocal-remover")
        .map(|proj| proj.cache_dir().join("checkpoints"))
        .ok_or(StemError::CacheDirUnavailable)
}
