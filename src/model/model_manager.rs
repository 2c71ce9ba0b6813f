use crate::{
    error::{Result, StemError},
    io::{
        crypto::verify_sha256,
        net::{download_with_progress, http_client},
        progress::ProgressFn,
    },
    model::registry::ModelDescriptor,
};

use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Makes sure the checkpoint for `descriptor` is present in `model_dir`,
/// downloading it from the descriptor's source when missing or corrupt.
pub fn ensure_checkpoint(
    descriptor: &ModelDescriptor,
    model_dir: &Path,
    progress: &ProgressFn,
) -> Result<PathBuf> {
    fs::create_dir_all(model_dir)?;
    let local_path = model_dir.join(&descriptor.id);

    let need_download = match (&descriptor.sha256, local_path.exists()) {
        (_, false) => true,
        (None, true) => false,
        (Some(sha), true) => !matches!(verify_sha256(&local_path, sha), Ok(true)),
    };

    if !need_download {
        return Ok(local_path);
    }

    info!(model = %descriptor.id, url = %descriptor.url, "fetching checkpoint");
    let client = http_client()?;
    download_with_progress(&client, &descriptor.url, &local_path, &descriptor.id, progress)?;

    if let Some(sha) = &descriptor.sha256 {
        if !verify_sha256(&local_path, sha)? {
            if let Err(e) = fs::remove_file(&local_path) {
                warn!(
                    "could not remove corrupt checkpoint {}: {e}",
                    local_path.display()
                );
            }
            return Err(StemError::Checksum {
                path: local_path.display().to_string(),
            });
        }
    }

    Ok(local_path)
}
