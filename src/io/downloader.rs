use crate::error::{Result, StemError};
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, info};

/// Format sets a media download can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPreference {
    /// Audio-bearing formats up to 720p, extracted to WAV.
    Preferred,
    /// Whatever the source offers. Used as the retry after a preferred
    /// download fails.
    Permissive,
}

/// Fetches source media into a directory and returns the file it wrote.
/// Implementations block.
pub trait Downloader: Send + Sync {
    fn fetch(&self, url: &str, dest_dir: &Path, format: FormatPreference) -> Result<PathBuf>;

    fn name(&self) -> &'static str;
}

const EXTENSION_PRIORITY: [&str; 7] = ["wav", "mp4", "webm", "m4a", "mp3", "ogg", "flac"];

/// Picks the downloaded file in `dir`: the first extension in priority order,
/// otherwise any regular file.
pub fn find_downloaded_file(dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map_or(true, |ext| ext != "part"))
        .collect();
    files.sort();

    EXTENSION_PRIORITY
        .iter()
        .find_map(|wanted| {
            files
                .iter()
                .find(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case(wanted))
                })
                .cloned()
        })
        .or_else(|| files.into_iter().next())
}

/// `yt-dlp` driven downloader.
pub struct YtDlpDownloader {
    program: String,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(format: FormatPreference, dest_dir: &Path, url: &str) -> Vec<String> {
        let template = dest_dir.join("audio.%(ext)s").display().to_string();
        let mut args: Vec<String> = match format {
            FormatPreference::Preferred => vec![
                "--format".into(),
                "best[height<=720]/best[ext=mp4]/best[ext=webm]/best/worst".into(),
                "--extract-audio".into(),
                "--audio-format".into(),
                "wav".into(),
                "--retries".into(),
                "3".into(),
                "--socket-timeout".into(),
                "30".into(),
            ],
            FormatPreference::Permissive => vec![
                "--format".into(),
                "worst/best".into(),
                "--retries".into(),
                "1".into(),
            ],
        };
        args.extend([
            "--no-playlist".into(),
            "--quiet".into(),
            "--no-warnings".into(),
            "--output".into(),
            template,
            url.to_string(),
        ]);
        args
    }
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl Downloader for YtDlpDownloader {
    fn fetch(&self, url: &str, dest_dir: &Path, format: FormatPreference) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let failure = |reason: String| StemError::DownloadFailure {
            url: url.to_string(),
            reason,
        };

        debug!(%url, ?format, "invoking {}", self.program);
        let output = Command::new(&self.program)
            .args(Self::args(format, dest_dir, url))
            .output()
            .map_err(|e| failure(format!("cannot start {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let file = find_downloaded_file(dest_dir)
            .ok_or_else(|| failure("no audio file was produced".into()))?;
        info!(%url, file = %file.display(), "media downloaded");
        Ok(file)
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}
