use std::sync::Arc;
use tracing::info;

/// Receives `(label, bytes_done, bytes_total)`; `total` is 0 when unknown.
pub type ProgressFn = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

/// Default sink: one log line per completed tenth of the transfer.
pub fn log_progress() -> ProgressFn {
    Arc::new(|label: &str, done: u64, total: u64| {
        if total == 0 {
            if done == 0 {
                info!("{label}: download started (size unknown)");
            }
            return;
        }
        let step = (total / 10).max(1);
        if done == total || done % step < 64 * 1024 {
            let percent = (done as f64 / total as f64 * 100.0).round() as u64;
            info!(
                "{label}: {percent:>3}% ({:.2} MB / {:.2} MB)",
                done as f64 / 1_000_000.0,
                total as f64 / 1_000_000.0
            );
        }
    })
}

pub fn silent() -> ProgressFn {
    Arc::new(|_: &str, _: u64, _: u64| {})
}
