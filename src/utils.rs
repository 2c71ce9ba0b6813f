use std::{env, path::PathBuf};

pub fn runner_script_path() -> String {
    env::var("VOCAL_REMOVER_RUNNER_SCRIPT").unwrap_or_else(|_| "separator_runner.py".to_string())
}

pub fn tmp_dir() -> PathBuf {
    env::var("VOCAL_REMOVER_TMP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("vocal-remover"))
}

/// Short opaque token naming a request's working directory and output file.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// I/O pool size: up to 4 workers, or 2 on small machines.
pub fn default_io_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if cpus <= 4 {
        cpus.min(2)
    } else {
        cpus.min(4)
    }
}
