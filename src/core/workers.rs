use crate::error::{Result, StemError};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounded blocking pools.
///
/// Accelerator work (load, separate) and file/network work get separate
/// permits so downloads never queue behind inference. The permit travels
/// into the blocking task: if the awaiting request goes away, the work still
/// finishes and keeps its slot until then.
#[derive(Clone)]
pub struct WorkerPool {
    inference: Arc<Semaphore>,
    io: Arc<Semaphore>,
    inference_size: usize,
    io_size: usize,
}

impl WorkerPool {
    pub fn new(inference_workers: usize, io_workers: usize) -> Self {
        let inference_size = inference_workers.max(1);
        let io_size = io_workers.max(1);
        Self {
            inference: Arc::new(Semaphore::new(inference_size)),
            io: Arc::new(Semaphore::new(io_size)),
            inference_size,
            io_size,
        }
    }

    pub async fn run_inference<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_on(&self.inference, work).await
    }

    pub async fn run_io<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_on(&self.io, work).await
    }

    pub fn inference_size(&self) -> usize {
        self.inference_size
    }

    pub fn io_size(&self) -> usize {
        self.io_size
    }
}

async fn run_on<F, T>(slots: &Arc<Semaphore>, work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let permit = slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| StemError::ServiceUnavailable("worker pool closed".into()))?;

    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        work()
    })
    .await?
}
