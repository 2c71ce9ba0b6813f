use crate::{
    error::{Result, StemError},
    model::registry::ModelDescriptor,
    types::StemArtifact,
};
use serde::{Deserialize, Serialize};
use std::{any::Any, path::Path};

/// Opaque loaded weights, owned by the residency cache entry holding them.
pub type ModelWeights = Box<dyn Any + Send + Sync>;

/// Boundary to the separation backend.
///
/// All methods block; callers run them on the worker pool. The output
/// directory is passed per call so one set of weights can serve concurrent
/// separations without shared mutable state.
pub trait InferenceAdapter: Send + Sync {
    fn load(&self, descriptor: &ModelDescriptor, model_dir: &Path) -> Result<ModelWeights>;

    fn separate(
        &self,
        descriptor: &ModelDescriptor,
        weights: &ModelWeights,
        input: &Path,
        output_dir: &Path,
    ) -> Result<Vec<StemArtifact>>;

    /// Whether `weights` can still serve requests. Must not block; the cache
    /// calls it on every lookup and reloads entries that report false.
    fn is_alive(&self, descriptor: &ModelDescriptor, weights: &ModelWeights) -> bool {
        let _ = (descriptor, weights);
        true
    }

    /// Frees the accelerator memory held by `weights`.
    fn release(&self, descriptor: &ModelDescriptor, weights: ModelWeights) {
        let _ = descriptor;
        drop(weights);
    }

    /// Asks the backend to return freed memory to the device.
    fn reclaim(&self) {}

    fn name(&self) -> &'static str;
}

/// Failure classes reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    OutOfMemory,
    UnsupportedInput,
    CorruptCheckpoint,
    Other,
}

impl FailureKind {
    pub fn into_error(self, model_id: &str, message: impl Into<String>) -> StemError {
        let message = message.into();
        match self {
            FailureKind::OutOfMemory => StemError::AcceleratorOutOfMemory {
                model_id: model_id.to_string(),
                detail: message,
            },
            FailureKind::CorruptCheckpoint => StemError::ModelLoad {
                model_id: model_id.to_string(),
                cause: format!("corrupt checkpoint: {message}"),
            },
            FailureKind::UnsupportedInput => StemError::Anyhow(anyhow::anyhow!(
                "{model_id} cannot read input: {message}"
            )),
            FailureKind::Other => {
                StemError::Anyhow(anyhow::anyhow!("{model_id} failed: {message}"))
            }
        }
    }
}

/// Recovers the adapter's concrete weight type.
pub fn downcast_weights<'a, T: 'static>(
    descriptor: &ModelDescriptor,
    weights: &'a ModelWeights,
) -> Result<&'a T> {
    weights.downcast_ref::<T>().ok_or_else(|| {
        StemError::Anyhow(anyhow::anyhow!(
            "weights for {} were not produced by this adapter",
            descriptor.id
        ))
    })
}
