use crate::{
    error::{Result, StemError},
    types::{ArchitectureKind, StemKind},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc};

/// Immutable description of a checkpoint the service knows how to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Checkpoint filename, used as the cache key.
    pub id: String,
    /// Where the checkpoint can be fetched from.
    pub url: String,
    pub architecture: ArchitectureKind,
    pub primary_stem: StemKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    models: Vec<ModelDescriptor>,
}

const REGISTRY_JSON: &str = include_str!("../../models/registry.json");

/// Static set of known models, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<Arc<ModelDescriptor>>,
}

impl ModelRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_json(REGISTRY_JSON)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(json)
            .map_err(|e| StemError::Registry(format!("malformed registry: {e}")))?;
        Self::from_descriptors(file.models)
    }

    pub fn from_descriptors(models: Vec<ModelDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for m in &models {
            if !seen.insert(m.id.as_str()) {
                return Err(StemError::Registry(format!(
                    "model `{}` is declared twice",
                    m.id
                )));
            }
        }
        Ok(Self {
            models: models.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn get(&self, model_id: &str) -> Result<Arc<ModelDescriptor>> {
        self.models
            .iter()
            .find(|m| m.id == model_id)
            .cloned()
            .ok_or_else(|| StemError::UnknownModel(model_id.to_string()))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModelDescriptor>> {
        self.models.iter()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
