use axum::extract::FromRef;

use crate::service::ProcessingService;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use super::ServerConfig;

/// The processing service, absent until startup (model preload included)
/// has finished.
#[derive(Clone, Default)]
pub struct ServiceHandle(Arc<RwLock<Option<Arc<ProcessingService>>>>);

impl ServiceHandle {
    pub fn ready(service: Arc<ProcessingService>) -> Self {
        let handle = Self::default();
        handle.set(service);
        handle
    }

    pub fn get(&self) -> Option<Arc<ProcessingService>> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, service: Arc<ProcessingService>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(service);
    }

    pub fn is_ready(&self) -> bool {
        self.get().is_some()
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub service: ServiceHandle,
}

impl ServerState {
    pub fn new(config: ServerConfig, service: ServiceHandle) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            service,
        }
    }
}

impl FromRef<ServerState> for ServiceHandle {
    fn from_ref(input: &ServerState) -> Self {
        input.service.clone()
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}
