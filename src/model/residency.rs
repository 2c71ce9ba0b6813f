//! Model residency: which checkpoints are loaded right now, and who is using
//! them.
//!
//! Reads of a resident model go through a per-entry gate. Every borrower holds
//! a read guard on the gate for as long as it keeps its [`ModelLease`];
//! eviction removes the entry from the map, marks it evicted, then takes the
//! write side, which waits for outstanding leases to drain before the weights
//! are released.
//!
//! Loads and evictions are serialized by one transaction lock per cache.
//! Lookups of a model that is already resident never touch that lock.

use crate::{
    core::{
        adapter::{InferenceAdapter, ModelWeights},
        memory::MemoryMonitor,
        workers::WorkerPool,
    },
    error::{Result, StemError},
    model::registry::{ModelDescriptor, ModelRegistry},
};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Instant,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedRwLockReadGuard, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Keep every loaded model.
    Unbounded,
    /// Evict every other model before loading a new one.
    SingleSlot,
}

impl MemoryMode {
    fn to_u8(self) -> u8 {
        match self {
            MemoryMode::Unbounded => 0,
            MemoryMode::SingleSlot => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 1 {
            MemoryMode::SingleSlot
        } else {
            MemoryMode::Unbounded
        }
    }
}

/// How the cache picks its [`MemoryMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModePolicy {
    /// Re-evaluated from measured pressure on every acquisition. With
    /// `latch`, the first pressure reading pins single-slot mode for the
    /// lifetime of the cache.
    Adaptive { latch: bool },
    Fixed(MemoryMode),
}

impl Default for ModePolicy {
    fn default() -> Self {
        ModePolicy::Adaptive { latch: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reload {
    #[default]
    IfAbsent,
    Force,
}

/// A loaded, ready-to-run model.
pub struct ResidentModel {
    descriptor: Arc<ModelDescriptor>,
    weights: ModelWeights,
    loaded_at: Instant,
    last_used: Mutex<Instant>,
}

impl ResidentModel {
    fn new(descriptor: Arc<ModelDescriptor>, weights: ModelWeights) -> Self {
        let now = Instant::now();
        Self {
            descriptor,
            weights,
            loaded_at: now,
            last_used: Mutex::new(now),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
struct Slot {
    model: Arc<ResidentModel>,
    gate: Arc<AsyncRwLock<()>>,
    evicted: Arc<AtomicBool>,
}

impl Slot {
    fn new(model: ResidentModel) -> Self {
        Self {
            model: Arc::new(model),
            gate: Arc::new(AsyncRwLock::new(())),
            evicted: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Borrowed access to a resident model. The cache will not release the
/// weights while any lease on them is alive.
pub struct ModelLease {
    // Declared before the guard so the model reference is gone by the time
    // a waiting evictor is woken.
    model: Arc<ResidentModel>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl ModelLease {
    pub fn id(&self) -> &str {
        &self.model.descriptor.id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.model.descriptor
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.model.weights
    }

    pub fn loaded_at(&self) -> Instant {
        self.model.loaded_at
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub evictions: u64,
    pub resident: Vec<String>,
    pub mode: MemoryMode,
}

pub struct ResidencyCache {
    registry: Arc<ModelRegistry>,
    adapter: Arc<dyn InferenceAdapter>,
    monitor: Arc<MemoryMonitor>,
    pool: WorkerPool,
    model_dir: PathBuf,
    policy: ModePolicy,
    entries: RwLock<HashMap<String, Slot>>,
    transaction: AsyncMutex<()>,
    latched: AtomicBool,
    last_mode: AtomicU8,
    counters: Counters,
}

impl ResidencyCache {
    pub fn new(
        registry: Arc<ModelRegistry>,
        adapter: Arc<dyn InferenceAdapter>,
        monitor: Arc<MemoryMonitor>,
        pool: WorkerPool,
        model_dir: PathBuf,
        policy: ModePolicy,
    ) -> Self {
        Self {
            registry,
            adapter,
            monitor,
            pool,
            model_dir,
            policy,
            entries: RwLock::new(HashMap::new()),
            transaction: AsyncMutex::new(()),
            latched: AtomicBool::new(false),
            last_mode: AtomicU8::new(MemoryMode::Unbounded.to_u8()),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn policy(&self) -> ModePolicy {
        self.policy
    }

    /// Returns a lease on a resident model, loading it if needed.
    ///
    /// A caller must not hold another lease while acquiring: in single-slot
    /// mode the load waits for every other lease to be returned.
    pub async fn acquire(&self, model_id: &str) -> Result<ModelLease> {
        self.acquire_with(model_id, Reload::IfAbsent).await
    }

    pub async fn acquire_with(&self, model_id: &str, reload: Reload) -> Result<ModelLease> {
        let descriptor = self.registry.get(model_id)?;

        if reload == Reload::IfAbsent {
            if let Some(lease) = self.try_lease(model_id).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(model = model_id, "cache hit");
                return Ok(lease);
            }
        }

        let _tx = self.transaction.lock().await;

        // Another caller may have loaded it while we waited for the lock.
        if reload == Reload::IfAbsent {
            if let Some(lease) = self.try_lease(model_id).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(model = model_id, "cache hit after wait");
                return Ok(lease);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        // Still present here means a forced reload or a dead backend.
        if self.is_resident(model_id) {
            if reload == Reload::IfAbsent {
                warn!(model = model_id, "resident model is no longer usable, reloading");
            }
            self.evict_where(|id| id == model_id).await;
        }
        let mode = self.decide_mode();
        if mode == MemoryMode::SingleSlot {
            let evicted = self.evict_where(|id| id != model_id).await;
            if evicted > 0 {
                self.reclaim().await;
            }
        }

        info!(model = model_id, ?mode, "loading model");
        let started = Instant::now();
        let adapter = self.adapter.clone();
        let load_descriptor = descriptor.clone();
        let model_dir = self.model_dir.clone();
        let weights = self
            .pool
            .run_inference(move || adapter.load(&load_descriptor, &model_dir))
            .await
            .map_err(|e| load_error(model_id, e))?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        info!(
            model = model_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model loaded"
        );

        let slot = Slot::new(ResidentModel::new(descriptor, weights));
        let guard = slot
            .gate
            .clone()
            .try_read_owned()
            .map_err(|_| StemError::Anyhow(anyhow::anyhow!("fresh cache entry was locked")))?;
        let lease = ModelLease {
            model: slot.model.clone(),
            _guard: guard,
        };
        self.write_entries().insert(model_id.to_string(), slot);
        Ok(lease)
    }

    /// Drops every resident model and asks the backend to reclaim memory.
    pub async fn evict_all(&self) -> usize {
        let _tx = self.transaction.lock().await;
        let evicted = self.evict_where(|_| true).await;
        self.reclaim().await;
        evicted
    }

    /// Post-run hook: clears the cache when the device is short on memory.
    pub async fn relieve_pressure(&self) -> usize {
        if !self.monitor.is_under_pressure() {
            return 0;
        }
        let evicted = self.evict_all().await;
        if evicted > 0 {
            warn!(evicted, "memory pressure after run, cache cleared");
        }
        evicted
    }

    /// Memory mode a load would use right now. Has no side effects.
    pub fn mode(&self) -> MemoryMode {
        match self.policy {
            ModePolicy::Fixed(mode) => mode,
            ModePolicy::Adaptive { .. } => {
                if self.monitor.is_under_pressure() || self.latched.load(Ordering::SeqCst) {
                    MemoryMode::SingleSlot
                } else {
                    MemoryMode::Unbounded
                }
            }
        }
    }

    /// Commits to a mode for the next load: latches if configured and
    /// records the transition.
    fn decide_mode(&self) -> MemoryMode {
        let mode = self.mode();
        if mode == MemoryMode::SingleSlot
            && matches!(self.policy, ModePolicy::Adaptive { latch: true })
        {
            self.latched.store(true, Ordering::SeqCst);
        }

        let previous = self.last_mode.swap(mode.to_u8(), Ordering::SeqCst);
        if previous != mode.to_u8() {
            match mode {
                MemoryMode::SingleSlot => warn!(
                    available = ?self.monitor.available_memory(),
                    "memory pressure detected, switching to single-slot residency"
                ),
                MemoryMode::Unbounded => info!("memory recovered, residency unbounded"),
            }
        }
        mode
    }

    pub fn is_resident(&self, model_id: &str) -> bool {
        self.read_entries().contains_key(model_id)
    }

    pub fn resident_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            resident: self.resident_ids(),
            mode: MemoryMode::from_u8(self.last_mode.load(Ordering::SeqCst)),
        }
    }

    async fn try_lease(&self, model_id: &str) -> Option<ModelLease> {
        loop {
            let slot = self.read_entries().get(model_id).cloned()?;
            let guard = slot.gate.clone().read_owned().await;
            if slot.evicted.load(Ordering::SeqCst) {
                // Lost a race with eviction; look again.
                drop(guard);
                continue;
            }
            if !self
                .adapter
                .is_alive(&slot.model.descriptor, &slot.model.weights)
            {
                return None;
            }
            slot.model.touch();
            return Some(ModelLease {
                model: slot.model,
                _guard: guard,
            });
        }
    }

    /// Must be called with the transaction lock held.
    async fn evict_where(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let victims: Vec<(String, Slot)> = {
            let mut entries = self.write_entries();
            let ids: Vec<String> = entries
                .keys()
                .filter(|id| predicate(id.as_str()))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let count = victims.len();
        for (id, slot) in victims {
            slot.evicted.store(true, Ordering::SeqCst);
            let drained = slot.gate.write().await;
            self.release(slot.model).await;
            drop(drained);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            info!(model = %id, "model evicted");
        }
        count
    }

    async fn release(&self, model: Arc<ResidentModel>) {
        match Arc::try_unwrap(model) {
            Ok(model) => {
                let adapter = self.adapter.clone();
                let ResidentModel {
                    descriptor,
                    weights,
                    ..
                } = model;
                let id = descriptor.id.clone();
                let released =
                    tokio::task::spawn_blocking(move || adapter.release(&descriptor, weights))
                        .await;
                if let Err(e) = released {
                    warn!(model = %id, "releasing weights failed: {e}");
                }
            }
            Err(shared) => warn!(
                model = %shared.descriptor.id,
                "evicted model still referenced, weights drop with the last reference"
            ),
        }
    }

    async fn reclaim(&self) {
        let adapter = self.adapter.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || adapter.reclaim()).await {
            warn!("memory reclamation failed: {e}");
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_error(model_id: &str, e: StemError) -> StemError {
    match e {
        e @ (StemError::AcceleratorOutOfMemory { .. } | StemError::ModelLoad { .. }) => e,
        other => StemError::ModelLoad {
            model_id: model_id.to_string(),
            cause: other.to_string(),
        },
    }
}
