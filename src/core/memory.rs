//! Accelerator memory monitoring.
//!
//! The monitor is consulted before every load decision, so probes must be
//! cheap and must not block. [`NvidiaSmiProbe`] refreshes its reading on a
//! background task.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    process::Command,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
pub const DEFAULT_THRESHOLD_GB: f64 = 6.0;
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(1);
const UNLIMITED: u64 = u64::MAX;

fn encode(memory: AvailableMemory) -> u64 {
    match memory {
        AvailableMemory::Unlimited => UNLIMITED,
        AvailableMemory::Bytes(b) => b.min(UNLIMITED - 1),
    }
}

fn decode(raw: u64) -> AvailableMemory {
    match raw {
        UNLIMITED => AvailableMemory::Unlimited,
        b => AvailableMemory::Bytes(b),
    }
}

/// Free accelerator memory. `Unlimited` when no accelerator is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailableMemory {
    Unlimited,
    Bytes(u64),
}

impl AvailableMemory {
    pub fn as_gb(&self) -> Option<f64> {
        match self {
            AvailableMemory::Unlimited => None,
            AvailableMemory::Bytes(b) => Some(*b as f64 / BYTES_PER_GB),
        }
    }
}

pub trait MemoryProbe: Send + Sync {
    fn free_memory(&self) -> AvailableMemory;

    fn has_accelerator(&self) -> bool {
        !matches!(self.free_memory(), AvailableMemory::Unlimited)
    }

    fn name(&self) -> &'static str;
}

/// CPU-only hosts.
pub struct NoAccelerator;

impl MemoryProbe for NoAccelerator {
    fn free_memory(&self) -> AvailableMemory {
        AvailableMemory::Unlimited
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Settable probe for tests and for pinning the service to a known budget.
pub struct FixedProbe {
    bytes: AtomicU64,
}

impl FixedProbe {
    pub fn unlimited() -> Self {
        Self {
            bytes: AtomicU64::new(UNLIMITED),
        }
    }

    pub fn gb(gb: f64) -> Self {
        let probe = Self::unlimited();
        probe.set_gb(gb);
        probe
    }

    pub fn set_gb(&self, gb: f64) {
        self.bytes
            .store((gb * BYTES_PER_GB) as u64, Ordering::SeqCst);
    }

    pub fn set_unlimited(&self) {
        self.bytes.store(UNLIMITED, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedProbe {
    fn free_memory(&self) -> AvailableMemory {
        decode(self.bytes.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Reads the first GPU through `nvidia-smi`. A host where the tool cannot
/// be spawned is treated as having no accelerator.
///
/// The tool runs only in [`NvidiaSmiProbe::refresh`]; `free_memory` returns
/// the last stored reading and never spawns a process.
pub struct NvidiaSmiProbe {
    program: String,
    reading: AtomicU64,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self::with_program("nvidia-smi")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            reading: AtomicU64::new(UNLIMITED),
        }
    }

    /// Takes a first reading, then keeps refreshing every `every` on a
    /// background task for as long as the probe is alive.
    pub async fn start(program: impl Into<String>, every: Duration) -> Arc<Self> {
        let probe = Arc::new(Self::with_program(program));
        probe.refresh().await;
        let _ = probe.spawn_refresh(every);
        probe
    }

    pub fn spawn_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(probe) = weak.upgrade() else {
                    break;
                };
                probe.refresh().await;
            }
        })
    }

    /// Runs the query tool and stores the result.
    pub async fn refresh(&self) -> AvailableMemory {
        let reading = self.query().await;
        self.reading.store(encode(reading), Ordering::SeqCst);
        reading
    }

    async fn query(&self) -> AvailableMemory {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=memory.free",
                "--format=csv,noheader,nounits",
            ])
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout);
                match parse_free_mib(&text) {
                    Some(mib) => AvailableMemory::Bytes(mib * 1024 * 1024),
                    None => {
                        debug!("unparseable {} output: {text:?}", self.program);
                        AvailableMemory::Unlimited
                    }
                }
            }
            _ => AvailableMemory::Unlimited,
        }
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for NvidiaSmiProbe {
    fn free_memory(&self) -> AvailableMemory {
        decode(self.reading.load(Ordering::SeqCst))
    }

    fn name(&self) -> &'static str {
        "nvidia-smi"
    }
}

/// First line of `nvidia-smi --format=csv,noheader,nounits`, in MiB.
pub fn parse_free_mib(output: &str) -> Option<u64> {
    output.lines().next()?.trim().parse().ok()
}

pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    threshold_bytes: u64,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, threshold_gb: f64) -> Self {
        Self {
            probe,
            threshold_bytes: (threshold_gb.max(0.0) * BYTES_PER_GB) as u64,
        }
    }

    pub fn available_memory(&self) -> AvailableMemory {
        self.probe.free_memory()
    }

    pub fn is_under_pressure(&self) -> bool {
        match self.available_memory() {
            AvailableMemory::Unlimited => false,
            AvailableMemory::Bytes(b) => b < self.threshold_bytes,
        }
    }

    pub fn has_accelerator(&self) -> bool {
        self.probe.has_accelerator()
    }

    pub fn threshold_gb(&self) -> f64 {
        self.threshold_bytes as f64 / BYTES_PER_GB
    }

    pub fn probe_name(&self) -> &'static str {
        self.probe.name()
    }
}
