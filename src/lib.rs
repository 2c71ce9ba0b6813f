//! # vocal-remover-core
//!
//! Speech and vocal removal for downloaded media. Source-separation models
//! are kept resident on the accelerator by a [`ResidencyCache`] that shrinks
//! to a single slot under memory pressure; the [`Orchestrator`] chains them
//! into single- or multi-stage pipelines and the [`ProcessingService`] puts a
//! download step in front and an HTTP surface around it.

pub mod config;
pub mod core;
pub mod error;
pub mod io;
pub mod model;
pub mod paths;
pub mod server;
pub mod service;
pub mod types;
pub mod utils;

pub use crate::{
    core::{
        adapter::{downcast_weights, FailureKind, InferenceAdapter, ModelWeights},
        audio::{encode_wav, read_audio, write_wav, WavEncoding},
        memory::{AvailableMemory, MemoryMonitor, MemoryProbe},
        pipeline::{Orchestrator, PipelineRun, RunReport, RunState, Topology},
        runner::{RunnerAdapter, RunnerSettings},
        workers::WorkerPool,
    },
    error::{Result, StemError},
    io::downloader::{Downloader, FormatPreference, YtDlpDownloader},
    model::{
        registry::{ModelDescriptor, ModelRegistry},
        residency::{MemoryMode, ModePolicy, ModelLease, Reload, ResidencyCache},
    },
    service::{ExtractOptions, ProcessingService},
    types::{AudioData, ProcessedAudio, ProcessingMethod, StemArtifact, StemKind},
};
