//! # cachetrace-core
//!
//! **Watch cache lines and cache sets light up.**
//!
//! `cachetrace-core` is a cache-timing side-channel sampling engine. It
//! repeatedly times accesses to chosen cache lines (Flush+Reload) or cache
//! sets (Prime+Probe), classifies every sample against a calibrated
//! threshold, and produces a time series showing when a co-resident
//! workload touched them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use cachetrace_core::{CancelToken, EngineConfig, Session, Target, ThresholdSource};
//! use cachetrace_core::adapters::{self, AdapterKind};
//!
//! # fn main() -> cachetrace_core::Result<()> {
//! let config = EngineConfig::default();
//! let mut session = Session::new(adapters::prepare(AdapterKind::PrimeProbe)?);
//! session.register_all([0, 16, 32].map(Target::Set))?;
//! session.calibrate(ThresholdSource::Calibrate)?;
//!
//! let trace = session.run(&config.idle_gated(), &CancelToken::new())?;
//! print!("{}", trace.to_report());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Registry → Calibrator → Sampler → Classifier → Trace
//!
//! Two sampling modes:
//! - **Repeated probe**: a fixed number of gap-free rows at a fixed slot
//!   cadence.
//! - **Idle-gated trace**: nothing is kept until some channel shows
//!   activity; afterwards every slot is kept until `max_idle` consecutive
//!   idle slots close the trace.
//!
//! Every cache primitive implements the [`ProbeAdapter`] trait. A
//! [`Session`] owns exactly one adapter and releases it exactly once.
//! Address targets point into a [`MemoryRegion`] that the session retains
//! for as long as the adapter may read it.

pub mod adapters;
pub mod analysis;
pub mod calibrate;
pub mod channel;
pub mod classify;
pub mod config;
pub mod error;
pub mod probe;
pub mod record;
pub mod sampler;
pub mod session;
pub mod target;
pub mod trace;
pub mod workload;

pub use adapters::{AdapterKind, AdapterStatus, FlushReload, PrimeProbe, ScriptedAdapter};
pub use analysis::{LatencyMatrix, MatrixSummary, load_matrix, read_matrix, summarize};
pub use calibrate::{Threshold, ThresholdSource};
pub use channel::{Channel, ChannelId, ChannelKind, ChannelRegistry, Target};
pub use classify::{Classification, Classifier, Label, classify_latency};
pub use config::EngineConfig;
pub use error::{AdapterError, EngineError, Result};
pub use probe::{AdapterInfo, INVALID_LATENCY, Latency, Platform, ProbeAdapter};
pub use record::{RecordConfig, Recorder, SessionMeta};
pub use sampler::{CancelToken, SampleBuffer, SamplerConfig, SamplerMode};
pub use session::Session;
pub use target::{MemoryRegion, SymbolTarget, TargetBuffer};
pub use trace::{Sample, Trace};
pub use workload::{CacheToucher, Workload, WorkloadConfig, WorkloadGenerator, WorkloadHandle};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
