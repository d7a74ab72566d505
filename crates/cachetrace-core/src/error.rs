//! Error types for the sampling engine and the probe adapters.
//!
//! Every [`EngineError`] is fatal to the session that raised it. The session
//! tears down in order (buffers dropped, adapter released, workload joined)
//! and the caller surfaces a non-zero status.

use std::path::PathBuf;

use thiserror::Error;

use crate::channel::{ChannelId, Target};

/// Failure reported by a [`ProbeAdapter`](crate::probe::ProbeAdapter).
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter cannot do this on the current machine or for this target.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The caller-supplied output buffer cannot hold the requested rows.
    #[error("output buffer holds {have} latencies, need {need}")]
    BufferTooSmall { need: usize, have: usize },

    /// Probing was requested before any target was monitored.
    #[error("no targets are monitored")]
    NothingMonitored,

    /// The adapter handle was already released.
    #[error("adapter already released")]
    Released,

    /// Measurement-level failure (timing primitive, calibration, injected fault).
    #[error("{0}")]
    Failed(String),
}

/// Session-level error. Each variant names the stage that failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to prepare {adapter} adapter: {reason}")]
    AdapterInitFailure { adapter: String, reason: String },

    #[error("failed to monitor {target} as channel {channel}: {reason}")]
    MonitorFailure {
        channel: ChannelId,
        target: Target,
        reason: String,
    },

    #[error("threshold calibration failed: {0}")]
    CalibrationFailure(#[source] AdapterError),

    #[error("failed to allocate result buffer for {samples} samples x {channels} channels")]
    AllocationFailure { samples: usize, channels: usize },

    #[error("probe failed during {stage}: {source}")]
    ProbeFailure {
        stage: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("adapter returned invalid sample count {returned} (expected 1..={max})")]
    InvalidSampleCount { returned: usize, max: usize },

    #[error("failed to export results to {}: {source}", path.display())]
    ExportFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start workload thread: {0}")]
    ThreadFailure(#[source] std::io::Error),

    #[error("session misuse: {0}")]
    SessionState(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("malformed latency matrix at line {line}: {reason}")]
    MatrixFormat { line: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;
