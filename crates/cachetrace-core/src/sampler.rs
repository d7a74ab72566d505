//! Sampling loops.
//!
//! Two modes, fixed for the lifetime of a session:
//!
//! - **Repeated probe** asks the adapter for exactly `max_samples` rows at a
//!   fixed slot cadence. The adapter may return fewer, never zero and never
//!   more; anything else is [`EngineError::InvalidSampleCount`].
//! - **Idle-gated trace** probes every slot but only keeps rows once some
//!   channel shows activity. After activity, up to `max_idle` trailing idle
//!   slots are kept so the end of the burst is visible, then the trace stops.
//!
//! Probe failures abort the run. The only early exit that still returns
//! rows is cancellation, which is checked between adapter calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::adapters::helpers::SlotPacer;
use crate::classify::Classifier;
use crate::error::{EngineError, Result};
use crate::probe::{Latency, ProbeAdapter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SamplerMode {
    RepeatedProbe,
    IdleGated {
        /// Consecutive idle slots tolerated after activity before stopping.
        max_idle: usize,
        /// Give up if no activity is seen within this many slots. `None`
        /// waits indefinitely (until cancelled).
        #[serde(default)]
        max_wait_slots: Option<u64>,
    },
}

impl std::fmt::Display for SamplerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RepeatedProbe => write!(f, "repeated_probe"),
            Self::IdleGated { .. } => write!(f, "idle_gated"),
        }
    }
}

/// Everything the sampler needs besides the adapter and classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub mode: SamplerMode,
    /// Hard ceiling on emitted rows.
    pub max_samples: usize,
    /// Minimum spacing between slots, in timer cycles.
    pub slot_time: u64,
    /// Rows per adapter call in repeated-probe mode. `None` requests every
    /// row in a single call.
    pub batch_slots: Option<usize>,
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_samples == 0 {
            return Err(EngineError::Config("max_samples must be at least 1".into()));
        }
        if self.batch_slots == Some(0) {
            return Err(EngineError::Config("batch_slots must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative stop flag, polled between adapter calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Idle gate
// ---------------------------------------------------------------------------

/// What to do with the slot just probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Leading idle: drop the slot and keep waiting.
    Skip,
    /// Keep the slot.
    Emit,
    /// Keep the slot, then stop: it completes the idle tail.
    EmitAndStop,
    /// Stop without keeping the slot (`max_idle == 0`).
    Stop,
}

/// Edge-triggered capture state machine.
#[derive(Debug, Clone)]
pub struct IdleGate {
    max_idle: usize,
    armed: bool,
    idle_run: usize,
}

impl IdleGate {
    pub fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            armed: false,
            idle_run: 0,
        }
    }

    /// Whether activity has been seen yet.
    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn observe(&mut self, active: bool) -> GateDecision {
        if active {
            self.armed = true;
            self.idle_run = 0;
            return GateDecision::Emit;
        }
        if !self.armed {
            return GateDecision::Skip;
        }
        if self.max_idle == 0 {
            return GateDecision::Stop;
        }
        self.idle_run += 1;
        if self.idle_run >= self.max_idle {
            GateDecision::EmitAndStop
        } else {
            GateDecision::Emit
        }
    }
}

// ---------------------------------------------------------------------------
// Result buffer
// ---------------------------------------------------------------------------

/// Raw latency rows plus their sample indices. Row-major, `width` cells per
/// row, capacity reserved up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    width: usize,
    indices: Vec<u64>,
    data: Vec<Latency>,
}

impl SampleBuffer {
    /// Reserve room for `max_samples` rows of `width` latencies.
    pub fn allocate(max_samples: usize, width: usize) -> Result<Self> {
        let failure = || EngineError::AllocationFailure {
            samples: max_samples,
            channels: width,
        };
        let cells = max_samples.checked_mul(width).ok_or_else(failure)?;
        let mut data = Vec::new();
        data.try_reserve_exact(cells).map_err(|_| failure())?;
        let mut indices = Vec::new();
        indices.try_reserve_exact(max_samples).map_err(|_| failure())?;
        Ok(Self {
            width,
            indices,
            data,
        })
    }

    /// Build from already-collected rows (used when reading a matrix back).
    pub fn from_parts(width: usize, indices: Vec<u64>, data: Vec<Latency>) -> Self {
        debug_assert_eq!(indices.len() * width, data.len());
        Self {
            width,
            indices,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn push(&mut self, index: u64, row: &[Latency]) {
        debug_assert_eq!(row.len(), self.width);
        debug_assert!(self.indices.last().is_none_or(|&last| last < index));
        self.indices.push(index);
        self.data.extend_from_slice(row);
    }

    pub fn index(&self, row: usize) -> u64 {
        self.indices[row]
    }

    pub fn row(&self, row: usize) -> &[Latency] {
        &self.data[row * self.width..(row + 1) * self.width]
    }

    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn rows(&self) -> impl Iterator<Item = (u64, &[Latency])> {
        self.indices
            .iter()
            .copied()
            .zip(self.data.chunks_exact(self.width.max(1)))
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Drives an adapter according to a [`SamplerConfig`].
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplerConfig,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Run to completion (or cancellation) and return the emitted rows.
    pub fn run<A>(
        &self,
        adapter: &mut A,
        classifier: &Classifier,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer>
    where
        A: ProbeAdapter + ?Sized,
    {
        let width = adapter.monitored();
        if width == 0 {
            return Err(EngineError::SessionState("no channels registered"));
        }
        if width != classifier.width() {
            return Err(EngineError::SessionState(
                "adapter and classifier disagree on channel count",
            ));
        }

        let buffer = SampleBuffer::allocate(self.config.max_samples, width)?;
        match self.config.mode {
            SamplerMode::RepeatedProbe => self.repeated(adapter, buffer, cancel),
            SamplerMode::IdleGated {
                max_idle,
                max_wait_slots,
            } => self.idle_gated(adapter, classifier, buffer, max_idle, max_wait_slots, cancel),
        }
    }

    fn repeated<A>(
        &self,
        adapter: &mut A,
        mut buffer: SampleBuffer,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer>
    where
        A: ProbeAdapter + ?Sized,
    {
        let max = self.config.max_samples;
        let width = buffer.width;
        let batch = self.config.batch_slots.unwrap_or(max).clamp(1, max);

        buffer.data.resize(max * width, 0);
        let mut done = 0usize;
        while done < max {
            if cancel.is_cancelled() {
                log::warn!("repeated probe cancelled after {done} samples");
                break;
            }
            let want = batch.min(max - done);
            let out = &mut buffer.data[done * width..(done + want) * width];
            let got = adapter
                .repeated_probe(want, out, self.config.slot_time)
                .map_err(|source| EngineError::ProbeFailure {
                    stage: "repeated probe",
                    source,
                })?;
            if got == 0 || got > want {
                return Err(EngineError::InvalidSampleCount {
                    returned: got,
                    max: want,
                });
            }
            log::debug!("repeated probe batch: {got}/{want} rows");
            done += got;
            if got < want {
                break;
            }
        }

        buffer.data.truncate(done * width);
        buffer.indices.extend(0..done as u64);
        Ok(buffer)
    }

    fn idle_gated<A>(
        &self,
        adapter: &mut A,
        classifier: &Classifier,
        mut buffer: SampleBuffer,
        max_idle: usize,
        max_wait_slots: Option<u64>,
        cancel: &CancelToken,
    ) -> Result<SampleBuffer>
    where
        A: ProbeAdapter + ?Sized,
    {
        let max = self.config.max_samples;
        let mut row = vec![0 as Latency; buffer.width];
        let mut gate = IdleGate::new(max_idle);
        let mut pacer = SlotPacer::new(self.config.slot_time);
        let mut slot: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                log::warn!("trace cancelled at slot {slot} with {} samples", buffer.len());
                break;
            }
            if !gate.armed() && max_wait_slots.is_some_and(|limit| slot >= limit) {
                log::info!("no activity within {slot} slots, giving up");
                break;
            }

            pacer.wait();
            adapter
                .probe_slot(&mut row)
                .map_err(|source| EngineError::ProbeFailure {
                    stage: "idle-gated trace",
                    source,
                })?;

            let stop = match gate.observe(classifier.any_active(&row)) {
                GateDecision::Skip => false,
                GateDecision::Emit => {
                    buffer.push(slot, &row);
                    false
                }
                GateDecision::EmitAndStop => {
                    buffer.push(slot, &row);
                    true
                }
                GateDecision::Stop => true,
            };
            if stop || buffer.len() >= max {
                break;
            }
            slot += 1;
        }

        log::debug!("trace finished after {} slots, {} kept", slot + 1, buffer.len());
        Ok(buffer)
    }
}
