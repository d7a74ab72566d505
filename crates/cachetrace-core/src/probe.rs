//! The probe primitive capability set.
//!
//! Every cache side channel implements [`ProbeAdapter`]: monitor targets,
//! report a hit/miss threshold, and fill rows of latencies at a fixed slot
//! cadence. The engine never touches the cache itself; it only drives an
//! adapter and classifies what comes back.

use std::sync::Arc;

use crate::adapters::helpers::SlotPacer;
use crate::channel::{ChannelKind, Target};
use crate::error::AdapterError;
use crate::target::MemoryRegion;

/// Access latency in timer cycles.
pub type Latency = u16;

/// Latency value meaning "invalid / unmeasured". Never a real measurement.
pub const INVALID_LATENCY: Latency = 0;

/// Architecture an adapter needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Works anywhere (software adapters).
    Any,
    /// Needs `clflush`/`rdtscp` on x86_64.
    X86_64,
}

impl Platform {
    pub fn is_current(self) -> bool {
        match self {
            Self::Any => true,
            Self::X86_64 => cfg!(target_arch = "x86_64"),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::X86_64 => write!(f, "x86_64"),
        }
    }
}

/// Static description of an adapter.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Unique identifier (e.g. `"flush_reload"`).
    pub name: &'static str,
    /// One-line human-readable description.
    pub description: &'static str,
    /// How the channel leaks: what the hardware does between probes.
    pub mechanism: &'static str,
    /// Channel granularity this adapter monitors.
    pub kind: ChannelKind,
    /// Architecture requirement.
    pub platform: Platform,
    /// Upper bound on monitored targets, if the adapter has one.
    pub max_targets: Option<usize>,
}

/// Capability set of a cache probe primitive.
///
/// Adapters are owned by exactly one session and driven from one thread; the
/// trait is `Send` so a session can move between threads, never shared.
pub trait ProbeAdapter: Send {
    /// Adapter metadata.
    fn info(&self) -> &AdapterInfo;

    /// Hold `region` until release. Adapters that read address targets only
    /// monitor addresses inside a region they hold; the rest ignore it.
    fn retain(&mut self, region: Arc<dyn MemoryRegion>) {
        drop(region);
    }

    /// Start monitoring `target`. Returns `false` if the target cannot be
    /// monitored (address outside every retained region, set out of range,
    /// already monitored).
    fn monitor(&mut self, target: Target) -> bool;

    /// Number of targets currently monitored; the width of every row.
    fn monitored(&self) -> usize;

    /// Measure the latency boundary separating fast from slow accesses.
    fn probe_threshold(&mut self) -> Result<Latency, AdapterError>;

    /// Probe every monitored target once, writing one latency per target in
    /// monitor order into `out[..self.monitored()]`.
    fn probe_slot(&mut self, out: &mut [Latency]) -> Result<(), AdapterError>;

    /// Probe `max_samples` rows into `out`, spacing slots at least
    /// `slot_time` cycles apart. Returns the number of rows written.
    fn repeated_probe(
        &mut self,
        max_samples: usize,
        out: &mut [Latency],
        slot_time: u64,
    ) -> Result<usize, AdapterError> {
        let width = self.monitored();
        if width == 0 {
            return Err(AdapterError::NothingMonitored);
        }
        let need = max_samples.saturating_mul(width);
        if out.len() < need {
            return Err(AdapterError::BufferTooSmall {
                need,
                have: out.len(),
            });
        }

        let mut pacer = SlotPacer::new(slot_time);
        for row in out[..need].chunks_exact_mut(width) {
            pacer.wait();
            self.probe_slot(row)?;
        }
        Ok(max_samples)
    }

    /// Give back every resource the adapter holds. Called exactly once by
    /// the owning session.
    fn release(&mut self);

    /// Convenience: name from info.
    fn name(&self) -> &'static str {
        self.info().name
    }
}
