//! Prime+Probe on the L1 data cache: set-granularity channel.
//!
//! The adapter owns one eviction buffer with a line in every way of every L1
//! set. Probing a set reads its ways under rdtscp, which both measures and
//! re-primes it. If another thread displaced one of our lines since the last
//! slot, a way misses and the probe comes back slow.

use crate::adapters::helpers::{median, to_latency};
use crate::channel::{ChannelKind, Target};
use crate::error::{AdapterError, EngineError};
use crate::probe::{AdapterInfo, Latency, Platform, ProbeAdapter};
use crate::target::{CACHE_LINE_SIZE, PAGE_SIZE, TargetBuffer};

/// Number of L1D sets (32 KiB, 8-way, 64-byte lines).
pub const L1_SETS: usize = 64;
/// L1D associativity.
pub const L1_WAYS: usize = 8;
/// Byte distance between two lines that map to the same L1 set.
const WAY_STRIDE: usize = L1_SETS * CACHE_LINE_SIZE;

const CALIBRATION_ROUNDS: usize = 1000;

static PRIME_PROBE_INFO: AdapterInfo = AdapterInfo {
    name: "prime_probe",
    description: "L1D Prime+Probe over owned eviction lines",
    mechanism: "Fills each monitored L1 set with eight of our own lines, then \
                times reading them back every slot. Lines displaced by other \
                code running on the same core come back from L2, so a slow \
                probe means the set was used since the previous slot.",
    kind: ChannelKind::CacheSet,
    platform: Platform::X86_64,
    max_targets: Some(L1_SETS),
};

/// L1 Prime+Probe adapter.
#[derive(Debug)]
pub struct PrimeProbe {
    eviction: TargetBuffer,
    sets: Vec<usize>,
    reverse: bool,
    released: bool,
}

impl PrimeProbe {
    /// Allocate the eviction buffer. Fails off x86_64.
    pub fn prepare() -> Result<Self, EngineError> {
        if !Self::is_available() {
            return Err(EngineError::AdapterInitFailure {
                adapter: PRIME_PROBE_INFO.name.into(),
                reason: format!("requires {}", PRIME_PROBE_INFO.platform),
            });
        }
        let eviction = TargetBuffer::page_aligned(L1_WAYS * WAY_STRIDE).map_err(|e| {
            EngineError::AdapterInitFailure {
                adapter: PRIME_PROBE_INFO.name.into(),
                reason: e.to_string(),
            }
        })?;
        debug_assert_eq!(WAY_STRIDE, PAGE_SIZE);
        Ok(Self {
            eviction,
            sets: Vec::new(),
            reverse: false,
            released: false,
        })
    }

    pub fn is_available() -> bool {
        PRIME_PROBE_INFO.platform.is_current()
    }

    pub fn static_info() -> &'static AdapterInfo {
        &PRIME_PROBE_INFO
    }

    /// Addresses of the eight ways of `set` inside `buffer`.
    fn ways(buffer: &TargetBuffer, set: usize, reverse: bool) -> [*const u8; L1_WAYS] {
        let mut ways = [std::ptr::null(); L1_WAYS];
        for (way, slot) in ways.iter_mut().enumerate() {
            let way = if reverse { L1_WAYS - 1 - way } else { way };
            *slot = buffer.addr_of(way * WAY_STRIDE + set * CACHE_LINE_SIZE) as *const u8;
        }
        ways
    }
}

#[cfg(target_arch = "x86_64")]
fn walk(ways: &[*const u8]) -> u64 {
    // SAFETY: every way address comes from PrimeProbe::ways, which bounds
    // checks it against a live buffer.
    unsafe { crate::adapters::helpers::timed_walk(ways) }
}

#[cfg(not(target_arch = "x86_64"))]
fn walk(_ways: &[*const u8]) -> u64 {
    0
}

impl ProbeAdapter for PrimeProbe {
    fn info(&self) -> &AdapterInfo {
        &PRIME_PROBE_INFO
    }

    fn monitor(&mut self, target: Target) -> bool {
        let Target::Set(set) = target else {
            return false;
        };
        if self.released || set >= L1_SETS || self.sets.contains(&set) {
            return false;
        }
        walk(&Self::ways(&self.eviction, set, false));
        self.sets.push(set);
        true
    }

    fn monitored(&self) -> usize {
        self.sets.len()
    }

    fn probe_threshold(&mut self) -> Result<Latency, AdapterError> {
        if self.released {
            return Err(AdapterError::Released);
        }
        if !Self::is_available() {
            return Err(AdapterError::Unsupported(format!(
                "prime_probe requires {}",
                PRIME_PROBE_INFO.platform
            )));
        }
        let foreign = TargetBuffer::page_aligned(L1_WAYS * WAY_STRIDE)
            .map_err(|e| AdapterError::Failed(format!("calibration buffer: {e}")))?;

        let set = 0;
        let own = Self::ways(&self.eviction, set, false);
        let other = Self::ways(&foreign, set, false);

        let mut primed = Vec::with_capacity(CALIBRATION_ROUNDS);
        let mut evicted = Vec::with_capacity(CALIBRATION_ROUNDS);
        for _ in 0..CALIBRATION_ROUNDS {
            walk(&own);
            primed.push(walk(&own));
            walk(&other);
            evicted.push(walk(&own));
        }

        let quiet = median(&mut primed).unwrap_or(0);
        let busy = median(&mut evicted).unwrap_or(0);
        log::debug!("prime_probe calibration: primed median {quiet}, evicted median {busy}");
        if busy <= quiet {
            return Err(AdapterError::Failed(format!(
                "primed ({quiet} cycles) and evicted ({busy} cycles) probes are not separable"
            )));
        }
        Ok(to_latency(quiet + (busy - quiet) / 2))
    }

    fn probe_slot(&mut self, out: &mut [Latency]) -> Result<(), AdapterError> {
        if self.released {
            return Err(AdapterError::Released);
        }
        if self.sets.is_empty() {
            return Err(AdapterError::NothingMonitored);
        }
        if out.len() < self.sets.len() {
            return Err(AdapterError::BufferTooSmall {
                need: self.sets.len(),
                have: out.len(),
            });
        }
        // Alternate the walk direction so LRU replacement does not make the
        // probe evict its own lines.
        for (slot, &set) in out.iter_mut().zip(&self.sets) {
            *slot = to_latency(walk(&Self::ways(&self.eviction, set, self.reverse)));
        }
        self.reverse = !self.reverse;
        Ok(())
    }

    fn release(&mut self) {
        self.sets.clear();
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ways_share_a_set() {
        let buffer = TargetBuffer::page_aligned(L1_WAYS * WAY_STRIDE).unwrap();
        let ways = PrimeProbe::ways(&buffer, 5, false);
        for addr in ways {
            assert_eq!((addr as usize / CACHE_LINE_SIZE) % L1_SETS, 5);
        }
        let reversed = PrimeProbe::ways(&buffer, 5, true);
        assert_eq!(ways[0], reversed[L1_WAYS - 1]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn monitors_only_valid_sets() {
        let mut pp = PrimeProbe::prepare().unwrap();
        assert!(pp.monitor(Target::Set(0)));
        assert!(pp.monitor(Target::Set(63)));
        assert!(!pp.monitor(Target::Set(64)));
        assert!(!pp.monitor(Target::Set(0)));
        assert!(!pp.monitor(Target::Address(0x1000)));
        assert_eq!(pp.monitored(), 2);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn all_sets_probe() {
        let mut pp = PrimeProbe::prepare().unwrap();
        for set in 0..L1_SETS {
            assert!(pp.monitor(Target::Set(set)));
        }
        let mut out = vec![0; L1_SETS * 4];
        assert_eq!(pp.repeated_probe(4, &mut out, 0).unwrap(), 4);
        pp.release();
        assert_eq!(pp.monitored(), 0);
    }
}
