//! Flush+Reload: address-granularity channel.
//!
//! Each monitored line is flushed from the whole cache hierarchy after every
//! probe. If anything (typically a co-resident victim sharing the page)
//! loads the line before the next slot, the timed reload hits in cache and
//! comes back fast.
//!
//! Only addresses inside a retained [`MemoryRegion`] can be monitored, and
//! the adapter holds those regions until it is released.

use std::sync::Arc;

use crate::adapters::helpers::{median, readable_span, to_latency};
use crate::channel::{ChannelKind, Target};
use crate::error::{AdapterError, EngineError};
use crate::probe::{AdapterInfo, Latency, Platform, ProbeAdapter};
use crate::target::{MemoryRegion, TargetBuffer};

/// Timed accesses per side (cached / flushed) during calibration.
const CALIBRATION_ROUNDS: usize = 1000;

static FLUSH_RELOAD_INFO: AdapterInfo = AdapterInfo {
    name: "flush_reload",
    description: "clflush + timed reload of individual cache lines",
    mechanism: "Every slot reloads each monitored line under rdtscp and then \
                evicts it with clflush. A reload served from cache (fast) \
                means some core touched the line since the previous slot; a \
                reload served from DRAM (slow) means nobody did.",
    kind: ChannelKind::AddressLine,
    platform: Platform::X86_64,
    max_targets: None,
};

/// Flush+Reload adapter.
#[derive(Debug)]
pub struct FlushReload {
    lines: Vec<usize>,
    regions: Vec<Arc<dyn MemoryRegion>>,
    released: bool,
}

impl FlushReload {
    /// Prepare the adapter. Fails off x86_64.
    pub fn prepare() -> Result<Self, EngineError> {
        if !Self::is_available() {
            return Err(EngineError::AdapterInitFailure {
                adapter: FLUSH_RELOAD_INFO.name.into(),
                reason: format!("requires {}", FLUSH_RELOAD_INFO.platform),
            });
        }
        Ok(Self {
            lines: Vec::new(),
            regions: Vec::new(),
            released: false,
        })
    }

    pub fn is_available() -> bool {
        FLUSH_RELOAD_INFO.platform.is_current()
    }

    pub fn static_info() -> &'static AdapterInfo {
        &FLUSH_RELOAD_INFO
    }

    fn covers(&self, addr: usize) -> bool {
        self.regions.iter().any(|region| region.contains(addr))
    }
}

#[cfg(target_arch = "x86_64")]
fn reload_then_flush(addr: usize) -> u64 {
    use crate::adapters::helpers::{flush, timed_read};
    let ptr = addr as *const u8;
    // SAFETY: monitor() only accepts addresses inside a retained region,
    // which stays readable until release() clears the lines.
    unsafe {
        let t = timed_read(ptr);
        flush(ptr);
        t
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn reload_then_flush(_addr: usize) -> u64 {
    0
}

#[cfg(target_arch = "x86_64")]
fn calibration_samples() -> Result<(Vec<u64>, Vec<u64>), AdapterError> {
    use crate::adapters::helpers::{flush, timed_read};
    let buffer = TargetBuffer::new(1)
        .map_err(|e| AdapterError::Failed(format!("calibration buffer: {e}")))?;
    let ptr = buffer.as_ptr();

    let mut hits = Vec::with_capacity(CALIBRATION_ROUNDS);
    let mut misses = Vec::with_capacity(CALIBRATION_ROUNDS);
    for _ in 0..CALIBRATION_ROUNDS {
        // SAFETY: ptr points into `buffer`, alive for the whole loop.
        unsafe {
            buffer.touch(0);
            hits.push(timed_read(ptr));
            flush(ptr);
            misses.push(timed_read(ptr));
        }
    }
    Ok((hits, misses))
}

#[cfg(not(target_arch = "x86_64"))]
fn calibration_samples() -> Result<(Vec<u64>, Vec<u64>), AdapterError> {
    Err(AdapterError::Unsupported(format!(
        "flush_reload requires {}",
        FLUSH_RELOAD_INFO.platform
    )))
}

impl ProbeAdapter for FlushReload {
    fn info(&self) -> &AdapterInfo {
        &FLUSH_RELOAD_INFO
    }

    fn retain(&mut self, region: Arc<dyn MemoryRegion>) {
        if !self.released {
            self.regions.push(region);
        }
    }

    fn monitor(&mut self, target: Target) -> bool {
        let Target::Address(addr) = target else {
            return false;
        };
        if self.released || self.lines.contains(&addr) || !self.covers(addr) {
            return false;
        }
        if cfg!(target_os = "linux") && readable_span(addr).is_none() {
            log::warn!("{addr:#x} is inside a retained region but not readable");
            return false;
        }
        // Start from a flushed line so the first slot measures real activity.
        reload_then_flush(addr);
        self.lines.push(addr);
        true
    }

    fn monitored(&self) -> usize {
        self.lines.len()
    }

    fn probe_threshold(&mut self) -> Result<Latency, AdapterError> {
        if self.released {
            return Err(AdapterError::Released);
        }
        let (mut hits, mut misses) = calibration_samples()?;
        let hit = median(&mut hits).unwrap_or(0);
        let miss = median(&mut misses).unwrap_or(0);
        log::debug!("flush_reload calibration: hit median {hit}, miss median {miss}");
        if miss <= hit {
            return Err(AdapterError::Failed(format!(
                "cached ({hit} cycles) and flushed ({miss} cycles) reloads are not separable"
            )));
        }
        Ok(to_latency(hit + (miss - hit) / 2))
    }

    fn probe_slot(&mut self, out: &mut [Latency]) -> Result<(), AdapterError> {
        if self.released {
            return Err(AdapterError::Released);
        }
        if self.lines.is_empty() {
            return Err(AdapterError::NothingMonitored);
        }
        if out.len() < self.lines.len() {
            return Err(AdapterError::BufferTooSmall {
                need: self.lines.len(),
                have: out.len(),
            });
        }
        for (slot, &addr) in out.iter_mut().zip(&self.lines) {
            *slot = to_latency(reload_then_flush(addr));
        }
        Ok(())
    }

    fn release(&mut self) {
        self.lines.clear();
        self.regions.clear();
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info() {
        assert_eq!(FlushReload::static_info().name, "flush_reload");
        assert_eq!(FlushReload::static_info().kind, ChannelKind::AddressLine);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn monitors_retained_lines_once() {
        let buffer = Arc::new(TargetBuffer::new(2).unwrap());
        let mut fr = FlushReload::prepare().unwrap();
        fr.retain(buffer.clone());
        assert!(fr.monitor(Target::Address(buffer.line_addr(0))));
        assert!(!fr.monitor(Target::Address(buffer.line_addr(0))));
        assert!(fr.monitor(Target::Address(buffer.line_addr(1))));
        assert!(!fr.monitor(Target::Set(0)));
        assert_eq!(fr.monitored(), 2);
        fr.release();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn probe_fills_one_latency_per_line() {
        let buffer = Arc::new(TargetBuffer::new(3).unwrap());
        let mut fr = FlushReload::prepare().unwrap();
        fr.retain(buffer.clone());
        for target in buffer.line_targets() {
            assert!(fr.monitor(target));
        }
        let mut out = vec![0; 3 * 10];
        let n = fr.repeated_probe(10, &mut out, 0).unwrap();
        assert_eq!(n, 10);
        fr.release();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn addresses_outside_retained_regions_are_refused() {
        let retained = Arc::new(TargetBuffer::new(1).unwrap());
        let other = TargetBuffer::new(1).unwrap();
        let mut fr = FlushReload::prepare().unwrap();
        assert!(!fr.monitor(Target::Address(retained.line_addr(0))));

        fr.retain(retained.clone());
        assert!(!fr.monitor(Target::Address(other.line_addr(0))));
        assert!(!fr.monitor(Target::Address(retained.line_addr(0) + 64)));
        assert!(fr.monitor(Target::Address(retained.line_addr(0))));
    }

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    #[test]
    fn prot_none_page_is_a_monitor_failure() {
        use crate::channel::ChannelId;
        use crate::session::Session;

        // SAFETY: anonymous private mapping, unmapped at the end of the test.
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);

        let mut session = Session::new(Box::new(FlushReload::prepare().unwrap()));
        let err = session.register(Target::Address(page as usize)).unwrap_err();
        match err {
            EngineError::MonitorFailure { channel, .. } => assert_eq!(channel, ChannelId(0)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(session.channels().is_empty());
        session.finish();

        // SAFETY: `page` came from the mmap above and nothing references it.
        unsafe { libc::munmap(page, 4096) };
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn retained_region_lives_until_release() {
        let buffer = Arc::new(TargetBuffer::new(1).unwrap());
        let mut fr = FlushReload::prepare().unwrap();
        fr.retain(buffer.clone());
        assert!(fr.monitor(Target::Address(buffer.line_addr(0))));
        assert_eq!(Arc::strong_count(&buffer), 2);

        fr.release();
        assert_eq!(Arc::strong_count(&buffer), 1);
        assert_eq!(fr.monitored(), 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    #[ignore] // Hardware-dependent: needs a quiet core for stable timings
    fn calibrated_threshold_separates_hit_and_miss() {
        let mut fr = FlushReload::prepare().unwrap();
        let threshold = fr.probe_threshold().unwrap();
        assert!(threshold > 0);
    }

    #[test]
    fn released_adapter_refuses_work() {
        if !FlushReload::is_available() {
            assert!(FlushReload::prepare().is_err());
            return;
        }
        let mut fr = FlushReload::prepare().unwrap();
        fr.release();
        let mut out = [0; 1];
        assert!(matches!(fr.probe_slot(&mut out), Err(AdapterError::Released)));
    }
}
