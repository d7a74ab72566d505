//! Low-level primitives shared by the hardware adapters: cycle counter,
//! timed loads, cache line flush, slot pacing and CPU pinning.

use std::ops::Range;

use crate::probe::{INVALID_LATENCY, Latency};

// ---------------------------------------------------------------------------
// Cycle counter
// ---------------------------------------------------------------------------

/// Current value of the cycle counter.
///
/// On x86_64 this is the TSC. Elsewhere it falls back to nanoseconds of a
/// monotonic clock relative to a process-local epoch, which is coarse but
/// keeps slot pacing meaningful for the software adapters.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn cycle_counter() -> u64 {
    // SAFETY: rdtsc is available on every x86_64 CPU and has no side effects.
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cycle_counter() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

// ---------------------------------------------------------------------------
// Timed memory access (x86_64)
// ---------------------------------------------------------------------------

/// Time a single load from `addr` in TSC cycles.
///
/// # Safety
/// `addr` must point to readable memory for the duration of the call.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn timed_read(addr: *const u8) -> u64 {
    use core::arch::x86_64::{__rdtscp, _mm_lfence, _mm_mfence};
    let mut aux = 0u32;
    #[allow(unused_unsafe)]
    unsafe {
        _mm_mfence();
        _mm_lfence();
        let t0 = __rdtscp(&mut aux);
        _mm_lfence();
        std::ptr::read_volatile(addr);
        let t1 = __rdtscp(&mut aux);
        _mm_lfence();
        t1.wrapping_sub(t0)
    }
}

/// Time a sequence of loads (one per address) in TSC cycles.
///
/// # Safety
/// Every address must point to readable memory for the duration of the call.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn timed_walk(addrs: &[*const u8]) -> u64 {
    use core::arch::x86_64::{__rdtscp, _mm_lfence};
    let mut aux = 0u32;
    #[allow(unused_unsafe)]
    unsafe {
        _mm_lfence();
        let t0 = __rdtscp(&mut aux);
        for &addr in addrs {
            std::ptr::read_volatile(addr);
        }
        let t1 = __rdtscp(&mut aux);
        _mm_lfence();
        t1.wrapping_sub(t0)
    }
}

/// Evict the cache line holding `addr` from every cache level.
///
/// # Safety
/// `addr` must be a mapped address.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub unsafe fn flush(addr: *const u8) {
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_mm_clflush(addr);
        core::arch::x86_64::_mm_mfence();
    }
}

// ---------------------------------------------------------------------------
// Latency conversion
// ---------------------------------------------------------------------------

/// Narrow a cycle count into a result cell.
///
/// Counts that overflow the cell (interrupt, context switch) are reported as
/// [`INVALID_LATENCY`]. A genuine zero is bumped to 1 so it cannot be
/// mistaken for the sentinel.
pub fn to_latency(cycles: u64) -> Latency {
    match Latency::try_from(cycles) {
        Ok(0) => 1,
        Ok(v) => v,
        Err(_) => INVALID_LATENCY,
    }
}

/// Median of a set of cycle counts. Sorts in place; `None` when empty.
pub fn median(values: &mut [u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() / 2])
}

// ---------------------------------------------------------------------------
// Slot pacing
// ---------------------------------------------------------------------------

/// Spins until successive slots are at least `slot_time` cycles apart.
///
/// A slot that is already late starts immediately and the schedule restarts
/// from it, so one long probe does not cause a burst of back-to-back slots.
#[derive(Debug)]
pub struct SlotPacer {
    slot_time: u64,
    next: Option<u64>,
}

impl SlotPacer {
    pub fn new(slot_time: u64) -> Self {
        Self {
            slot_time,
            next: None,
        }
    }

    pub fn wait(&mut self) {
        if self.slot_time == 0 {
            return;
        }
        let mut now = cycle_counter();
        if let Some(deadline) = self.next {
            while now < deadline {
                std::hint::spin_loop();
                now = cycle_counter();
            }
        }
        self.next = Some(now.wrapping_add(self.slot_time));
    }
}

// ---------------------------------------------------------------------------
// Process-level helpers
// ---------------------------------------------------------------------------

/// Pin the calling thread to one CPU.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> std::io::Result<()> {
    // SAFETY: cpu_set_t is plain data; zeroed is the empty set. CPU_SET
    // bounds-checks nothing, so reject indices past CPU_SETSIZE first.
    unsafe {
        if cpu >= libc::CPU_SETSIZE as usize {
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
        }
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

/// The readable mapping of this process that contains `addr`, read from
/// `/proc/self/maps`. Pages that are mapped but `PROT_NONE` (guard pages,
/// reservations) do not count.
#[cfg(target_os = "linux")]
pub fn readable_span(addr: usize) -> Option<Range<usize>> {
    if addr == 0 {
        return None;
    }
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (start, end) = fields.next()?.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        let readable = fields.next()?.starts_with('r');
        (readable && (start..end).contains(&addr)).then_some(start..end)
    })
}

#[cfg(not(target_os = "linux"))]
pub fn readable_span(_addr: usize) -> Option<Range<usize>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_latency_preserves_sentinel() {
        assert_eq!(to_latency(0), 1);
        assert_eq!(to_latency(180), 180);
        assert_eq!(to_latency(u64::from(Latency::MAX)), Latency::MAX);
        assert_eq!(to_latency(u64::from(Latency::MAX) + 1), INVALID_LATENCY);
    }

    #[test]
    fn median_of_odd_and_empty() {
        assert_eq!(median(&mut [9, 1, 5]), Some(5));
        assert_eq!(median(&mut []), None);
    }

    #[test]
    fn pacer_spaces_slots() {
        let mut pacer = SlotPacer::new(2_000);
        pacer.wait();
        let t0 = cycle_counter();
        pacer.wait();
        let t1 = cycle_counter();
        assert!(t1.wrapping_sub(t0) > 0);
    }

    #[test]
    fn zero_slot_time_never_waits() {
        let mut pacer = SlotPacer::new(0);
        for _ in 0..1000 {
            pacer.wait();
        }
        assert!(pacer.next.is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stack_is_readable_and_null_is_not() {
        let x = 7u8;
        let addr = &x as *const u8 as usize;
        let span = readable_span(addr).unwrap();
        assert!(span.contains(&addr));
        assert!(readable_span(0).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn prot_none_page_is_not_readable() {
        // SAFETY: anonymous private mapping, unmapped before returning.
        unsafe {
            let page = libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);
            assert!(readable_span(page as usize).is_none());
            libc::munmap(page, 4096);
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    #[ignore] // Hardware-dependent: timing noise on shared CI runners
    fn flushed_line_reloads_slower() {
        let buf = vec![1u8; 4096];
        let addr = buf.as_ptr();
        let mut hits = Vec::new();
        let mut misses = Vec::new();
        for _ in 0..500 {
            unsafe {
                std::ptr::read_volatile(addr);
                hits.push(timed_read(addr));
                flush(addr);
                misses.push(timed_read(addr));
            }
        }
        assert!(median(&mut misses).unwrap() > median(&mut hits).unwrap());
    }
}
