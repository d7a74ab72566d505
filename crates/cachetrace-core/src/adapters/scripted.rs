//! Scripted adapter: replays latency rows instead of touching the cache.
//!
//! Used by tests to drive the engine deterministically, to inject faults at
//! each stage, and by the CLI as a hardware-free demo. Shared counters let a
//! test observe calibration and release calls after the session that owned
//! the adapter is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::channel::{ChannelKind, Target};
use crate::error::AdapterError;
use crate::probe::{AdapterInfo, Latency, Platform, ProbeAdapter};
use crate::sampler::CancelToken;

static SCRIPTED_LINE_INFO: AdapterInfo = AdapterInfo {
    name: "scripted",
    description: "Replays scripted latency rows for address-line channels",
    mechanism: "No hardware access. Each slot returns the next scripted row; \
                once the script is exhausted every slot is idle.",
    kind: ChannelKind::AddressLine,
    platform: Platform::Any,
    max_targets: None,
};

static SCRIPTED_SET_INFO: AdapterInfo = AdapterInfo {
    name: "scripted",
    description: "Replays scripted latency rows for cache-set channels",
    mechanism: "No hardware access. Each slot returns the next scripted row; \
                once the script is exhausted every slot is idle.",
    kind: ChannelKind::CacheSet,
    platform: Platform::Any,
    max_targets: Some(64),
};

/// Call counters observable from outside the session.
#[derive(Debug, Default)]
pub struct ScriptCounters {
    releases: AtomicUsize,
    calibrations: AtomicUsize,
    slots: AtomicUsize,
}

impl ScriptCounters {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn calibrations(&self) -> usize {
        self.calibrations.load(Ordering::SeqCst)
    }

    pub fn slots(&self) -> usize {
        self.slots.load(Ordering::SeqCst)
    }
}

/// Deterministic [`ProbeAdapter`].
pub struct ScriptedAdapter {
    kind: ChannelKind,
    threshold: Latency,
    idle_latency: Latency,
    rows: Vec<Vec<Latency>>,
    cursor: usize,
    targets: Vec<Target>,
    fail_monitor_at: Option<usize>,
    fail_probe_at: Option<usize>,
    fail_calibration: bool,
    reported_count: Option<usize>,
    cancel_after: Option<(usize, CancelToken)>,
    released: bool,
    counters: Arc<ScriptCounters>,
}

impl ScriptedAdapter {
    /// Adapter for `kind` channels whose calibration reports `threshold`.
    ///
    /// Unscripted slots return an idle latency on the inactive side of the
    /// threshold: slow for address lines, fast for cache sets.
    pub fn new(kind: ChannelKind, threshold: Latency) -> Self {
        let idle_latency = match kind {
            ChannelKind::AddressLine => threshold.saturating_add(threshold / 2).max(2),
            ChannelKind::CacheSet => (threshold / 2).max(1),
        };
        Self {
            kind,
            threshold,
            idle_latency,
            rows: Vec::new(),
            cursor: 0,
            targets: Vec::new(),
            fail_monitor_at: None,
            fail_probe_at: None,
            fail_calibration: false,
            reported_count: None,
            cancel_after: None,
            released: false,
            counters: Arc::new(ScriptCounters::default()),
        }
    }

    /// Replay `rows`, one per slot. Each row must be at least as wide as the
    /// number of monitored targets.
    pub fn with_rows(mut self, rows: Vec<Vec<Latency>>) -> Self {
        self.rows = rows;
        self
    }

    /// Latency reported for every channel once the script runs out.
    pub fn with_idle_latency(mut self, latency: Latency) -> Self {
        self.idle_latency = latency;
        self
    }

    /// Reject the `n`-th monitor call (0-based).
    pub fn fail_monitor_at(mut self, n: usize) -> Self {
        self.fail_monitor_at = Some(n);
        self
    }

    /// Fail the `n`-th probed slot (0-based).
    pub fn fail_probe_at(mut self, slot: usize) -> Self {
        self.fail_probe_at = Some(slot);
        self
    }

    pub fn fail_calibration(mut self) -> Self {
        self.fail_calibration = true;
        self
    }

    /// Make `repeated_probe` report `count` rows regardless of what it wrote.
    pub fn report_count(mut self, count: usize) -> Self {
        self.reported_count = Some(count);
        self
    }

    /// Trip `cancel` once `slots` slots have been probed, as a Ctrl+C
    /// arriving mid-run would.
    pub fn cancel_after(mut self, slots: usize, cancel: CancelToken) -> Self {
        self.cancel_after = Some((slots, cancel));
        self
    }

    pub fn counters(&self) -> Arc<ScriptCounters> {
        Arc::clone(&self.counters)
    }

    /// Synthetic bursts for demos: `slots` rows of `width` channels, with a
    /// burst of activity on a rotating channel every 64 slots.
    pub fn demo(kind: ChannelKind, width: usize, slots: usize) -> Self {
        let threshold: Latency = 200;
        let mut rng = rand::rng();
        let (idle, active) = match kind {
            ChannelKind::AddressLine => ((280, 420), (60, 140)),
            ChannelKind::CacheSet => ((60, 160), (240, 400)),
        };
        let width = width.max(1);
        let rows = (0..slots)
            .map(|slot| {
                let burst = slot % 64 < 6;
                let hot = (slot / 64) % width;
                (0..width)
                    .map(|ch| {
                        let (lo, hi) = if burst && ch == hot { active } else { idle };
                        rng.random_range(lo..hi)
                    })
                    .collect()
            })
            .collect();
        Self::new(kind, threshold).with_rows(rows)
    }

    fn next_row(&mut self, out: &mut [Latency]) {
        let width = self.targets.len();
        match self.rows.get(self.cursor) {
            Some(row) => {
                for (dst, src) in out[..width]
                    .iter_mut()
                    .zip(row.iter().copied().chain(std::iter::repeat(self.idle_latency)))
                {
                    *dst = src;
                }
            }
            None => out[..width].fill(self.idle_latency),
        }
        self.cursor += 1;
    }
}

impl ProbeAdapter for ScriptedAdapter {
    fn info(&self) -> &AdapterInfo {
        match self.kind {
            ChannelKind::AddressLine => &SCRIPTED_LINE_INFO,
            ChannelKind::CacheSet => &SCRIPTED_SET_INFO,
        }
    }

    fn monitor(&mut self, target: Target) -> bool {
        let call = self.targets.len();
        if self.released
            || target.kind() != self.kind
            || self.fail_monitor_at == Some(call)
            || self.targets.contains(&target)
        {
            return false;
        }
        if let (Target::Set(set), Some(max)) = (target, self.info().max_targets) {
            if set >= max {
                return false;
            }
        }
        self.targets.push(target);
        true
    }

    fn monitored(&self) -> usize {
        self.targets.len()
    }

    fn probe_threshold(&mut self) -> Result<Latency, AdapterError> {
        self.counters.calibrations.fetch_add(1, Ordering::SeqCst);
        if self.released {
            return Err(AdapterError::Released);
        }
        if self.fail_calibration {
            return Err(AdapterError::Failed("injected calibration failure".into()));
        }
        Ok(self.threshold)
    }

    fn probe_slot(&mut self, out: &mut [Latency]) -> Result<(), AdapterError> {
        if self.released {
            return Err(AdapterError::Released);
        }
        let width = self.targets.len();
        if width == 0 {
            return Err(AdapterError::NothingMonitored);
        }
        if out.len() < width {
            return Err(AdapterError::BufferTooSmall {
                need: width,
                have: out.len(),
            });
        }
        if self.fail_probe_at == Some(self.cursor) {
            return Err(AdapterError::Failed(format!(
                "injected probe failure at slot {}",
                self.cursor
            )));
        }
        self.counters.slots.fetch_add(1, Ordering::SeqCst);
        self.next_row(out);
        if let Some((slots, cancel)) = &self.cancel_after {
            if self.cursor == *slots {
                cancel.cancel();
            }
        }
        Ok(())
    }

    fn repeated_probe(
        &mut self,
        max_samples: usize,
        out: &mut [Latency],
        _slot_time: u64,
    ) -> Result<usize, AdapterError> {
        let width = self.targets.len();
        if width == 0 {
            return Err(AdapterError::NothingMonitored);
        }
        let rows = match self.reported_count {
            Some(count) => count.min(max_samples),
            None => max_samples,
        };
        for row in out.chunks_exact_mut(width).take(rows) {
            self.probe_slot(row)?;
        }
        Ok(self.reported_count.unwrap_or(max_samples))
    }

    fn release(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        self.released = true;
        self.targets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_rows_then_idles() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 200)
            .with_idle_latency(90)
            .with_rows(vec![vec![300, 10], vec![310]]);
        assert!(adapter.monitor(Target::Set(0)));
        assert!(adapter.monitor(Target::Set(1)));

        let mut row = [0; 2];
        adapter.probe_slot(&mut row).unwrap();
        assert_eq!(row, [300, 10]);
        adapter.probe_slot(&mut row).unwrap();
        assert_eq!(row, [310, 90]);
        adapter.probe_slot(&mut row).unwrap();
        assert_eq!(row, [90, 90]);
        assert_eq!(adapter.counters().slots(), 3);
    }

    #[test]
    fn rejects_duplicates_and_out_of_range_sets() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 200);
        assert!(adapter.monitor(Target::Set(3)));
        assert!(!adapter.monitor(Target::Set(3)));
        assert!(!adapter.monitor(Target::Set(64)));
        assert!(!adapter.monitor(Target::Address(0x1000)));
    }

    #[test]
    fn reported_count_overrides_return_value() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::AddressLine, 200).report_count(0);
        adapter.monitor(Target::Address(0x40));
        let mut out = vec![0; 10];
        assert_eq!(adapter.repeated_probe(10, &mut out, 0).unwrap(), 0);
    }

    #[test]
    fn release_is_counted() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::AddressLine, 200);
        let counters = adapter.counters();
        adapter.release();
        assert_eq!(counters.releases(), 1);
        assert!(matches!(adapter.probe_threshold(), Err(AdapterError::Released)));
    }

    #[test]
    fn demo_rows_have_requested_shape() {
        let adapter = ScriptedAdapter::demo(ChannelKind::CacheSet, 4, 128);
        assert_eq!(adapter.rows.len(), 128);
        assert!(adapter.rows.iter().all(|r| r.len() == 4));
        assert!(adapter.rows[0].iter().any(|&l| l > 200));
    }
}
