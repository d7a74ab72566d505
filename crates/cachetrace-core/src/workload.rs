//! Synthetic victim workloads.
//!
//! A workload runs on its own thread while a session samples. It touches a
//! fixed set of cache lines a number of times with random pauses between
//! rounds, which is enough to make the monitored lines or sets light up.
//! The sampler never talks to the workload; the only coupling is through
//! the hardware cache.
//!
//! [`WorkloadHandle`] stops and joins the thread when dropped, so a failing
//! session never leaks it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::target::{CACHE_LINE_SIZE, PAGE_SIZE, SymbolTarget, TargetBuffer};

/// One round of victim activity.
pub trait Workload: Send + 'static {
    fn name(&self) -> &str;

    /// Perform one round of accesses.
    fn step(&mut self);
}

enum Lines {
    Buffer(Arc<TargetBuffer>, Vec<usize>),
    Symbol(Arc<SymbolTarget>, usize),
}

/// Reads a fixed list of cache lines each round.
pub struct CacheToucher {
    name: String,
    lines: Lines,
    sink: u8,
}

impl CacheToucher {
    /// Touch every line of a shared target buffer.
    pub fn lines(buffer: Arc<TargetBuffer>) -> Self {
        let offsets = (0..buffer.lines()).map(|l| l * CACHE_LINE_SIZE).collect();
        Self {
            name: format!("touch {} buffer lines", buffer.lines()),
            lines: Lines::Buffer(buffer, offsets),
            sink: 0,
        }
    }

    /// Touch one line mapping to each of `sets` in a private page-aligned
    /// buffer.
    pub fn sets(sets: &[usize]) -> Result<Self> {
        let span = sets.iter().max().map_or(1, |&max| (max + 1) * CACHE_LINE_SIZE);
        let buffer = TargetBuffer::page_aligned(span.max(PAGE_SIZE))?;
        let offsets = sets.iter().map(|&s| s * CACHE_LINE_SIZE).collect();
        Ok(Self {
            name: format!("touch sets {sets:?}"),
            lines: Lines::Buffer(Arc::new(buffer), offsets),
            sink: 0,
        })
    }

    /// Read the first `lines` code lines of a resolved library function.
    pub fn symbol(target: Arc<SymbolTarget>, lines: usize) -> Self {
        Self {
            name: format!("touch {} lines of {}", lines, target.symbol()),
            lines: Lines::Symbol(target, lines),
            sink: 0,
        }
    }
}

impl Workload for CacheToucher {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        match &self.lines {
            Lines::Buffer(buffer, offsets) => {
                for &offset in offsets {
                    self.sink = self.sink.wrapping_add(buffer.touch(offset));
                }
            }
            Lines::Symbol(target, lines) => {
                for line in 0..*lines {
                    self.sink = self.sink.wrapping_add(target.touch(line).unwrap_or(0));
                }
            }
        }
        std::hint::black_box(self.sink);
    }
}

/// Round count and pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub iterations: usize,
    /// Upper bound of the uniform random pause before each round.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            iterations: 20,
            max_delay: Duration::from_millis(500),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Spawns workloads on a named background thread.
pub struct WorkloadGenerator;

impl WorkloadGenerator {
    pub fn spawn(mut workload: Box<dyn Workload>, config: WorkloadConfig) -> Result<WorkloadHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let name = workload.name().to_string();

        let handle = thread::Builder::new()
            .name("cachetrace-workload".into())
            .spawn(move || {
                let mut rng = rand::rng();
                let mut rounds = 0usize;
                for _ in 0..config.iterations {
                    let max_ms = config.max_delay.as_millis() as u64;
                    let delay = if max_ms == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(rng.random_range(0..max_ms))
                    };
                    if !pause(delay, &thread_stop) {
                        break;
                    }
                    workload.step();
                    rounds += 1;
                }
                rounds
            })
            .map_err(EngineError::ThreadFailure)?;

        log::info!("workload started: {name}");
        Ok(WorkloadHandle {
            name,
            stop,
            thread: Some(handle),
        })
    }
}

/// Sleep for `delay` in short steps. Returns `false` if stopped meanwhile.
fn pause(delay: Duration, stop: &AtomicBool) -> bool {
    const STEP: Duration = Duration::from_millis(5);
    let deadline = Instant::now() + delay;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(STEP));
    }
}

/// Running workload. Dropping it stops and joins the thread.
pub struct WorkloadHandle {
    name: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<usize>>,
}

impl WorkloadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the workload to run out of rounds. Returns the rounds done.
    pub fn join(mut self) -> usize {
        self.join_inner()
    }

    /// Stop early and join. Returns the rounds done.
    pub fn stop(mut self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        self.join_inner()
    }

    fn join_inner(&mut self) -> usize {
        let Some(thread) = self.thread.take() else {
            return 0;
        };
        match thread.join() {
            Ok(rounds) => {
                log::debug!("workload '{}' joined after {rounds} rounds", self.name);
                rounds
            }
            Err(_) => {
                log::warn!("workload '{}' panicked", self.name);
                0
            }
        }
    }
}

impl Drop for WorkloadHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.join_inner();
    }
}

impl std::fmt::Debug for WorkloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadHandle")
            .field("name", &self.name)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting(Arc<AtomicUsize>);

    impl Workload for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn step(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick(iterations: usize) -> WorkloadConfig {
        WorkloadConfig {
            iterations,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn runs_every_round_then_joins() {
        let steps = Arc::new(AtomicUsize::new(0));
        let handle =
            WorkloadGenerator::spawn(Box::new(Counting(Arc::clone(&steps))), quick(20)).unwrap();
        assert_eq!(handle.join(), 20);
        assert_eq!(steps.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn drop_stops_and_joins() {
        let steps = Arc::new(AtomicUsize::new(0));
        let config = WorkloadConfig {
            iterations: 1_000,
            max_delay: Duration::from_secs(10),
        };
        let started = Instant::now();
        let handle = WorkloadGenerator::spawn(Box::new(Counting(Arc::clone(&steps))), config).unwrap();
        drop(handle);
        assert!(started.elapsed() < Duration::from_secs(5));
        // The thread is gone, so nothing can bump the counter any more.
        let after = steps.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(steps.load(Ordering::SeqCst), after);
        assert!(Arc::strong_count(&steps) == 1);
    }

    #[test]
    fn set_toucher_runs() {
        let mut toucher = CacheToucher::sets(&[0, 1, 16, 32]).unwrap();
        toucher.step();
        assert!(toucher.name().contains("16"));
    }

    #[test]
    fn line_toucher_shares_buffer() {
        let buffer = Arc::new(TargetBuffer::new(4).unwrap());
        let mut toucher = CacheToucher::lines(Arc::clone(&buffer));
        toucher.step();
        assert_eq!(Arc::strong_count(&buffer), 2);
        drop(toucher);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn config_round_trips_as_millis() {
        let json = serde_json::to_string(&WorkloadConfig::default()).unwrap();
        assert_eq!(json, r#"{"iterations":20,"max_delay":500}"#);
        let back: WorkloadConfig = serde_json::from_str(r#"{"iterations":3}"#).unwrap();
        assert_eq!(back.iterations, 3);
        assert_eq!(back.max_delay, Duration::from_millis(500));
    }
}
