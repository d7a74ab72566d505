//! Session recording.
//!
//! A recorded session is a directory named `<timestamp>-<adapter>` holding:
//! - `samples.csv`: the latency matrix, same format as `Trace::write_csv`
//! - `session.json`: [`SessionMeta`] (channels, threshold, timing, machine
//!   info, tags)
//!
//! The directory is created up front so a bad output path fails before any
//! sampling happens.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calibrate::Threshold;
use crate::channel::Channel;
use crate::error::{EngineError, Result};
use crate::sampler::{SamplerConfig, SamplerMode};
use crate::trace::Trace;

/// File name of the matrix inside a session directory.
pub const SAMPLES_FILE: &str = "samples.csv";
/// File name of the metadata inside a session directory.
pub const META_FILE: &str = "session.json";

// ---------------------------------------------------------------------------
// Machine info
// ---------------------------------------------------------------------------

/// Machine information captured at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub os: String,
    pub arch: String,
    pub cpu: String,
    pub cores: usize,
    /// L1 data cache of CPU 0, e.g. `48K, 12-way, 64-byte lines`. Prime+Probe
    /// set indices only mean something against this geometry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1d: Option<String>,
}

/// Detect machine information (best-effort; Linux sources only).
pub fn detect_machine_info() -> MachineInfo {
    let os = std::env::consts::OS;
    MachineInfo {
        os: match key_value("/etc/os-release", "PRETTY_NAME", '=') {
            Some(name) => format!("{os} ({name})"),
            None => os.to_string(),
        },
        arch: std::env::consts::ARCH.to_string(),
        cpu: key_value("/proc/cpuinfo", "model name", ':').unwrap_or_else(|| "unknown".into()),
        cores: std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        l1d: l1d_geometry(),
    }
}

/// Value of the first `key<sep>value` line in a text file, unquoted.
fn key_value(path: &str, key: &str, sep: char) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    text.lines().find_map(|line| {
        let (k, v) = line.split_once(sep)?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').to_string())
    })
}

fn l1d_geometry() -> Option<String> {
    const CACHE_DIR: &str = "/sys/devices/system/cpu/cpu0/cache";
    let read = |dir: &PathBuf, file: &str| {
        fs::read_to_string(dir.join(file))
            .ok()
            .map(|s| s.trim().to_string())
    };
    fs::read_dir(CACHE_DIR)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .find_map(|dir| {
            if read(&dir, "level")? != "1" || read(&dir, "type")? != "Data" {
                return None;
            }
            Some(format!(
                "{}, {}-way, {}-byte lines",
                read(&dir, "size")?,
                read(&dir, "ways_of_associativity")?,
                read(&dir, "coherency_line_size")?
            ))
        })
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Contents of `session.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub version: u32,
    pub id: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub adapter: String,
    pub mode: SamplerMode,
    pub threshold: Threshold,
    pub slot_time: u64,
    pub max_samples: usize,
    pub max_idle: Option<usize>,
    pub channels: Vec<Channel>,
    pub total_samples: usize,
    pub active_samples: usize,
    pub machine: MachineInfo,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
    pub cachetrace_version: String,
}

/// Where and how to record.
#[derive(Debug, Clone)]
pub struct RecordConfig {
    pub output_dir: PathBuf,
    pub tags: HashMap<String, String>,
    pub note: Option<String>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("sessions"),
            tags: HashMap::new(),
            note: None,
        }
    }
}

/// Parse a `key:value` tag.
pub fn parse_tag(tag: &str) -> Result<(String, String)> {
    match tag.split_once(':') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => Err(EngineError::Config(format!("tag '{tag}' must look like key:value"))),
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Writes one session directory.
#[derive(Debug)]
pub struct Recorder {
    session_dir: PathBuf,
    session_id: String,
    adapter: String,
    started_at: SystemTime,
    started_instant: Instant,
    config: RecordConfig,
    machine: MachineInfo,
}

impl Recorder {
    /// Create `<output_dir>/<timestamp>-<adapter>/`.
    pub fn new(config: RecordConfig, adapter: &str) -> Result<Self> {
        let started_at = SystemTime::now();
        let dir_name = format!("{}-{}", UtcTime::at(started_at).compact(), adapter);
        let session_dir = config.output_dir.join(dir_name);
        fs::create_dir_all(&session_dir).map_err(|source| EngineError::ExportFailure {
            path: session_dir.clone(),
            source,
        })?;
        log::debug!("recording into {}", session_dir.display());

        Ok(Self {
            session_dir,
            session_id: Uuid::new_v4().to_string(),
            adapter: adapter.to_string(),
            started_at,
            started_instant: Instant::now(),
            config,
            machine: detect_machine_info(),
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn elapsed(&self) -> Duration {
        self.started_instant.elapsed()
    }

    /// Write `samples.csv` and `session.json`. Returns the session directory.
    pub fn finish(self, trace: &Trace, sampler: &SamplerConfig) -> Result<PathBuf> {
        trace.export_csv(&self.session_dir.join(SAMPLES_FILE))?;

        let ended_at = SystemTime::now();
        let max_idle = match trace.mode() {
            SamplerMode::IdleGated { max_idle, .. } => Some(max_idle),
            SamplerMode::RepeatedProbe => None,
        };
        let meta = SessionMeta {
            version: 1,
            id: self.session_id,
            started_at: UtcTime::at(self.started_at).iso8601(),
            ended_at: UtcTime::at(ended_at).iso8601(),
            duration_ms: self.started_instant.elapsed().as_millis() as u64,
            adapter: self.adapter,
            mode: trace.mode(),
            threshold: trace.threshold(),
            slot_time: sampler.slot_time,
            max_samples: sampler.max_samples,
            max_idle,
            channels: trace.channels().to_vec(),
            total_samples: trace.len(),
            active_samples: trace.active_samples(),
            machine: self.machine,
            tags: self.config.tags,
            note: self.config.note,
            cachetrace_version: crate::VERSION.to_string(),
        };

        let meta_path = self.session_dir.join(META_FILE);
        let json = serde_json::to_string_pretty(&meta).map_err(|e| EngineError::ExportFailure {
            path: meta_path.clone(),
            source: std::io::Error::other(e),
        })?;
        fs::write(&meta_path, json).map_err(|source| EngineError::ExportFailure {
            path: meta_path.clone(),
            source,
        })?;

        log::info!(
            "session {} recorded: {} samples in {}",
            meta.id,
            meta.total_samples,
            self.session_dir.display()
        );
        Ok(self.session_dir)
    }
}

/// Read `session.json` back from a session directory.
pub fn load_meta(session_dir: &Path) -> Result<SessionMeta> {
    let path = session_dir.join(META_FILE);
    let text = fs::read_to_string(&path).map_err(|e| {
        EngineError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text)
        .map_err(|e| EngineError::Config(format!("invalid {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// UTC wall-clock time at second resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UtcTime {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    min: u32,
    sec: u32,
}

impl UtcTime {
    fn at(time: SystemTime) -> Self {
        Self::from_unix(time.duration_since(UNIX_EPOCH).unwrap_or_default())
    }

    /// Proleptic Gregorian calendar, no leap seconds. Days are mapped onto
    /// 400-year eras counted from 0000-03-01 so February is the last month.
    fn from_unix(since_epoch: Duration) -> Self {
        let secs = since_epoch.as_secs();
        let rem = secs % 86_400;

        let z = (secs / 86_400) as i64 + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;

        Self {
            year: era * 400 + yoe + i64::from(month <= 2),
            month,
            day: (doy - (153 * mp + 2) / 5 + 1) as u32,
            hour: (rem / 3_600) as u32,
            min: (rem / 60 % 60) as u32,
            sec: (rem % 60) as u32,
        }
    }

    /// `2026-02-15T01:30:00Z`
    fn iso8601(self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            self.year, self.month, self.day, self.hour, self.min, self.sec
        )
    }

    /// `2026-02-15T013000Z`, safe in directory names.
    fn compact(self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}{:02}{:02}Z",
            self.year, self.month, self.day, self.hour, self.min, self.sec
        )
    }
}
