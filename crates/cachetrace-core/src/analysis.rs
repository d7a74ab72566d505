//! Offline analysis of exported latency matrices.
//!
//! Reads the CSV written by [`Trace::write_csv`](crate::trace::Trace::write_csv)
//! back in, infers each channel's kind from its column header (`Set<n>` or
//! `Line<n>`), and summarises per channel and per burst against a threshold.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Serialize;

use crate::calibrate::Threshold;
use crate::channel::ChannelKind;
use crate::classify::{Label, classify_latency};
use crate::error::{EngineError, Result};
use crate::probe::{INVALID_LATENCY, Latency};

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

/// A latency matrix as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyMatrix {
    pub columns: Vec<String>,
    pub kinds: Vec<ChannelKind>,
    pub indices: Vec<u64>,
    pub rows: Vec<Vec<Latency>>,
}

impl LatencyMatrix {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn column_kind(name: &str) -> Option<ChannelKind> {
    for kind in [ChannelKind::CacheSet, ChannelKind::AddressLine] {
        if let Some(n) = name.strip_prefix(kind.column_prefix()) {
            if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) {
                return Some(kind);
            }
        }
    }
    None
}

/// Parse a matrix from CSV text.
pub fn read_matrix<R: BufRead>(reader: R) -> Result<LatencyMatrix> {
    let bad = |line: usize, reason: String| EngineError::MatrixFormat { line, reason };
    let mut lines = reader.lines().enumerate();

    let header = match lines.next() {
        Some((_, Ok(h))) => h,
        Some((_, Err(e))) => return Err(bad(1, e.to_string())),
        None => return Err(bad(1, "empty input".into())),
    };
    let mut cells = header.trim().split(',');
    if cells.next().map(str::trim) != Some("Sample") {
        return Err(bad(1, "header must start with 'Sample'".into()));
    }
    let columns: Vec<String> = cells.map(|c| c.trim().to_string()).collect();
    if columns.is_empty() {
        return Err(bad(1, "no channel columns".into()));
    }
    let kinds = columns
        .iter()
        .map(|c| column_kind(c).ok_or_else(|| bad(1, format!("unknown column '{c}'"))))
        .collect::<Result<Vec<_>>>()?;

    let mut indices = Vec::new();
    let mut rows = Vec::new();
    for (i, line) in lines {
        let lineno = i + 1;
        let line = line.map_err(|e| bad(lineno, e.to_string()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut cells = line.split(',').map(str::trim);
        let index: u64 = cells
            .next()
            .unwrap_or_default()
            .parse()
            .map_err(|e| bad(lineno, format!("bad sample index: {e}")))?;
        if indices.last().is_some_and(|&last| index <= last) {
            return Err(bad(lineno, format!("sample index {index} is not increasing")));
        }
        let row = cells
            .map(|c| {
                c.parse::<Latency>()
                    .map_err(|e| bad(lineno, format!("bad latency '{c}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if row.len() != columns.len() {
            return Err(bad(
                lineno,
                format!("expected {} latencies, found {}", columns.len(), row.len()),
            ));
        }
        indices.push(index);
        rows.push(row);
    }

    Ok(LatencyMatrix {
        columns,
        kinds,
        indices,
        rows,
    })
}

/// Read a matrix file, or the `samples.csv` of a session directory.
pub fn load_matrix(path: &Path) -> Result<LatencyMatrix> {
    let path = if path.is_dir() {
        path.join(crate::record::SAMPLES_FILE)
    } else {
        path.to_path_buf()
    };
    let file = File::open(&path)
        .map_err(|e| EngineError::Config(format!("cannot open {}: {e}", path.display())))?;
    read_matrix(BufReader::new(file))
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub name: String,
    pub kind: ChannelKind,
    pub valid: usize,
    pub invalid: usize,
    pub active: usize,
    pub min: Option<Latency>,
    pub max: Option<Latency>,
    pub mean: Option<f64>,
    /// Active share of valid samples.
    pub activity_rate: f64,
}

/// A run of consecutive active slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Burst {
    pub first: u64,
    pub last: u64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatrixSummary {
    pub threshold: Threshold,
    pub samples: usize,
    pub active_samples: usize,
    pub channels: Vec<ChannelSummary>,
    pub bursts: Vec<Burst>,
}

pub fn summarize(matrix: &LatencyMatrix, threshold: Threshold) -> MatrixSummary {
    let mut channels: Vec<ChannelSummary> = matrix
        .columns
        .iter()
        .zip(&matrix.kinds)
        .map(|(name, &kind)| ChannelSummary {
            name: name.clone(),
            kind,
            valid: 0,
            invalid: 0,
            active: 0,
            min: None,
            max: None,
            mean: None,
            activity_rate: 0.0,
        })
        .collect();
    let mut sums = vec![0u64; channels.len()];
    let mut active_samples = 0;
    let mut bursts: Vec<Burst> = Vec::new();

    for (&index, row) in matrix.indices.iter().zip(&matrix.rows) {
        let mut any_active = false;
        for ((summary, sum), &latency) in channels.iter_mut().zip(&mut sums).zip(row) {
            if latency == INVALID_LATENCY {
                summary.invalid += 1;
                continue;
            }
            summary.valid += 1;
            *sum += u64::from(latency);
            summary.min = Some(summary.min.map_or(latency, |m| m.min(latency)));
            summary.max = Some(summary.max.map_or(latency, |m| m.max(latency)));
            if classify_latency(latency, threshold, summary.kind) == Label::Active {
                summary.active += 1;
                any_active = true;
            }
        }
        if !any_active {
            continue;
        }
        active_samples += 1;
        match bursts.last_mut() {
            Some(burst) if burst.last + 1 == index => {
                burst.last = index;
                burst.samples += 1;
            }
            _ => bursts.push(Burst {
                first: index,
                last: index,
                samples: 1,
            }),
        }
    }

    for (summary, sum) in channels.iter_mut().zip(sums) {
        if summary.valid > 0 {
            summary.mean = Some(sum as f64 / summary.valid as f64);
            summary.activity_rate = summary.active as f64 / summary.valid as f64;
        }
    }

    MatrixSummary {
        threshold,
        samples: matrix.len(),
        active_samples,
        channels,
        bursts,
    }
}
