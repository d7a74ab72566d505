//! Aggregated result of one sampling run.
//!
//! A [`Trace`] pairs the raw latency rows with the session's channels and
//! frozen threshold, so it can label, summarise, print and export itself
//! without going back to the adapter.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::calibrate::Threshold;
use crate::channel::{Channel, ChannelKind};
use crate::classify::{Classification, Classifier, Label};
use crate::error::{EngineError, Result};
use crate::probe::Latency;
use crate::sampler::{SampleBuffer, SamplerMode};

/// One emitted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample<'a> {
    /// Slot number in idle-gated mode, row number in repeated-probe mode.
    pub index: u64,
    /// One latency per channel, in channel order.
    pub latencies: &'a [Latency],
}

/// Labelled sample matrix.
#[derive(Debug, Clone)]
pub struct Trace {
    channels: Vec<Channel>,
    classifier: Classifier,
    mode: SamplerMode,
    rows: SampleBuffer,
}

impl Trace {
    pub fn new(
        channels: Vec<Channel>,
        threshold: Threshold,
        mode: SamplerMode,
        rows: SampleBuffer,
    ) -> Self {
        debug_assert_eq!(channels.len(), rows.width());
        let classifier = Classifier::new(threshold, &channels);
        Self {
            channels,
            classifier,
            mode,
            rows,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn threshold(&self) -> Threshold {
        self.classifier.threshold()
    }

    pub fn mode(&self) -> SamplerMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sample(&self, row: usize) -> Option<Sample<'_>> {
        (row < self.rows.len()).then(|| Sample {
            index: self.rows.index(row),
            latencies: self.rows.row(row),
        })
    }

    pub fn samples(&self) -> impl Iterator<Item = Sample<'_>> {
        self.rows
            .rows()
            .map(|(index, latencies)| Sample { index, latencies })
    }

    pub fn classify(&self, sample: &Sample<'_>) -> Classification {
        self.classifier.classify(sample.latencies)
    }

    pub fn classifications(&self) -> Vec<Classification> {
        self.samples().map(|s| self.classify(&s)).collect()
    }

    /// Number of samples with activity on at least one channel.
    pub fn active_samples(&self) -> usize {
        self.samples()
            .filter(|s| self.classifier.any_active(s.latencies))
            .count()
    }

    /// `Sample` followed by one header per channel.
    pub fn column_names(&self) -> Vec<String> {
        std::iter::once("Sample".to_string())
            .chain(self.channels.iter().map(Channel::column_name))
            .collect()
    }

    /// Rows of `[sample_index, latency_0, latency_1, ...]`.
    pub fn to_matrix(&self) -> Vec<Vec<u64>> {
        self.samples()
            .map(|s| {
                std::iter::once(s.index)
                    .chain(s.latencies.iter().map(|&l| u64::from(l)))
                    .collect()
            })
            .collect()
    }

    /// Console report, one line per sample.
    ///
    /// Set channels print as `S<i>:<latency>(<label>)`, line channels as
    /// `<latency> (<label>)`. The line ends with `| Active` or `| Idle`.
    pub fn to_report(&self) -> String {
        let mut out = String::new();
        for sample in self.samples() {
            let c = self.classify(&sample);
            let _ = write!(out, "Sample {:4}: ", sample.index);
            for (j, ((&latency, label), channel)) in sample
                .latencies
                .iter()
                .zip(&c.labels)
                .zip(&self.channels)
                .enumerate()
            {
                let kind = channel.kind();
                match (kind, label) {
                    (ChannelKind::CacheSet, Label::Invalid) => {
                        let _ = write!(out, "S{j}:Invalid ");
                    }
                    (ChannelKind::CacheSet, _) => {
                        let _ = write!(out, "S{j}:{latency:4}({}) ", label.name(kind));
                    }
                    (ChannelKind::AddressLine, _) => {
                        let _ = write!(out, "{latency:4} ({}) ", label.name(kind));
                    }
                }
            }
            let _ = writeln!(out, "| {}", if c.any_active { "Active" } else { "Idle" });
        }
        out
    }

    /// Write the matrix as CSV. `0` cells mean Invalid.
    pub fn write_csv<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writeln!(writer, "{}", self.column_names().join(","))?;
        for sample in self.samples() {
            write!(writer, "{}", sample.index)?;
            for latency in sample.latencies {
                write!(writer, ",{latency}")?;
            }
            writeln!(writer)?;
        }
        writer.flush()
    }

    /// Write the matrix to a CSV file at `path`.
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        let failure = |source| EngineError::ExportFailure {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(failure)?;
        self.write_csv(BufWriter::new(file)).map_err(failure)?;
        log::info!("wrote {} samples to {}", self.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedAdapter;
    use crate::channel::{ChannelRegistry, Target};

    fn trace_of(kind: ChannelKind, targets: Vec<Target>, rows: &[(u64, Vec<Latency>)]) -> Trace {
        let mut adapter = ScriptedAdapter::new(kind, 200);
        let mut registry = ChannelRegistry::new();
        registry.register_all(&mut adapter, targets).unwrap();
        let width = registry.len();
        let mut buf = SampleBuffer::allocate(rows.len(), width).unwrap();
        for (index, row) in rows {
            buf.push(*index, row);
        }
        Trace::new(
            registry.channels().to_vec(),
            Threshold::new(200),
            SamplerMode::RepeatedProbe,
            buf,
        )
    }

    fn set_trace() -> Trace {
        trace_of(
            ChannelKind::CacheSet,
            vec![Target::Set(0), Target::Set(16)],
            &[(0, vec![0, 300]), (1, vec![150, 120]), (2, vec![210, 0])],
        )
    }

    #[test]
    fn csv_header_and_rows() {
        let mut out = Vec::new();
        set_trace().write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "Sample,Set0,Set16\n0,0,300\n1,150,120\n2,210,0\n");
    }

    #[test]
    fn line_columns_use_channel_ids() {
        let trace = trace_of(
            ChannelKind::AddressLine,
            vec![Target::Address(0x4000), Target::Address(0x4040)],
            &[(7, vec![50, 400])],
        );
        assert_eq!(trace.column_names(), vec!["Sample", "Line0", "Line1"]);
        assert_eq!(trace.to_matrix(), vec![vec![7, 50, 400]]);
    }

    #[test]
    fn report_marks_invalid_and_activity() {
        let report = set_trace().to_report();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Sample    0: S0:Invalid S1: 300(Active) | Active");
        assert_eq!(lines[1], "Sample    1: S0: 150(Idle) S1: 120(Idle) | Idle");
        assert!(lines[2].ends_with("S1:Invalid | Active"));
    }

    #[test]
    fn line_report_uses_hit_and_miss() {
        let trace = trace_of(
            ChannelKind::AddressLine,
            vec![Target::Address(0x4000)],
            &[(0, vec![50]), (1, vec![250])],
        );
        let report = trace.to_report();
        assert!(report.contains("Sample    0:   50 (Hit) | Active"));
        assert!(report.contains("Sample    1:  250 (Miss) | Idle"));
    }

    #[test]
    fn counts_active_samples() {
        assert_eq!(set_trace().active_samples(), 2);
    }

    #[test]
    fn export_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        let err = set_trace().export_csv(&path).unwrap_err();
        assert!(matches!(err, EngineError::ExportFailure { .. }));
    }

    #[test]
    fn export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        set_trace().export_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Sample,Set0,Set16\n"));
        assert_eq!(text.lines().count(), 4);
    }
}
