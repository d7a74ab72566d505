//! Threshold calibration.
//!
//! A session calibrates exactly once, after every channel is registered and
//! before the first sample. The resulting [`Threshold`] is frozen for the
//! rest of the session; there is no way to recalibrate.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::probe::{Latency, ProbeAdapter};

/// Frozen latency boundary between fast and slow accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Threshold(Latency);

impl Threshold {
    pub fn new(latency: Latency) -> Self {
        Self(latency)
    }

    pub fn cycles(self) -> Latency {
        self.0
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} cycles", self.0)
    }
}

/// Where the threshold comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    /// Ask the adapter to measure it.
    #[default]
    Calibrate,
    /// Use a known value (e.g. ~200 cycles for L1 Prime+Probe) without
    /// touching the adapter's calibration routine.
    Fixed(Latency),
}

/// One-shot threshold holder.
#[derive(Debug, Default)]
pub struct Calibrator {
    threshold: OnceLock<Threshold>,
}

impl Calibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run calibration. A second call is a session error, not a recalibration.
    pub fn calibrate<A>(&self, adapter: &mut A, source: ThresholdSource) -> Result<Threshold>
    where
        A: ProbeAdapter + ?Sized,
    {
        if self.threshold.get().is_some() {
            return Err(EngineError::SessionState("threshold is already calibrated"));
        }

        let threshold = match source {
            ThresholdSource::Calibrate => adapter
                .probe_threshold()
                .map(Threshold)
                .map_err(EngineError::CalibrationFailure)?,
            ThresholdSource::Fixed(latency) => Threshold(latency),
        };

        if threshold.0 == 0 {
            return Err(EngineError::CalibrationFailure(
                crate::error::AdapterError::Failed("threshold of 0 cycles classifies nothing".into()),
            ));
        }

        log::info!("{} threshold: {threshold}", adapter.name());
        self.threshold
            .set(threshold)
            .map_err(|_| EngineError::SessionState("threshold is already calibrated"))?;
        Ok(threshold)
    }

    /// The frozen threshold, if calibration has run.
    pub fn threshold(&self) -> Option<Threshold> {
        self.threshold.get().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedAdapter;
    use crate::channel::ChannelKind;

    #[test]
    fn calibrates_once_and_freezes() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::AddressLine, 180);
        let counters = adapter.counters();
        let calibrator = Calibrator::new();

        let t = calibrator
            .calibrate(&mut adapter, ThresholdSource::Calibrate)
            .unwrap();
        assert_eq!(t, Threshold::new(180));
        assert_eq!(calibrator.threshold(), Some(t));
        assert_eq!(calibrator.threshold(), Some(t));

        let err = calibrator
            .calibrate(&mut adapter, ThresholdSource::Calibrate)
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionState(_)));
        assert_eq!(counters.calibrations(), 1);
        assert_eq!(calibrator.threshold(), Some(t));
    }

    #[test]
    fn fixed_threshold_skips_adapter() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 999);
        let counters = adapter.counters();
        let calibrator = Calibrator::new();
        let t = calibrator
            .calibrate(&mut adapter, ThresholdSource::Fixed(200))
            .unwrap();
        assert_eq!(t.cycles(), 200);
        assert_eq!(counters.calibrations(), 0);
    }

    #[test]
    fn adapter_failure_is_calibration_failure() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 200).fail_calibration();
        let calibrator = Calibrator::new();
        let err = calibrator
            .calibrate(&mut adapter, ThresholdSource::Calibrate)
            .unwrap_err();
        assert!(matches!(err, EngineError::CalibrationFailure(_)));
        assert_eq!(calibrator.threshold(), None);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 200);
        let calibrator = Calibrator::new();
        assert!(
            calibrator
                .calibrate(&mut adapter, ThresholdSource::Fixed(0))
                .is_err()
        );
    }
}
