//! Engine configuration, loadable from a JSON file.
//!
//! Every field has a default, so a config file only needs the fields it
//! changes. Command-line flags override whatever the file sets.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::calibrate::ThresholdSource;
use crate::error::{EngineError, Result};
use crate::sampler::{SamplerConfig, SamplerMode};
use crate::workload::WorkloadConfig;

pub const DEFAULT_MAX_SAMPLES: usize = 1000;
/// Cycles between slots.
pub const DEFAULT_SLOT_TIME: u64 = 1000;
pub const DEFAULT_MAX_IDLE: usize = 50;
pub const DEFAULT_LINES: usize = 4;
pub const DEFAULT_SETS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub adapter: AdapterKind,
    /// Address lines to monitor (Flush+Reload).
    pub lines: usize,
    /// Cache sets to monitor (Prime+Probe). Empty means `0..DEFAULT_SETS`.
    pub sets: Vec<usize>,
    pub max_samples: usize,
    pub slot_time: u64,
    pub max_idle: usize,
    pub max_wait_slots: Option<u64>,
    pub threshold: ThresholdSource,
    pub batch_slots: Option<usize>,
    /// Pin the sampling thread to this CPU.
    pub cpu: Option<usize>,
    pub workload: WorkloadConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::PrimeProbe,
            lines: DEFAULT_LINES,
            sets: Vec::new(),
            max_samples: DEFAULT_MAX_SAMPLES,
            slot_time: DEFAULT_SLOT_TIME,
            max_idle: DEFAULT_MAX_IDLE,
            max_wait_slots: None,
            threshold: ThresholdSource::Calibrate,
            batch_slots: None,
            cpu: None,
            workload: WorkloadConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_samples == 0 {
            return Err(EngineError::Config("max_samples must be at least 1".into()));
        }
        if self.lines == 0 {
            return Err(EngineError::Config("lines must be at least 1".into()));
        }
        if self.batch_slots == Some(0) {
            return Err(EngineError::Config("batch_slots must be at least 1".into()));
        }
        if let ThresholdSource::Fixed(0) = self.threshold {
            return Err(EngineError::Config("a fixed threshold must be above 0".into()));
        }
        let mut seen = self.sets.clone();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::Config("sets contain duplicates".into()));
        }
        Ok(())
    }

    /// Sets to monitor, in registration order.
    pub fn monitored_sets(&self) -> Vec<usize> {
        if self.sets.is_empty() {
            (0..DEFAULT_SETS).collect()
        } else {
            self.sets.clone()
        }
    }

    pub fn repeated_probe(&self) -> SamplerConfig {
        self.sampler_config(SamplerMode::RepeatedProbe)
    }

    pub fn idle_gated(&self) -> SamplerConfig {
        self.sampler_config(SamplerMode::IdleGated {
            max_idle: self.max_idle,
            max_wait_slots: self.max_wait_slots,
        })
    }

    pub fn sampler_config(&self, mode: SamplerMode) -> SamplerConfig {
        SamplerConfig {
            mode,
            max_samples: self.max_samples,
            slot_time: self.slot_time,
            batch_slots: self.batch_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.monitored_sets(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn loads_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{
                "adapter": "flush-reload",
                "lines": 8,
                "threshold": { "fixed": 180 },
                "max_idle": 10,
                "workload": { "iterations": 5 }
            }"#,
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.adapter, AdapterKind::FlushReload);
        assert_eq!(config.lines, 8);
        assert_eq!(config.threshold, ThresholdSource::Fixed(180));
        assert_eq!(config.max_samples, DEFAULT_MAX_SAMPLES);
        assert_eq!(config.workload.iterations, 5);
        assert_eq!(
            config.idle_gated().mode,
            SamplerMode::IdleGated {
                max_idle: 10,
                max_wait_slots: None
            }
        );
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(serde_json::from_str::<EngineConfig>(r#"{"max_sample": 5}"#).is_err());

        let zero = EngineConfig {
            max_samples: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let dup = EngineConfig {
            sets: vec![3, 1, 3],
            ..Default::default()
        };
        assert!(dup.validate().is_err());
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/cachetrace.json")).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
