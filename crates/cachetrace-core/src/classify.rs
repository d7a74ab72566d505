//! Per-sample classification against the frozen threshold.
//!
//! The comparison direction depends on the channel kind:
//!
//! - **Address lines** (Flush+Reload): `latency < threshold` is activity. A
//!   fast reload means the flushed line was brought back into the cache.
//! - **Cache sets** (Prime+Probe): `latency > threshold` is activity. A slow
//!   probe means our primed lines were evicted.
//!
//! A latency of exactly [`INVALID_LATENCY`] is never a measurement. It is
//! labelled [`Label::Invalid`] and ignored when computing `any_active`.

use serde::{Deserialize, Serialize};

use crate::calibrate::Threshold;
use crate::channel::{Channel, ChannelKind};
use crate::probe::{INVALID_LATENCY, Latency};

/// Outcome for one channel in one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// Access observed.
    Active,
    /// No access observed.
    Idle,
    /// No usable measurement.
    Invalid,
}

impl Label {
    /// Flush+Reload spelling of [`Label::Active`].
    pub const HIT: Label = Label::Active;
    /// Flush+Reload spelling of [`Label::Idle`].
    pub const MISS: Label = Label::Idle;

    pub fn is_active(self) -> bool {
        self == Self::Active
    }

    /// Display name in the vocabulary of the channel kind.
    pub fn name(self, kind: ChannelKind) -> &'static str {
        match (self, kind) {
            (Self::Invalid, _) => "Invalid",
            (Self::Active, ChannelKind::AddressLine) => "Hit",
            (Self::Idle, ChannelKind::AddressLine) => "Miss",
            (Self::Active, ChannelKind::CacheSet) => "Active",
            (Self::Idle, ChannelKind::CacheSet) => "Idle",
        }
    }
}

/// Classify a single latency.
pub fn classify_latency(latency: Latency, threshold: Threshold, kind: ChannelKind) -> Label {
    if latency == INVALID_LATENCY {
        return Label::Invalid;
    }
    let active = match kind {
        ChannelKind::AddressLine => latency < threshold.cycles(),
        ChannelKind::CacheSet => latency > threshold.cycles(),
    };
    if active { Label::Active } else { Label::Idle }
}

/// Labels for every channel of one sample plus the "any channel active"
/// summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub labels: Vec<Label>,
    pub any_active: bool,
}

/// Stateless classifier bound to a session's channel kinds and threshold.
#[derive(Debug, Clone)]
pub struct Classifier {
    threshold: Threshold,
    kinds: Vec<ChannelKind>,
}

impl Classifier {
    pub fn new(threshold: Threshold, channels: &[Channel]) -> Self {
        Self {
            threshold,
            kinds: channels.iter().map(Channel::kind).collect(),
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn width(&self) -> usize {
        self.kinds.len()
    }

    /// Classify one row of latencies (one per channel, in channel order).
    pub fn classify(&self, latencies: &[Latency]) -> Classification {
        debug_assert_eq!(latencies.len(), self.kinds.len());
        let labels: Vec<Label> = latencies
            .iter()
            .zip(&self.kinds)
            .map(|(&latency, &kind)| classify_latency(latency, self.threshold, kind))
            .collect();
        let any_active = labels.iter().any(|l| l.is_active());
        Classification { labels, any_active }
    }

    /// `any_active` without allocating the label vector. Used on the hot
    /// path of the idle gate.
    pub fn any_active(&self, latencies: &[Latency]) -> bool {
        latencies
            .iter()
            .zip(&self.kinds)
            .any(|(&latency, &kind)| classify_latency(latency, self.threshold, kind).is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedAdapter;
    use crate::channel::{ChannelRegistry, Target};

    fn channels(kind: ChannelKind, n: usize) -> Vec<Channel> {
        let mut adapter = ScriptedAdapter::new(kind, 200);
        let mut registry = ChannelRegistry::new();
        let targets: Vec<Target> = match kind {
            ChannelKind::AddressLine => (0..n).map(|i| Target::Address(0x1000 + i * 64)).collect(),
            ChannelKind::CacheSet => (0..n).map(Target::Set).collect(),
        };
        registry.register_all(&mut adapter, targets).unwrap();
        registry.channels().to_vec()
    }

    #[test]
    fn address_lines_are_active_below_threshold() {
        let t = Threshold::new(200);
        assert_eq!(classify_latency(50, t, ChannelKind::AddressLine), Label::HIT);
        assert_eq!(classify_latency(250, t, ChannelKind::AddressLine), Label::MISS);
        assert_eq!(classify_latency(200, t, ChannelKind::AddressLine), Label::MISS);
    }

    #[test]
    fn cache_sets_are_active_above_threshold() {
        let t = Threshold::new(200);
        assert_eq!(classify_latency(300, t, ChannelKind::CacheSet), Label::Active);
        assert_eq!(classify_latency(150, t, ChannelKind::CacheSet), Label::Idle);
        assert_eq!(classify_latency(200, t, ChannelKind::CacheSet), Label::Idle);
    }

    #[test]
    fn zero_is_invalid_for_both_kinds() {
        let t = Threshold::new(200);
        assert_eq!(classify_latency(0, t, ChannelKind::AddressLine), Label::Invalid);
        assert_eq!(classify_latency(0, t, ChannelKind::CacheSet), Label::Invalid);
    }

    #[test]
    fn single_line_scenario() {
        let classifier = Classifier::new(Threshold::new(200), &channels(ChannelKind::AddressLine, 1));
        let rows: [[Latency; 1]; 3] = [[50], [250], [180]];
        let labels: Vec<Label> = rows.iter().map(|r| classifier.classify(r).labels[0]).collect();
        let active: Vec<bool> = rows.iter().map(|r| classifier.classify(r).any_active).collect();
        assert_eq!(labels, vec![Label::HIT, Label::MISS, Label::HIT]);
        assert_eq!(active, vec![true, false, true]);
    }

    #[test]
    fn four_set_scenario_with_invalid_cells() {
        let classifier = Classifier::new(Threshold::new(200), &channels(ChannelKind::CacheSet, 4));
        let c = classifier.classify(&[0, 300, 150, 0]);
        assert_eq!(
            c.labels,
            vec![Label::Invalid, Label::Active, Label::Idle, Label::Invalid]
        );
        assert!(c.any_active);
        assert!(classifier.any_active(&[0, 300, 150, 0]));
    }

    #[test]
    fn invalid_never_contributes_to_any_active() {
        let classifier = Classifier::new(Threshold::new(200), &channels(ChannelKind::AddressLine, 3));
        let c = classifier.classify(&[0, 0, 0]);
        assert!(!c.any_active);
        assert!(!classifier.any_active(&[0, 0, 0]));
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = Classifier::new(Threshold::new(200), &channels(ChannelKind::CacheSet, 2));
        let a = classifier.classify(&[201, 199]);
        let b = classifier.classify(&[201, 199]);
        assert_eq!(a, b);
    }

    #[test]
    fn label_names_follow_kind() {
        assert_eq!(Label::Active.name(ChannelKind::AddressLine), "Hit");
        assert_eq!(Label::Idle.name(ChannelKind::AddressLine), "Miss");
        assert_eq!(Label::Active.name(ChannelKind::CacheSet), "Active");
        assert_eq!(Label::Invalid.name(ChannelKind::CacheSet), "Invalid");
    }
}
