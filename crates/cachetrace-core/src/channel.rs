//! Channels and the registry that hands out their ids.
//!
//! A channel is one monitored target: a single cache line (Flush+Reload) or a
//! whole cache set (Prime+Probe). Channel ids are assigned in registration
//! order and double as the column order of every exported matrix.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::probe::ProbeAdapter;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable, 0-based channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub usize);

impl ChannelId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Granularity of a channel, which also fixes the direction of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One cache line, probed by flush + timed reload. Fast reload = activity.
    AddressLine,
    /// One cache set, probed by prime + timed probe. Slow probe = activity.
    CacheSet,
}

impl ChannelKind {
    /// Column name prefix used in CSV headers.
    pub fn column_prefix(self) -> &'static str {
        match self {
            Self::AddressLine => "Line",
            Self::CacheSet => "Set",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddressLine => write!(f, "address_line"),
            Self::CacheSet => write!(f, "cache_set"),
        }
    }
}

/// What a channel watches. The descriptor is opaque to the engine and only
/// interpreted by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Virtual address of a cache line.
    Address(usize),
    /// Cache set index.
    Set(usize),
}

impl Target {
    pub fn kind(self) -> ChannelKind {
        match self {
            Self::Address(_) => ChannelKind::AddressLine,
            Self::Set(_) => ChannelKind::CacheSet,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "address {addr:#x}"),
            Self::Set(set) => write!(f, "cache set {set}"),
        }
    }
}

/// A registered, immutable channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    target: Target,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Column header for this channel, e.g. `Set16` or `Line2`.
    pub fn column_name(&self) -> String {
        match self.target {
            Target::Set(set) => format!("Set{set}"),
            Target::Address(_) => format!("{}{}", self.kind.column_prefix(), self.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered set of monitored channels.
///
/// Registration is fail-fast: a rejected target aborts the session and
/// earlier registrations are not rolled back. Once sealed (at calibration)
/// no further channel may be added.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
    sealed: bool,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the adapter to monitor `target` and append it as the next channel.
    pub fn register<A>(&mut self, adapter: &mut A, target: Target) -> Result<ChannelId>
    where
        A: ProbeAdapter + ?Sized,
    {
        if self.sealed {
            return Err(EngineError::SessionState(
                "channels cannot be registered after calibration",
            ));
        }

        let id = ChannelId(self.channels.len());
        let kind = target.kind();
        let (name, supported) = {
            let info = adapter.info();
            (info.name, info.kind)
        };

        if supported != kind {
            return Err(EngineError::MonitorFailure {
                channel: id,
                target,
                reason: format!("{name} adapter monitors {supported} channels"),
            });
        }

        if !adapter.monitor(target) {
            return Err(EngineError::MonitorFailure {
                channel: id,
                target,
                reason: format!("{name} adapter rejected the target"),
            });
        }

        log::debug!("registered channel {id} ({kind}) -> {target}");
        self.channels.push(Channel { id, kind, target });
        Ok(id)
    }

    /// Register every target in order; the first failure aborts.
    pub fn register_all<A, I>(&mut self, adapter: &mut A, targets: I) -> Result<Vec<ChannelId>>
    where
        A: ProbeAdapter + ?Sized,
        I: IntoIterator<Item = Target>,
    {
        targets
            .into_iter()
            .map(|target| self.register(adapter, target))
            .collect()
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedAdapter;

    #[test]
    fn ids_follow_registration_order() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 200);
        let mut registry = ChannelRegistry::new();

        let ids = registry
            .register_all(&mut adapter, (0..4).map(Target::Set))
            .unwrap();

        assert_eq!(ids, vec![ChannelId(0), ChannelId(1), ChannelId(2), ChannelId(3)]);
        assert_eq!(registry.len(), 4);
        for (i, ch) in registry.channels().iter().enumerate() {
            assert_eq!(ch.id(), ChannelId(i));
            assert_eq!(ch.target(), Target::Set(i));
            assert_eq!(ch.kind(), ChannelKind::CacheSet);
        }
    }

    #[test]
    fn partial_registration_is_fatal_and_keeps_prefix() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::CacheSet, 200).fail_monitor_at(2);
        let mut registry = ChannelRegistry::new();

        let err = registry
            .register_all(&mut adapter, (0..4).map(Target::Set))
            .unwrap_err();

        match err {
            EngineError::MonitorFailure { channel, target, .. } => {
                assert_eq!(channel, ChannelId(2));
                assert_eq!(target, Target::Set(2));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::AddressLine, 200);
        let mut registry = ChannelRegistry::new();
        let err = registry.register(&mut adapter, Target::Set(0)).unwrap_err();
        match err {
            EngineError::MonitorFailure { channel, reason, .. } => {
                assert_eq!(channel, ChannelId(0));
                assert!(reason.contains("address_line"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());

        // The adapter is still usable for channels of its own kind.
        assert_eq!(
            registry.register(&mut adapter, Target::Address(0x1000)).unwrap(),
            ChannelId(0)
        );
    }

    #[test]
    fn sealed_registry_refuses_new_channels() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::AddressLine, 200);
        let mut registry = ChannelRegistry::new();
        registry.register(&mut adapter, Target::Address(0x1000)).unwrap();
        registry.seal();
        let err = registry
            .register(&mut adapter, Target::Address(0x1040))
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionState(_)));
    }

    #[test]
    fn column_names() {
        let mut adapter = ScriptedAdapter::new(ChannelKind::AddressLine, 200);
        let mut registry = ChannelRegistry::new();
        registry.register(&mut adapter, Target::Address(0x1000)).unwrap();
        registry.register(&mut adapter, Target::Address(0x1040)).unwrap();
        let names: Vec<String> = registry.channels().iter().map(Channel::column_name).collect();
        assert_eq!(names, vec!["Line0", "Line1"]);

        let set = Channel {
            id: ChannelId(0),
            kind: ChannelKind::CacheSet,
            target: Target::Set(16),
        };
        assert_eq!(set.column_name(), "Set16");
    }
}
