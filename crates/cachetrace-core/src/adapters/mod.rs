//! Probe adapter implementations.

pub mod helpers;

pub mod flush_reload;
pub mod prime_probe;
pub mod scripted;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelKind;
use crate::error::{EngineError, Result};
use crate::probe::{AdapterInfo, ProbeAdapter};

pub use flush_reload::FlushReload;
pub use prime_probe::PrimeProbe;
pub use scripted::ScriptedAdapter;

/// Adapters selectable by name from configuration or the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    FlushReload,
    PrimeProbe,
    /// Hardware-free demo; channel kind chosen separately.
    Scripted,
}

impl AdapterKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "flush-reload" | "flush_reload" | "fr" => Ok(Self::FlushReload),
            "prime-probe" | "prime_probe" | "pp" => Ok(Self::PrimeProbe),
            "scripted" | "demo" => Ok(Self::Scripted),
            other => Err(EngineError::Config(format!("unknown adapter '{other}'"))),
        }
    }

    /// Channel kind the adapter monitors; `None` for the scripted adapter,
    /// which can play either.
    pub fn channel_kind(self) -> Option<ChannelKind> {
        match self {
            Self::FlushReload => Some(ChannelKind::AddressLine),
            Self::PrimeProbe => Some(ChannelKind::CacheSet),
            Self::Scripted => None,
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FlushReload => write!(f, "flush-reload"),
            Self::PrimeProbe => write!(f, "prime-probe"),
            Self::Scripted => write!(f, "scripted"),
        }
    }
}

/// Availability of one hardware adapter on this machine.
#[derive(Debug, Clone)]
pub struct AdapterStatus {
    pub kind: AdapterKind,
    pub info: &'static AdapterInfo,
    pub available: bool,
}

/// Every hardware adapter and whether it can run here.
pub fn adapter_statuses() -> Vec<AdapterStatus> {
    vec![
        AdapterStatus {
            kind: AdapterKind::FlushReload,
            info: FlushReload::static_info(),
            available: FlushReload::is_available(),
        },
        AdapterStatus {
            kind: AdapterKind::PrimeProbe,
            info: PrimeProbe::static_info(),
            available: PrimeProbe::is_available(),
        },
    ]
}

/// Prepare a hardware adapter by kind.
///
/// The scripted adapter needs a script, so it is built directly with
/// [`ScriptedAdapter`] rather than through this function.
pub fn prepare(kind: AdapterKind) -> Result<Box<dyn ProbeAdapter>> {
    match kind {
        AdapterKind::FlushReload => Ok(Box::new(FlushReload::prepare()?)),
        AdapterKind::PrimeProbe => Ok(Box::new(PrimeProbe::prepare()?)),
        AdapterKind::Scripted => Err(EngineError::AdapterInitFailure {
            adapter: kind.to_string(),
            reason: "scripted adapters are built from a script".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names_and_aliases() {
        assert_eq!(AdapterKind::parse("flush-reload").unwrap(), AdapterKind::FlushReload);
        assert_eq!(AdapterKind::parse("FR").unwrap(), AdapterKind::FlushReload);
        assert_eq!(AdapterKind::parse("prime_probe").unwrap(), AdapterKind::PrimeProbe);
        assert_eq!(AdapterKind::parse("demo").unwrap(), AdapterKind::Scripted);
        assert!(AdapterKind::parse("evict-time").is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for kind in [
            AdapterKind::FlushReload,
            AdapterKind::PrimeProbe,
            AdapterKind::Scripted,
        ] {
            assert_eq!(AdapterKind::parse(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn statuses_cover_hardware_adapters() {
        let statuses = adapter_statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.info.platform.to_string() == "x86_64"));
    }

    #[test]
    fn scripted_is_not_prepared_by_kind() {
        assert!(prepare(AdapterKind::Scripted).is_err());
    }
}
