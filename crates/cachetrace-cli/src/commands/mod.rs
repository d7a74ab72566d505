pub mod analyze;
pub mod calibrate;
pub mod sample;
pub mod scan;

use std::path::PathBuf;
use std::sync::Arc;

use cachetrace_core::adapters::{self, AdapterKind, helpers};
use cachetrace_core::{
    CacheToucher, ChannelKind, EngineConfig, EngineError, ProbeAdapter, Result, ScriptedAdapter,
    Session, SymbolTarget, Target, TargetBuffer, ThresholdSource, Workload,
};
use clap::Args;

/// Most rows a scripted demo adapter will synthesise.
const DEMO_MAX_SLOTS: usize = 100_000;

/// What to monitor and how to get a threshold.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// JSON engine config; flags below override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Probe adapter: flush-reload, prime-probe or scripted (hardware-free demo)
    #[arg(long)]
    pub adapter: Option<String>,

    /// Number of cache lines to monitor (Flush+Reload)
    #[arg(long)]
    pub lines: Option<usize>,

    /// Monitor lines of a shared-library function, e.g. libcrypto.so:RSA_private_decrypt
    #[arg(long, value_name = "LIB:SYMBOL")]
    pub symbol: Option<String>,

    /// Monitor cache sets 0..N (Prime+Probe)
    #[arg(long, value_name = "N", conflicts_with = "set")]
    pub sets: Option<usize>,

    /// Monitor cache set I (repeatable, in order)
    #[arg(long = "set", value_name = "I")]
    pub set: Vec<usize>,

    /// Use a fixed threshold in cycles instead of calibrating
    #[arg(long, value_name = "CYCLES")]
    pub threshold: Option<u16>,

    /// Pin the sampling thread to this CPU
    #[arg(long)]
    pub cpu: Option<usize>,
}

/// Sample count and pacing.
#[derive(Args, Debug, Clone, Default)]
pub struct SamplingArgs {
    /// Maximum number of samples
    #[arg(long)]
    pub samples: Option<usize>,

    /// Minimum cycles between slots
    #[arg(long)]
    pub slot_time: Option<u64>,

    /// Rows per adapter call in probe mode (cancellation is checked between calls)
    #[arg(long)]
    pub batch: Option<usize>,

    /// Run a synthetic victim thread that touches the monitored lines or sets
    #[arg(long)]
    pub workload: bool,
}

/// Where results go.
#[derive(Args, Debug, Clone, Default)]
pub struct OutputArgs {
    /// Write the latency matrix to this CSV file
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Record a session directory (samples.csv + session.json) under DIR
    #[arg(long, value_name = "DIR")]
    pub record: Option<PathBuf>,

    /// Session tag key:value (repeatable)
    #[arg(long)]
    pub tag: Vec<String>,

    /// Free-form note stored in session.json
    #[arg(long)]
    pub note: Option<String>,
}

/// Merge the config file (if any) with command-line overrides.
pub fn resolve_config(target: &TargetArgs, sampling: Option<&SamplingArgs>) -> Result<EngineConfig> {
    let mut config = match &target.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(name) = &target.adapter {
        config.adapter = AdapterKind::parse(name)?;
    }
    if let Some(lines) = target.lines {
        config.lines = lines;
    }
    if let Some(n) = target.sets {
        if n == 0 {
            return Err(EngineError::Config("--sets must be at least 1".into()));
        }
        config.sets = (0..n).collect();
    }
    if !target.set.is_empty() {
        config.sets = target.set.clone();
    }
    if let Some(cycles) = target.threshold {
        config.threshold = ThresholdSource::Fixed(cycles);
    }
    if target.cpu.is_some() {
        config.cpu = target.cpu;
    }

    if let Some(sampling) = sampling {
        if let Some(samples) = sampling.samples {
            config.max_samples = samples;
        }
        if let Some(slot_time) = sampling.slot_time {
            config.slot_time = slot_time;
        }
        if sampling.batch.is_some() {
            config.batch_slots = sampling.batch;
        }
    }

    config.validate()?;
    Ok(config)
}

/// Pin the current thread if the config asks for it. Best-effort.
pub fn pin(config: &EngineConfig) {
    if let Some(cpu) = config.cpu {
        match helpers::pin_current_thread(cpu) {
            Ok(()) => log::debug!("pinned sampler to CPU {cpu}"),
            Err(e) => log::warn!("could not pin to CPU {cpu}: {e}"),
        }
    }
}

/// What the monitored channels point at; also what a synthetic victim
/// should touch. The session retains its own reference to the memory.
pub enum Victim {
    Lines(Arc<TargetBuffer>),
    Symbol(Arc<SymbolTarget>, usize),
    Sets(Vec<usize>),
}

impl Victim {
    pub fn describe(&self) -> String {
        match self {
            Self::Lines(buffer) => format!("{} lines of a private buffer", buffer.lines()),
            Self::Symbol(symbol, lines) => format!(
                "{lines} lines of {} in {} at {:#x}",
                symbol.symbol(),
                symbol.library(),
                symbol.addr()
            ),
            Self::Sets(sets) => format!("cache sets {sets:?}"),
        }
    }

    pub fn workload(&self) -> Result<Box<dyn Workload>> {
        Ok(match self {
            Self::Lines(buffer) => Box::new(CacheToucher::lines(Arc::clone(buffer))),
            Self::Symbol(symbol, lines) => Box::new(CacheToucher::symbol(Arc::clone(symbol), *lines)),
            Self::Sets(sets) => Box::new(CacheToucher::sets(sets)?),
        })
    }
}

/// A session with its channels registered, plus the memory they watch.
pub struct Rig {
    pub session: Session,
    pub victim: Victim,
}

/// Prepare the adapter and register every channel the config names.
pub fn open_session(config: &EngineConfig, target: &TargetArgs) -> Result<Rig> {
    let kind = match config.adapter.channel_kind() {
        Some(kind) => kind,
        None if target.lines.is_some() || target.symbol.is_some() => ChannelKind::AddressLine,
        None => ChannelKind::CacheSet,
    };
    if kind == ChannelKind::CacheSet && target.symbol.is_some() {
        return Err(EngineError::Config(format!(
            "--symbol needs address-line channels, but {} monitors cache sets",
            config.adapter
        )));
    }

    let adapter: Box<dyn ProbeAdapter> = match config.adapter {
        AdapterKind::Scripted => {
            let width = match kind {
                ChannelKind::AddressLine => config.lines,
                ChannelKind::CacheSet => config.monitored_sets().len(),
            };
            let slots = config.max_samples.saturating_mul(2).clamp(256, DEMO_MAX_SLOTS);
            Box::new(ScriptedAdapter::demo(kind, width, slots))
        }
        other => adapters::prepare(other)?,
    };
    let mut session = Session::new(adapter);

    let victim = match kind {
        ChannelKind::CacheSet => {
            let sets = config.monitored_sets();
            session.register_all(sets.iter().copied().map(Target::Set))?;
            Victim::Sets(sets)
        }
        ChannelKind::AddressLine => match &target.symbol {
            Some(spec) => {
                let (library, name) = SymbolTarget::parse_spec(spec)?;
                let symbol = Arc::new(SymbolTarget::resolve(&library, &name)?);
                session.retain(Arc::clone(&symbol))?;
                session.register_all(symbol.line_targets(config.lines))?;
                Victim::Symbol(symbol, config.lines)
            }
            None => {
                let buffer = Arc::new(TargetBuffer::new(config.lines)?);
                session.retain(Arc::clone(&buffer))?;
                session.register_all(buffer.line_targets())?;
                Victim::Lines(buffer)
            }
        },
    };

    Ok(Rig { session, victim })
}

/// Print the error and its causes, then exit 1.
pub fn fail(err: &EngineError) -> ! {
    eprintln!("Error: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let target = TargetArgs {
            adapter: Some("scripted".into()),
            set: vec![5, 9],
            threshold: Some(180),
            ..Default::default()
        };
        let sampling = SamplingArgs {
            samples: Some(64),
            ..Default::default()
        };
        let config = resolve_config(&target, Some(&sampling)).unwrap();
        assert_eq!(config.adapter, AdapterKind::Scripted);
        assert_eq!(config.monitored_sets(), vec![5, 9]);
        assert_eq!(config.threshold, ThresholdSource::Fixed(180));
        assert_eq!(config.max_samples, 64);
    }

    #[test]
    fn zero_sets_is_rejected() {
        let target = TargetArgs {
            adapter: Some("scripted".into()),
            sets: Some(0),
            ..Default::default()
        };
        match resolve_config(&target, None) {
            Err(EngineError::Config(msg)) => assert!(msg.contains("--sets"), "{msg}"),
            other => panic!("expected a config error, got {other:?}"),
        }

        let target = TargetArgs {
            sets: Some(2),
            ..target
        };
        assert_eq!(resolve_config(&target, None).unwrap().monitored_sets(), vec![0, 1]);
    }

    #[test]
    fn scripted_rig_picks_kind_from_flags() {
        let target = TargetArgs {
            adapter: Some("scripted".into()),
            lines: Some(3),
            ..Default::default()
        };
        let config = resolve_config(&target, None).unwrap();
        let rig = open_session(&config, &target).unwrap();
        assert_eq!(rig.session.channels().len(), 3);
        assert_eq!(rig.session.channels()[0].kind(), ChannelKind::AddressLine);
        assert!(matches!(rig.victim, Victim::Lines(_)));
    }

    #[test]
    fn symbol_on_set_adapter_is_rejected() {
        let target = TargetArgs {
            adapter: Some("prime-probe".into()),
            symbol: Some("libc.so.6:memcpy".into()),
            ..Default::default()
        };
        let config = resolve_config(&target, None).unwrap();
        assert!(matches!(
            open_session(&config, &target),
            Err(EngineError::Config(_))
        ));
    }
}
