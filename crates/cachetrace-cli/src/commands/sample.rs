//! `cachetrace probe` and `cachetrace trace` - run one sampling session.

use std::collections::HashMap;

use cachetrace_core::record::parse_tag;
use cachetrace_core::{CancelToken, RecordConfig, Recorder, Result, WorkloadGenerator};

use super::{OutputArgs, SamplingArgs, TargetArgs};

/// Idle-gate overrides; `None` on the command means repeated probe.
pub struct Gate {
    pub max_idle: Option<usize>,
    pub max_wait: Option<u64>,
}

pub struct SampleCommand<'a> {
    pub target: &'a TargetArgs,
    pub sampling: &'a SamplingArgs,
    pub output: &'a OutputArgs,
    pub gate: Option<Gate>,
    pub quiet: bool,
}

pub fn run(cmd: SampleCommand<'_>) {
    if let Err(e) = execute(&cmd) {
        super::fail(&e);
    }
}

fn execute(cmd: &SampleCommand<'_>) -> Result<()> {
    let mut config = super::resolve_config(cmd.target, Some(cmd.sampling))?;
    let sampler = match &cmd.gate {
        None => config.repeated_probe(),
        Some(gate) => {
            if let Some(max_idle) = gate.max_idle {
                config.max_idle = max_idle;
            }
            if gate.max_wait.is_some() {
                config.max_wait_slots = gate.max_wait;
            }
            config.idle_gated()
        }
    };

    super::pin(&config);
    let mut rig = super::open_session(&config, cmd.target)?;
    let threshold = rig.session.calibrate(config.threshold)?;

    let recorder = match &cmd.output.record {
        Some(dir) => {
            let tags = cmd
                .output
                .tag
                .iter()
                .map(|t| parse_tag(t))
                .collect::<Result<HashMap<_, _>>>()?;
            let record = RecordConfig {
                output_dir: dir.clone(),
                tags,
                note: cmd.output.note.clone(),
            };
            Some(Recorder::new(record, rig.session.adapter_name())?)
        }
        None => None,
    };

    if !cmd.quiet {
        println!("cachetrace {}", sampler.mode);
        println!("  Adapter:   {}", rig.session.adapter_name());
        println!("  Channels:  {}", rig.victim.describe());
        println!("  Threshold: {threshold}");
        println!("  Samples:   up to {}", sampler.max_samples);
        println!("  Slot time: {} cycles", sampler.slot_time);
        if let Some(recorder) = &recorder {
            println!("  Recording: {}", recorder.session_dir().display());
        }
        println!();
    }

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || on_interrupt.cancel()) {
        log::warn!("Ctrl+C will not stop sampling cleanly: {e}");
    }

    let workload = if cmd.sampling.workload {
        Some(WorkloadGenerator::spawn(rig.victim.workload()?, config.workload)?)
    } else {
        None
    };

    let trace = rig.session.run(&sampler, &cancel)?;

    if let Some(workload) = workload {
        let rounds = workload.stop();
        log::info!("workload ran {rounds} rounds");
    }
    if cancel.is_cancelled() {
        eprintln!("Interrupted; keeping {} samples", trace.len());
    }

    if !cmd.quiet {
        print!("{}", trace.to_report());
    }
    println!(
        "Collected {} samples ({} active)",
        trace.len(),
        trace.active_samples()
    );

    if let Some(path) = &cmd.output.output {
        trace.export_csv(path)?;
        println!("Matrix written to {}", path.display());
    }
    if let Some(recorder) = recorder {
        let dir = recorder.finish(&trace, &sampler)?;
        println!("Session saved to {}", dir.display());
    }

    rig.session.finish();
    Ok(())
}
