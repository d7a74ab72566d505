//! CLI for cachetrace: watch cache lines and cache sets light up.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{OutputArgs, SamplingArgs, TargetArgs};

#[derive(Parser)]
#[command(name = "cachetrace")]
#[command(about = "cachetrace: cache-timing side-channel sampler (Flush+Reload, Prime+Probe)")]
#[command(version = cachetrace_core::VERSION)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only print errors and the final summary
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List probe adapters and whether they run on this machine
    Scan,

    /// Register channels and print the threshold the adapter would freeze
    Calibrate {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Repeated probe: a fixed number of samples at a fixed slot cadence
    Probe {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Idle-gated trace: wait for activity, keep slots until the channels go quiet
    Trace {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        #[command(flatten)]
        output: OutputArgs,

        /// Consecutive idle slots after activity before the trace stops
        #[arg(long)]
        max_idle: Option<usize>,

        /// Give up after this many slots without any activity
        #[arg(long)]
        max_wait: Option<u64>,
    },

    /// Summarise an exported matrix or a recorded session directory
    Analyze {
        /// CSV file or session directory
        path: PathBuf,

        /// Threshold in cycles (default: the one in session.json)
        #[arg(long)]
        threshold: Option<u16>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Scan => commands::scan::run(),
        Commands::Calibrate { target } => commands::calibrate::run(&target),
        Commands::Probe {
            target,
            sampling,
            output,
        } => commands::sample::run(commands::sample::SampleCommand {
            target: &target,
            sampling: &sampling,
            output: &output,
            gate: None,
            quiet: cli.quiet,
        }),
        Commands::Trace {
            target,
            sampling,
            output,
            max_idle,
            max_wait,
        } => commands::sample::run(commands::sample::SampleCommand {
            target: &target,
            sampling: &sampling,
            output: &output,
            gate: Some(commands::sample::Gate { max_idle, max_wait }),
            quiet: cli.quiet,
        }),
        Commands::Analyze {
            path,
            threshold,
            json,
        } => commands::analyze::run(&path, threshold, json),
    }
}
