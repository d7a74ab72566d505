//! `cachetrace analyze` - per-channel summary of an exported matrix.

use std::path::Path;

use cachetrace_core::record::load_meta;
use cachetrace_core::{EngineError, MatrixSummary, Result, Threshold, load_matrix, summarize};

pub fn run(path: &Path, threshold: Option<u16>, json: bool) {
    if let Err(e) = execute(path, threshold, json) {
        super::fail(&e);
    }
}

fn execute(path: &Path, threshold: Option<u16>, json: bool) -> Result<()> {
    let threshold = match threshold {
        Some(cycles) => Threshold::new(cycles),
        None if path.is_dir() => load_meta(path)?.threshold,
        None => {
            return Err(EngineError::Config(
                "--threshold is required unless PATH is a recorded session directory".into(),
            ));
        }
    };

    let matrix = load_matrix(path)?;
    let summary = summarize(&matrix, threshold);

    if json {
        let text = serde_json::to_string_pretty(&summary)
            .map_err(|e| EngineError::Config(format!("cannot serialise summary: {e}")))?;
        println!("{text}");
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &MatrixSummary) {
    println!("Threshold: {}", summary.threshold);
    println!(
        "Samples:   {} ({} active, {} bursts)",
        summary.samples,
        summary.active_samples,
        summary.bursts.len()
    );
    println!();
    println!(
        "  {:<8} {:>7} {:>7} {:>7} {:>6} {:>6} {:>8} {:>7}",
        "Channel", "valid", "invalid", "active", "min", "max", "mean", "rate"
    );
    for ch in &summary.channels {
        let fmt = |v: Option<u16>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        println!(
            "  {:<8} {:>7} {:>7} {:>7} {:>6} {:>6} {:>8} {:>6.1}%",
            ch.name,
            ch.valid,
            ch.invalid,
            ch.active,
            fmt(ch.min),
            fmt(ch.max),
            ch.mean.map_or_else(|| "-".to_string(), |m| format!("{m:.1}")),
            ch.activity_rate * 100.0
        );
    }

    if !summary.bursts.is_empty() {
        println!();
        println!("Bursts:");
        for burst in summary.bursts.iter().take(20) {
            println!(
                "  samples {:>6}..={:<6} ({} active)",
                burst.first, burst.last, burst.samples
            );
        }
        if summary.bursts.len() > 20 {
            println!("  ... {} more", summary.bursts.len() - 20);
        }
    }
}
