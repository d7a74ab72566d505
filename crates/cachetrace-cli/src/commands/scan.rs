use cachetrace_core::adapters::adapter_statuses;
use cachetrace_core::{ChannelKind, ProbeAdapter, ScriptedAdapter};

pub fn run() {
    println!(
        "Platform: {} {} (Rust)",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!();

    let statuses = adapter_statuses();
    let available = statuses.iter().filter(|s| s.available).count();
    println!("{available} of {} hardware adapter(s) available:\n", statuses.len());
    for status in &statuses {
        let mark = if status.available { "\u{2705}" } else { "\u{274C}" };
        println!(
            "  {mark} {:<14} {:<13} {}",
            status.kind.to_string(),
            status.info.kind.to_string(),
            status.info.description
        );
        if !status.available {
            println!("     requires {}", status.info.platform);
        }
    }

    let demo = ScriptedAdapter::new(ChannelKind::CacheSet, 200);
    println!("\nAlways available:\n");
    println!(
        "  \u{1F504} {:<14} {:<13} {}",
        "scripted",
        "either",
        demo.info().mechanism
    );
}
