//! `cachetrace calibrate` - show the threshold a session would freeze.

use cachetrace_core::Result;

use super::TargetArgs;

pub fn run(target: &TargetArgs) {
    if let Err(e) = execute(target) {
        super::fail(&e);
    }
}

fn execute(target: &TargetArgs) -> Result<()> {
    let config = super::resolve_config(target, None)?;
    super::pin(&config);

    let mut rig = super::open_session(&config, target)?;
    let threshold = rig.session.calibrate(config.threshold)?;

    println!("Adapter:   {}", rig.session.adapter_name());
    println!("Channels:  {}", rig.victim.describe());
    for channel in rig.session.channels() {
        println!("  {:<8} {}", channel.column_name(), channel.target());
    }
    println!("Threshold: {threshold}");

    rig.session.finish();
    Ok(())
}
