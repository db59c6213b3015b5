use anyhow::{bail, Result};
use log::{info, warn};

mod stress;

use stress::StressConfig;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => StressConfig::from_file(&path)?,
        None => StressConfig::default(),
    };

    info!(
        "md-stress starting: {} threads x {} MDs, {} partitions",
        config.threads, config.iterations, config.md.ncpts
    );

    let report = stress::run(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.violations.is_empty() {
        for v in &report.violations {
            warn!("{}", v);
        }
        bail!("{} lifecycle violations", report.violations.len());
    }

    info!(
        "md-stress complete: {} MDs, {} operations, {} events",
        report.created, report.ops, report.events
    );
    Ok(())
}
