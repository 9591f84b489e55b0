//! Sandbox housekeeping — `kiln sweep`.

use std::path::PathBuf;

use anyhow::Result;

use kiln::studio::sandbox::{ProcessSandboxProvider, sweep_idle};

pub fn cmd_sweep(data_dir: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(data_dir)?;
    let provider = ProcessSandboxProvider::new(
        config.sandbox_root.clone(),
        config.templates_dir.clone(),
        &config.sandbox_host,
    );
    let reaped = sweep_idle(
        &provider,
        chrono::Duration::seconds(config.sweep_max_pause_secs),
    )?;
    println!("Reaped {} idle sandbox(es)", reaped);
    Ok(())
}
