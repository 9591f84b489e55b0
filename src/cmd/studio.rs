//! Generation commands — `kiln run`, `kiln fix`, `kiln transfer`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use kiln::config::KilnConfig;
use kiln::studio::fetcher::HttpFetcher;
use kiln::studio::llm::HttpGateway;
use kiln::studio::pipeline::Studio;
use kiln::studio::sandbox::ProcessSandboxProvider;

fn build_studio(config: KilnConfig) -> Result<Studio> {
    let db = super::open_db(&config)?;
    let gateway = Arc::new(HttpGateway::from_config(&config)?);
    let provider = Arc::new(ProcessSandboxProvider::new(
        config.sandbox_root.clone(),
        config.templates_dir.clone(),
        &config.sandbox_host,
    ));
    let fetcher = Arc::new(HttpFetcher::new());
    Ok(Studio::new(config, db, gateway, provider, fetcher))
}

pub async fn cmd_run(data_dir: Option<PathBuf>, project_id: i64, request: &str) -> Result<()> {
    let config = super::load_config(data_dir)?;
    let studio = build_studio(config)?;

    println!("{}", style("Generating...").dim());
    let output = studio.run(project_id, request).await?;

    if output.is_error {
        println!("{} {}", style("x").red().bold(), output.response);
        for reason in &output.error_reasons {
            println!("  {}", style(reason).dim());
        }
    } else {
        println!("{} {}", style("ok").green().bold(), style(&output.title).bold());
        println!("{}", output.response);
    }
    println!(
        "fragment {} · {} file(s) · {}",
        output.fragment_id,
        output.files.len(),
        output.url
    );
    if output.auto_fix_attempts > 0 {
        println!(
            "{}",
            style(format!("auto-fix attempts: {}", output.auto_fix_attempts)).dim()
        );
    }
    Ok(())
}

pub async fn cmd_fix(data_dir: Option<PathBuf>, fragment_id: i64) -> Result<()> {
    let config = super::load_config(data_dir)?;
    let studio = build_studio(config)?;

    let output = studio.fix(fragment_id).await?;
    if output.clean {
        if output.attempts == 0 {
            println!("{} fragment {} already validates cleanly", style("ok").green().bold(), fragment_id);
        } else {
            println!(
                "{} fragment {} repaired after {} attempt(s)",
                style("ok").green().bold(),
                fragment_id,
                output.attempts
            );
        }
    } else {
        println!(
            "{} fragment {} still has validation errors after {} attempt(s)",
            style("x").red().bold(),
            fragment_id,
            output.attempts
        );
    }
    println!("{}", output.url);
    Ok(())
}

pub async fn cmd_transfer(data_dir: Option<PathBuf>, fragment_id: i64) -> Result<()> {
    let config = super::load_config(data_dir)?;
    let studio = build_studio(config)?;

    let output = studio.transfer(fragment_id).await?;
    if output.recreated {
        println!(
            "Recreated sandbox {} for fragment {}",
            output.sandbox_id, fragment_id
        );
    } else {
        println!(
            "Reattached sandbox {} for fragment {}",
            output.sandbox_id, fragment_id
        );
    }
    println!("{}", output.url);
    Ok(())
}
