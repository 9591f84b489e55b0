//! Project management commands — `kiln project new` / `kiln project list`.

use std::path::PathBuf;

use anyhow::Result;
use console::style;

pub async fn cmd_project_new(data_dir: Option<PathBuf>, name: &str) -> Result<()> {
    let config = super::load_config(data_dir)?;
    let db = super::open_db(&config)?;
    let name = name.to_string();
    let project = db.call(move |db| db.create_project(&name)).await?;
    println!(
        "Created project {} (id {})",
        style(&project.name).bold(),
        project.id
    );
    Ok(())
}

pub async fn cmd_project_list(data_dir: Option<PathBuf>) -> Result<()> {
    let config = super::load_config(data_dir)?;
    let db = super::open_db(&config)?;
    let projects = db.call(|db| db.list_projects()).await?;
    if projects.is_empty() {
        println!("No projects yet. Create one with `kiln project new <name>`.");
        return Ok(());
    }
    for project in projects {
        let framework = project
            .framework
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unclassified".to_string());
        println!(
            "{:>4}  {}  {}",
            project.id,
            style(&project.name).bold(),
            style(framework).dim()
        );
    }
    Ok(())
}
