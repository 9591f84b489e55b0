use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "AI-powered app generation orchestrator")]
pub struct Cli {
    /// Data directory (defaults to $KILN_DATA_DIR or ~/.kiln)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Generate an app from a request and persist the resulting fragment
    Run {
        project_id: i64,
        request: String,
    },
    /// Re-validate and repair an existing fragment in its sandbox
    Fix { fragment_id: i64 },
    /// Reattach to (or recreate) the sandbox behind an existing fragment
    Transfer { fragment_id: i64 },
    /// Reap sandboxes paused beyond the idle threshold
    Sweep,
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a new project
    New { name: String },
    /// List projects
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Project { command } => match command {
            ProjectCommands::New { name } => {
                cmd::cmd_project_new(cli.data_dir.clone(), name).await?
            }
            ProjectCommands::List => cmd::cmd_project_list(cli.data_dir.clone()).await?,
        },
        Commands::Run {
            project_id,
            request,
        } => cmd::cmd_run(cli.data_dir.clone(), *project_id, request).await?,
        Commands::Fix { fragment_id } => cmd::cmd_fix(cli.data_dir.clone(), *fragment_id).await?,
        Commands::Transfer { fragment_id } => {
            cmd::cmd_transfer(cli.data_dir.clone(), *fragment_id).await?
        }
        Commands::Sweep => cmd::cmd_sweep(cli.data_dir.clone())?,
    }
    Ok(())
}
