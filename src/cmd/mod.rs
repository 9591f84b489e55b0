//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `project` | `Project New`, `Project List` |
//! | `studio`  | `Run`, `Fix`, `Transfer`    |
//! | `sweep`   | `Sweep`                     |

pub mod project;
pub mod studio;
pub mod sweep;

pub use project::{cmd_project_list, cmd_project_new};
pub use studio::{cmd_fix, cmd_run, cmd_transfer};
pub use sweep::cmd_sweep;

use std::path::PathBuf;

use anyhow::Result;

use kiln::config::KilnConfig;
use kiln::studio::store::{DbHandle, StudioDb};

pub(crate) fn load_config(data_dir: Option<PathBuf>) -> Result<KilnConfig> {
    let config = KilnConfig::load(data_dir)?;
    config.ensure_directories()?;
    Ok(config)
}

pub(crate) fn open_db(config: &KilnConfig) -> Result<DbHandle> {
    Ok(DbHandle::new(StudioDb::new(&config.db_path)?))
}
