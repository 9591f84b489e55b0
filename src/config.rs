use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration for kiln.
///
/// Values are resolved in three layers: built-in defaults, then
/// `<data_dir>/config.toml` if present, then environment variables
/// (`KILN_DATA_DIR`, `KILN_API_BASE`, `KILN_API_KEY`, `KILN_MODEL`).
#[derive(Debug, Clone)]
pub struct KilnConfig {
    pub data_dir: PathBuf,
    /// Root directory under which sandboxes are provisioned.
    pub sandbox_root: PathBuf,
    /// Directory holding named sandbox templates.
    pub templates_dir: PathBuf,
    pub db_path: PathBuf,
    /// OpenAI-compatible chat completions endpoint base.
    pub api_base: String,
    pub api_key: Option<String>,
    /// Model used for agent turns.
    pub model: String,
    /// Cheaper model used for classification, titles, and responses.
    pub utility_model: String,
    pub build_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Sandboxes paused longer than this are reaped by `kiln sweep`.
    pub sweep_max_pause_secs: i64,
    /// Host used when formatting sandbox URLs for the process provider.
    pub sandbox_host: String,
    /// Per-framework command overrides, keyed by framework name.
    pub lint_overrides: HashMap<String, String>,
    pub build_overrides: HashMap<String, String>,
}

/// Raw TOML structure for `<data_dir>/config.toml`.
#[derive(Debug, Deserialize)]
struct KilnToml {
    studio: Option<StudioSection>,
    sandbox: Option<SandboxSection>,
    validation: Option<ValidationSection>,
}

#[derive(Debug, Deserialize)]
struct StudioSection {
    api_base: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    utility_model: Option<String>,
    fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    root: Option<PathBuf>,
    templates: Option<PathBuf>,
    build_timeout_secs: Option<u64>,
    sweep_max_pause_secs: Option<i64>,
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidationSection {
    lint: Option<HashMap<String, String>>,
    build: Option<HashMap<String, String>>,
}

impl KilnConfig {
    /// Build a config rooted at the given data directory, with defaults only.
    pub fn for_root(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            sandbox_root: data_dir.join("sandboxes"),
            templates_dir: data_dir.join("templates"),
            db_path: data_dir.join("kiln.db"),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            utility_model: "gpt-4o-mini".to_string(),
            build_timeout_secs: 180,
            fetch_timeout_secs: 10,
            sweep_max_pause_secs: 3600,
            sandbox_host: "127.0.0.1".to_string(),
            lint_overrides: HashMap::new(),
            build_overrides: HashMap::new(),
        }
    }

    /// Load configuration: defaults, then config.toml, then environment.
    pub fn load(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let data_dir = match data_dir_override {
            Some(dir) => dir,
            None => match std::env::var_os("KILN_DATA_DIR") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::home_dir()
                    .context("Could not determine home directory; set KILN_DATA_DIR")?
                    .join(".kiln"),
            },
        };

        let mut config = Self::for_root(&data_dir);

        let config_path = data_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let toml: KilnToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.apply_toml(toml);
        }

        if let Ok(base) = std::env::var("KILN_API_BASE") {
            config.api_base = base;
        }
        if let Ok(key) = std::env::var("KILN_API_KEY") {
            config.api_key = Some(key);
        } else if config.api_key.is_none() {
            config.api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if let Ok(model) = std::env::var("KILN_MODEL") {
            config.model = model;
        }

        Ok(config)
    }

    fn apply_toml(&mut self, toml: KilnToml) {
        if let Some(studio) = toml.studio {
            if let Some(api_base) = studio.api_base {
                self.api_base = api_base;
            }
            if let Some(api_key) = studio.api_key {
                self.api_key = Some(api_key);
            }
            if let Some(model) = studio.model {
                self.model = model;
            }
            if let Some(utility_model) = studio.utility_model {
                self.utility_model = utility_model;
            }
            if let Some(secs) = studio.fetch_timeout_secs {
                self.fetch_timeout_secs = secs;
            }
        }
        if let Some(sandbox) = toml.sandbox {
            if let Some(root) = sandbox.root {
                self.sandbox_root = root;
            }
            if let Some(templates) = sandbox.templates {
                self.templates_dir = templates;
            }
            if let Some(secs) = sandbox.build_timeout_secs {
                self.build_timeout_secs = secs;
            }
            if let Some(secs) = sandbox.sweep_max_pause_secs {
                self.sweep_max_pause_secs = secs;
            }
            if let Some(host) = sandbox.host {
                self.sandbox_host = host;
            }
        }
        if let Some(validation) = toml.validation {
            if let Some(lint) = validation.lint {
                self.lint_overrides = lint;
            }
            if let Some(build) = validation.build {
                self.build_overrides = build;
            }
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).context("Failed to create data directory")?;
        std::fs::create_dir_all(&self.sandbox_root)
            .context("Failed to create sandbox root directory")?;
        std::fs::create_dir_all(&self.templates_dir)
            .context("Failed to create templates directory")?;
        Ok(())
    }
}
