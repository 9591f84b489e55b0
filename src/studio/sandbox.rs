//! Sandbox lifecycle: provisioning, command execution, file access, and the
//! idle-cleanup sweep.
//!
//! The core talks to the `SandboxProvider`/`Sandbox` traits only. The shipped
//! implementation (`ProcessSandbox`) provisions a per-sandbox directory
//! seeded from a named template and runs commands through `sh -c` with an
//! optional deadline. A container-backed provider would slot behind the same
//! traits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::SandboxError;
use crate::studio::models::Framework;

/// Template used when a framework-specific template is missing. Provisioning
/// from it never fails: an absent fallback directory seeds an empty sandbox.
pub const FALLBACK_TEMPLATE: &str = "kiln-base";

/// Exit code reported when a command exceeds its deadline, mirroring the
/// shell `timeout` convention.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Directories never included in a sandbox file listing.
pub const LISTING_EXCLUDES: &[&str] = &[
    "node_modules",
    ".next",
    ".git",
    "dist",
    "build",
    ".turbo",
    "coverage",
];

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMeta {
    pub id: String,
    pub template: String,
    pub created_at: DateTime<Utc>,
    /// Stamped when the owning run releases the sandbox; `None` while a run
    /// is in flight. The sweep only ever reaps paused sandboxes.
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Run a shell command in the sandbox workspace. Exceeding the deadline
    /// yields exit code 124 rather than an error: a slow build is a failed
    /// build, not a crashed run.
    async fn run(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Full workspace file listing as relative path → content, skipping the
    /// excluded directory names anywhere in the path.
    fn list_files(&self, excludes: &[&str]) -> Result<BTreeMap<String, String>, SandboxError>;

    fn host_url(&self, port: u16) -> String;

    /// Release the sandbox: stamps `paused_at` so the sweep may reap it later.
    fn pause(&self) -> Result<(), SandboxError>;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, template: &str) -> Result<Box<dyn Sandbox>, SandboxError>;

    /// Reattach to an existing sandbox. A missing or killed sandbox is fatal
    /// (`SandboxError::Expired`) and requires a fresh run.
    async fn resume(&self, id: &str) -> Result<Box<dyn Sandbox>, SandboxError>;

    fn list(&self) -> Result<Vec<SandboxInfo>, SandboxError>;

    fn kill(&self, id: &str) -> Result<(), SandboxError>;
}

/// Provision a sandbox for a framework, falling back to the generic template
/// (and coercing the framework to the default stack) when the framework's
/// template does not exist. Template-not-found is never surfaced to callers.
pub async fn provision(
    provider: &dyn SandboxProvider,
    framework: Framework,
) -> Result<(Box<dyn Sandbox>, Framework), SandboxError> {
    match provider.create(&framework.template()).await {
        Ok(sandbox) => Ok((sandbox, framework)),
        Err(SandboxError::TemplateNotFound { template }) => {
            warn!(
                template,
                fallback = FALLBACK_TEMPLATE,
                "template missing, provisioning from fallback"
            );
            let sandbox = provider.create(FALLBACK_TEMPLATE).await?;
            Ok((sandbox, Framework::default()))
        }
        Err(e) => Err(e),
    }
}

/// Kill sandboxes that have been paused longer than `max_pause`. Returns the
/// number reaped. In-flight sandboxes carry no pause stamp and are skipped.
pub fn sweep_idle(
    provider: &dyn SandboxProvider,
    max_pause: chrono::Duration,
) -> Result<u32, SandboxError> {
    let now = Utc::now();
    let mut reaped = 0;
    for info in provider.list()? {
        let Some(paused_at) = info.paused_at else {
            continue;
        };
        if now - paused_at > max_pause {
            debug!(id = %info.id, "sweeping idle sandbox");
            provider.kill(&info.id)?;
            reaped += 1;
        }
    }
    Ok(reaped)
}

/// Directory-backed sandbox provider. Each sandbox lives under
/// `<root>/<id>/` with `meta.json` beside a `workspace/` directory that
/// holds the actual files.
pub struct ProcessSandboxProvider {
    root: PathBuf,
    templates_dir: PathBuf,
    host: String,
}

impl ProcessSandboxProvider {
    pub fn new(root: impl Into<PathBuf>, templates_dir: impl Into<PathBuf>, host: &str) -> Self {
        Self {
            root: root.into(),
            templates_dir: templates_dir.into(),
            host: host.to_string(),
        }
    }

    fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn handle(&self, id: &str) -> ProcessSandbox {
        let dir = self.sandbox_dir(id);
        ProcessSandbox {
            id: id.to_string(),
            workspace: dir.join("workspace"),
            meta_path: dir.join("meta.json"),
            host: self.host.clone(),
        }
    }
}

#[async_trait]
impl SandboxProvider for ProcessSandboxProvider {
    async fn create(&self, template: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let template_dir = self.templates_dir.join(template);
        if !template_dir.is_dir() && template != FALLBACK_TEMPLATE {
            return Err(SandboxError::TemplateNotFound {
                template: template.to_string(),
            });
        }

        let id = format!("sb-{}", uuid::Uuid::new_v4().simple());
        let dir = self.sandbox_dir(&id);
        let workspace = dir.join("workspace");
        std::fs::create_dir_all(&workspace).map_err(|e| SandboxError::CreationFailed {
            source: anyhow::Error::new(e).context("creating sandbox workspace"),
        })?;

        if template_dir.is_dir() {
            copy_tree(&template_dir, &workspace).map_err(|source| SandboxError::CreationFailed {
                source: anyhow::anyhow!(source).context("seeding sandbox from template"),
            })?;
        }

        let meta = SandboxMeta {
            id: id.clone(),
            template: template.to_string(),
            created_at: Utc::now(),
            paused_at: None,
        };
        write_meta(&dir.join("meta.json"), &meta)?;

        debug!(id = %id, template, "sandbox created");
        Ok(Box::new(self.handle(&id)))
    }

    async fn resume(&self, id: &str) -> Result<Box<dyn Sandbox>, SandboxError> {
        let dir = self.sandbox_dir(id);
        let meta_path = dir.join("meta.json");
        if !dir.is_dir() || !meta_path.is_file() {
            return Err(SandboxError::Expired { id: id.to_string() });
        }
        // Clear the pause stamp: the sandbox is in flight again and must not
        // be visible to the sweep.
        let mut meta = read_meta(&meta_path)?;
        meta.paused_at = None;
        write_meta(&meta_path, &meta)?;
        Ok(Box::new(self.handle(id)))
    }

    fn list(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        let mut infos = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => {
                return Err(SandboxError::Io {
                    path: self.root.clone(),
                    source: e,
                });
            }
        };
        for entry in entries.flatten() {
            let meta_path = entry.path().join("meta.json");
            if !meta_path.is_file() {
                continue;
            }
            match read_meta(&meta_path) {
                Ok(meta) => infos.push(SandboxInfo {
                    id: meta.id,
                    created_at: meta.created_at,
                    paused_at: meta.paused_at,
                }),
                Err(e) => warn!(path = %meta_path.display(), "skipping unreadable sandbox meta: {e}"),
            }
        }
        Ok(infos)
    }

    fn kill(&self, id: &str) -> Result<(), SandboxError> {
        let dir = self.sandbox_dir(id);
        std::fs::remove_dir_all(&dir).map_err(|source| SandboxError::Io { path: dir, source })
    }
}

#[derive(Debug)]
pub struct ProcessSandbox {
    id: String,
    workspace: PathBuf,
    meta_path: PathBuf,
    host: String,
}

impl ProcessSandbox {
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let relative = path.trim_start_matches('/');
        let candidate = Path::new(relative);
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SandboxError::Io {
                path: candidate.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path escapes the sandbox workspace",
                ),
            });
        }
        Ok(self.workspace.join(candidate))
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, command: &str, opts: ExecOptions) -> Result<ExecResult, SandboxError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| SandboxError::CommandFailed {
            id: self.id.clone(),
            source,
        })?;

        let output = match opts.timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, child.wait_with_output()).await {
                    Ok(result) => result,
                    Err(_) => {
                        // The dropped child is killed via kill_on_drop.
                        warn!(id = %self.id, command, "sandbox command exceeded deadline");
                        return Ok(ExecResult {
                            stdout: String::new(),
                            stderr: format!(
                                "command timed out after {}s",
                                deadline.as_secs()
                            ),
                            exit_code: TIMEOUT_EXIT_CODE,
                        });
                    }
                }
            }
            None => child.wait_with_output().await,
        }
        .map_err(|source| SandboxError::CommandFailed {
            id: self.id.clone(),
            source,
        })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| SandboxError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|source| SandboxError::Io {
                path: target,
                source,
            })
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|source| SandboxError::Io {
                path: target,
                source,
            })
    }

    fn list_files(&self, excludes: &[&str]) -> Result<BTreeMap<String, String>, SandboxError> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(&self.workspace).into_iter().filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && excludes.contains(&name.as_ref()))
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(id = %self.id, "skipping unreadable entry during listing: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.workspace) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => {
                    files.insert(key, content);
                }
                // Binary or unreadable files are simply not part of the listing.
                Err(e) => debug!(id = %self.id, path = %key, "skipping non-text file: {e}"),
            }
        }
        Ok(files)
    }

    fn host_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }

    fn pause(&self) -> Result<(), SandboxError> {
        let mut meta = read_meta(&self.meta_path)?;
        meta.paused_at = Some(Utc::now());
        write_meta(&self.meta_path, &meta)
    }
}

fn read_meta(path: &Path) -> Result<SandboxMeta, SandboxError> {
    let content = std::fs::read_to_string(path).map_err(|source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|e| SandboxError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    })
}

fn write_meta(path: &Path, meta: &SandboxMeta) -> Result<(), SandboxError> {
    let content = serde_json::to_string_pretty(meta).expect("meta serializes");
    std::fs::write(path, content).map_err(|source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
