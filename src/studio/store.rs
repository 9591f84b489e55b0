use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the studio database.
///
/// Wraps `StudioDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StudioDb>>,
}

impl DbHandle {
    pub fn new(db: StudioDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StudioDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct StudioDb {
    conn: Connection,
}

impl StudioDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    framework TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'result',
                    status TEXT NOT NULL DEFAULT 'completed',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS fragments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    sandbox_id TEXT NOT NULL,
                    sandbox_url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    files TEXT NOT NULL DEFAULT '{}',
                    framework TEXT NOT NULL,
                    metadata TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id);
                CREATE INDEX IF NOT EXISTS idx_fragments_project ON fragments(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn create_project(&self, name: &str) -> Result<Project> {
        self.conn
            .execute("INSERT INTO projects (name) VALUES (?1)", params![name])
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?
            .context("Project vanished after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, framework, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query project")?
            .map(|(id, name, framework, created_at)| {
                let framework = framework
                    .map(|s| s.parse::<Framework>().map_err(|e| anyhow::anyhow!(e)))
                    .transpose()?;
                Ok(Project {
                    id,
                    name,
                    framework,
                    created_at,
                })
            })
            .transpose()
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM projects ORDER BY id")?;
        let ids: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        ids.into_iter()
            .map(|id| {
                self.get_project(id)?
                    .context("Project disappeared during listing")
            })
            .collect()
    }

    /// Persist the classified framework, but only if none is set yet. The
    /// guard makes the classifier's side effect exactly-once.
    pub fn update_project_framework(&self, id: i64, framework: Framework) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE projects SET framework = ?1 WHERE id = ?2 AND framework IS NULL",
                params![framework.as_str(), id],
            )
            .context("Failed to update project framework")?;
        Ok(changed > 0)
    }

    pub fn create_message(
        &self,
        project_id: i64,
        role: MessageRole,
        content: &str,
        kind: MessageKind,
        status: MessageStatus,
    ) -> Result<StoredMessage> {
        self.conn
            .execute(
                "INSERT INTO messages (project_id, role, content, kind, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project_id,
                    role.as_str(),
                    content,
                    kind.as_str(),
                    status.as_str()
                ],
            )
            .context("Failed to insert message")?;
        let id = self.conn.last_insert_rowid();
        self.get_message(id)?
            .context("Message vanished after insert")
    }

    pub fn get_message(&self, id: i64) -> Result<Option<StoredMessage>> {
        self.conn
            .query_row(
                "SELECT id, project_id, role, content, kind, status, created_at
                 FROM messages WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query message")?
            .map(|(id, project_id, role, content, kind, status, created_at)| {
                Ok(StoredMessage {
                    id,
                    project_id,
                    role: role.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    content,
                    kind: kind.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                    created_at,
                })
            })
            .transpose()
    }

    pub fn list_messages(&self, project_id: i64) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM messages WHERE project_id = ?1 ORDER BY id",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![project_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        ids.into_iter()
            .map(|id| {
                self.get_message(id)?
                    .context("Message disappeared during listing")
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_fragment(
        &self,
        project_id: i64,
        sandbox_id: &str,
        sandbox_url: &str,
        title: &str,
        files: &BTreeMap<String, String>,
        framework: Framework,
        metadata: Option<&serde_json::Value>,
    ) -> Result<Fragment> {
        let files_json = serde_json::to_string(files).context("Failed to encode fragment files")?;
        let metadata_json = metadata
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode fragment metadata")?;
        self.conn
            .execute(
                "INSERT INTO fragments (project_id, sandbox_id, sandbox_url, title, files, framework, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    project_id,
                    sandbox_id,
                    sandbox_url,
                    title,
                    files_json,
                    framework.as_str(),
                    metadata_json
                ],
            )
            .context("Failed to insert fragment")?;
        let id = self.conn.last_insert_rowid();
        self.get_fragment(id)?
            .context("Fragment vanished after insert")
    }

    /// In-place update used by fix/transfer invocations.
    pub fn update_fragment(
        &self,
        id: i64,
        sandbox_url: &str,
        title: &str,
        files: &BTreeMap<String, String>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let files_json = serde_json::to_string(files).context("Failed to encode fragment files")?;
        let metadata_json = metadata
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode fragment metadata")?;
        let changed = self
            .conn
            .execute(
                "UPDATE fragments
                 SET sandbox_url = ?1, title = ?2, files = ?3, metadata = ?4,
                     updated_at = datetime('now')
                 WHERE id = ?5",
                params![sandbox_url, title, files_json, metadata_json, id],
            )
            .context("Failed to update fragment")?;
        anyhow::ensure!(changed > 0, "Fragment {} not found", id);
        Ok(())
    }

    pub fn update_fragment_sandbox(&self, id: i64, sandbox_id: &str, sandbox_url: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE fragments
                 SET sandbox_id = ?1, sandbox_url = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![sandbox_id, sandbox_url, id],
            )
            .context("Failed to update fragment sandbox")?;
        anyhow::ensure!(changed > 0, "Fragment {} not found", id);
        Ok(())
    }

    pub fn get_fragment(&self, id: i64) -> Result<Option<Fragment>> {
        self.conn
            .query_row(
                "SELECT id, project_id, sandbox_id, sandbox_url, title, files, framework, metadata,
                        created_at, updated_at
                 FROM fragments WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query fragment")?
            .map(
                |(
                    id,
                    project_id,
                    sandbox_id,
                    sandbox_url,
                    title,
                    files,
                    framework,
                    metadata,
                    created_at,
                    updated_at,
                )| {
                    Ok(Fragment {
                        id,
                        project_id,
                        sandbox_id,
                        sandbox_url,
                        title,
                        files: serde_json::from_str(&files)
                            .context("Corrupt fragment file map")?,
                        framework: framework
                            .parse()
                            .map_err(|e: String| anyhow::anyhow!(e))?,
                        metadata: metadata
                            .map(|m| serde_json::from_str(&m))
                            .transpose()
                            .context("Corrupt fragment metadata")?,
                        created_at,
                        updated_at,
                    })
                },
            )
            .transpose()
    }
}
