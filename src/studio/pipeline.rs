//! The studio facade: wires classifier, sandbox, router, validation, fixer,
//! and aggregation into the three public operations — `run`, `fix`, and
//! `transfer`.
//!
//! Only sandbox creation and sandbox resume failures propagate as errors.
//! Everything else is captured into state and resolved into the composite
//! error flag; a failed run still persists an assistant message.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::KilnConfig;
use crate::errors::{SandboxError, StudioError};
use crate::studio::agent::CodeAgent;
use crate::studio::aggregate::{
    self, ErrorReason, FALLBACK_TITLE, GENERIC_ERROR_RESPONSE,
};
use crate::studio::classifier;
use crate::studio::fetcher::{self, ContentFetcher};
use crate::studio::fixer;
use crate::studio::llm::{ChatMessage, LlmGateway};
use crate::studio::models::{
    AgentState, Fragment, MessageKind, MessageRole, MessageStatus,
};
use crate::studio::router;
use crate::studio::sandbox::{Sandbox, SandboxProvider, provision};
use crate::studio::store::DbHandle;
use crate::studio::validation::{self, ValidationCommands};

pub struct Studio {
    config: KilnConfig,
    db: DbHandle,
    gateway: Arc<dyn LlmGateway>,
    provider: Arc<dyn SandboxProvider>,
    fetcher: Arc<dyn ContentFetcher>,
}

#[derive(Debug)]
pub struct RunOutput {
    pub fragment_id: i64,
    pub url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: String,
    pub response: String,
    pub is_error: bool,
    pub error_reasons: Vec<ErrorReason>,
    pub auto_fix_attempts: u32,
}

#[derive(Debug)]
pub struct FixOutput {
    pub fragment_id: i64,
    pub url: String,
    pub attempts: u32,
    pub clean: bool,
}

#[derive(Debug)]
pub struct TransferOutput {
    pub fragment_id: i64,
    pub sandbox_id: String,
    pub url: String,
    pub recreated: bool,
}

impl Studio {
    pub fn new(
        config: KilnConfig,
        db: DbHandle,
        gateway: Arc<dyn LlmGateway>,
        provider: Arc<dyn SandboxProvider>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Self {
        Self {
            config,
            db,
            gateway,
            provider,
            fetcher,
        }
    }

    fn commands_for(&self, framework: crate::studio::models::Framework) -> ValidationCommands {
        ValidationCommands::for_framework(
            framework,
            &self.config.lint_overrides,
            &self.config.build_overrides,
        )
    }

    fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.config.build_timeout_secs)
    }

    async fn load_fragment(&self, fragment_id: i64) -> Result<Fragment, StudioError> {
        self.db
            .call(move |db| db.get_fragment(fragment_id))
            .await
            .map_err(StudioError::Database)?
            .ok_or(StudioError::FragmentNotFound { id: fragment_id })
    }

    /// Release the sandbox back to the sweep's jurisdiction. Failing to
    /// stamp the pause is housekeeping noise, not a run failure.
    fn release(&self, sandbox: &dyn Sandbox) {
        if let Err(e) = sandbox.pause() {
            warn!(id = %sandbox.id(), "failed to pause sandbox: {e}");
        }
    }

    /// Generate an app from a user request, validate and repair it, and
    /// persist the resulting fragment plus the conversation messages.
    pub async fn run(&self, project_id: i64, user_request: &str) -> Result<RunOutput, StudioError> {
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .map_err(StudioError::Database)?
            .ok_or(StudioError::ProjectNotFound { id: project_id })?;

        let framework = classifier::ensure_framework(
            self.gateway.as_ref(),
            &self.db,
            project_id,
            project.framework,
            &self.config.utility_model,
            user_request,
        )
        .await;

        let (sandbox, framework) = provision(self.provider.as_ref(), framework)
            .await
            .map_err(StudioError::SandboxCreation)?;
        info!(sandbox = %sandbox.id(), %framework, "run started");

        let request_record = user_request.to_string();
        self.db
            .call(move |db| {
                db.create_message(
                    project_id,
                    MessageRole::User,
                    &request_record,
                    MessageKind::Result,
                    MessageStatus::Completed,
                )
            })
            .await
            .map_err(StudioError::Database)?;

        // URLs in the request become optional context; every fetch races its
        // own deadline and a miss degrades to no context.
        let mut opening = user_request.to_string();
        let urls = fetcher::extract_urls(user_request);
        if !urls.is_empty() {
            let pages = fetcher::gather_context(
                self.fetcher.as_ref(),
                &urls,
                Duration::from_secs(self.config.fetch_timeout_secs),
            )
            .await;
            if let Some(context) = fetcher::render_context(&pages) {
                opening.push_str("\n\n");
                opening.push_str(&context);
            }
        }

        let agent = CodeAgent::new(self.gateway.as_ref(), sandbox.as_ref(), &self.config.model);
        let mut conversation = vec![ChatMessage::user(opening)];
        let network =
            router::run_network(&agent, AgentState::new(framework), &mut conversation).await?;
        let last_assistant_text = network.last_assistant_text().to_string();

        let commands = self.commands_for(framework);
        let report =
            validation::run_validation(sandbox.as_ref(), &commands, self.build_timeout()).await;

        let fix = fixer::run_fix_loop(
            &agent,
            sandbox.as_ref(),
            network.state,
            &mut conversation,
            &commands,
            self.build_timeout(),
            report,
            last_assistant_text,
        )
        .await?;

        let state = fix.state;
        let error_reasons =
            aggregate::error_reasons(&state, &fix.last_assistant_text, !fix.outcome.is_clean());
        let is_error = !error_reasons.is_empty();
        let auto_fix_attempts = fix.outcome.attempts();

        let files = aggregate::collect_files(sandbox.as_ref(), &state)
            .map_err(|e| StudioError::Other(anyhow::Error::new(e)))?;

        // Secondary generation only pays off on success; error runs get the
        // generic response without spending two more LLM calls.
        let (title, response) = if is_error {
            (FALLBACK_TITLE.to_string(), GENERIC_ERROR_RESPONSE.to_string())
        } else {
            aggregate::generate_title_and_response(
                self.gateway.as_ref(),
                &self.config.utility_model,
                &state.summary,
            )
            .await
        };

        let url = sandbox.host_url(framework.dev_port());
        let kind = if is_error {
            MessageKind::Error
        } else {
            MessageKind::Result
        };
        let message_content = response.clone();
        self.db
            .call(move |db| {
                db.create_message(
                    project_id,
                    MessageRole::Assistant,
                    &message_content,
                    kind,
                    MessageStatus::Completed,
                )
            })
            .await
            .map_err(StudioError::Database)?;

        let metadata = serde_json::json!({
            "auto_fix_attempts": auto_fix_attempts,
            "error_reasons": error_reasons,
        });
        let fragment = {
            let sandbox_id = sandbox.id().to_string();
            let url = url.clone();
            let title = title.clone();
            let files = files.clone();
            self.db
                .call(move |db| {
                    db.create_fragment(
                        project_id,
                        &sandbox_id,
                        &url,
                        &title,
                        &files,
                        framework,
                        Some(&metadata),
                    )
                })
                .await
                .map_err(StudioError::Database)?
        };

        self.release(sandbox.as_ref());
        info!(fragment = fragment.id, is_error, "run finished");

        Ok(RunOutput {
            fragment_id: fragment.id,
            url,
            title,
            files,
            summary: state.summary,
            response,
            is_error,
            error_reasons,
            auto_fix_attempts,
        })
    }

    /// Re-validate and repair an existing fragment in its own sandbox. No
    /// framework classification, no sandbox re-creation; a dead sandbox is
    /// fatal here. A fragment that already validates cleanly returns at once
    /// without waking the agent.
    pub async fn fix(&self, fragment_id: i64) -> Result<FixOutput, StudioError> {
        let fragment = self.load_fragment(fragment_id).await?;

        let sandbox = self
            .provider
            .resume(&fragment.sandbox_id)
            .await
            .map_err(StudioError::SandboxResume)?;
        info!(sandbox = %sandbox.id(), fragment = fragment.id, "fix started");

        // The fragment's file map is the source of truth; sync it into the
        // sandbox before judging anything.
        for (path, content) in &fragment.files {
            sandbox.write_file(path, content).await.map_err(|e| {
                StudioError::Other(anyhow::Error::new(e).context("seeding sandbox from fragment"))
            })?;
        }

        let commands = self.commands_for(fragment.framework);
        let report =
            validation::run_validation(sandbox.as_ref(), &commands, self.build_timeout()).await;
        let url = sandbox.host_url(fragment.framework.dev_port());

        if report.is_clean() {
            self.release(sandbox.as_ref());
            return Ok(FixOutput {
                fragment_id,
                url,
                attempts: 0,
                clean: true,
            });
        }

        let backups = fragment.files.clone();
        let agent = CodeAgent::new(self.gateway.as_ref(), sandbox.as_ref(), &self.config.model);
        let mut conversation = Vec::new();
        let state = AgentState::from_files(fragment.framework, fragment.files.clone());
        let fix = fixer::run_fix_loop(
            &agent,
            sandbox.as_ref(),
            state,
            &mut conversation,
            &commands,
            self.build_timeout(),
            report,
            String::new(),
        )
        .await?;

        let files = aggregate::collect_files(sandbox.as_ref(), &fix.state)
            .map_err(|e| StudioError::Other(anyhow::Error::new(e)))?;
        let clean = fix.outcome.is_clean();
        let attempts = fix.outcome.attempts();

        // Prior file contents and the fix history ride along in metadata.
        let mut metadata = fragment
            .metadata
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));
        if let Some(object) = metadata.as_object_mut() {
            object.insert(
                "backups".to_string(),
                serde_json::to_value(&backups).expect("file map serializes"),
            );
            let history = object
                .entry("fix_history")
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
            if let Some(entries) = history.as_array_mut() {
                entries.push(serde_json::json!({
                    "attempts": attempts,
                    "clean": clean,
                    "at": chrono::Utc::now().to_rfc3339(),
                }));
            }
        }

        {
            let url = url.clone();
            let title = fragment.title.clone();
            let files = files.clone();
            self.db
                .call(move |db| {
                    db.update_fragment(fragment_id, &url, &title, &files, Some(&metadata))
                })
                .await
                .map_err(StudioError::Database)?;
        }

        self.release(sandbox.as_ref());
        info!(fragment = fragment_id, attempts, clean, "fix finished");

        Ok(FixOutput {
            fragment_id,
            url,
            attempts,
            clean,
        })
    }

    /// Reattach to a fragment's sandbox and refresh its URL. An expired
    /// sandbox is recreated from the framework template and re-seeded from
    /// the fragment's file map.
    pub async fn transfer(&self, fragment_id: i64) -> Result<TransferOutput, StudioError> {
        let fragment = self.load_fragment(fragment_id).await?;

        match self.provider.resume(&fragment.sandbox_id).await {
            Ok(sandbox) => {
                let url = sandbox.host_url(fragment.framework.dev_port());
                let sandbox_id = fragment.sandbox_id.clone();
                {
                    let sandbox_id = sandbox_id.clone();
                    let url = url.clone();
                    self.db
                        .call(move |db| db.update_fragment_sandbox(fragment_id, &sandbox_id, &url))
                        .await
                        .map_err(StudioError::Database)?;
                }
                self.release(sandbox.as_ref());
                Ok(TransferOutput {
                    fragment_id,
                    sandbox_id,
                    url,
                    recreated: false,
                })
            }
            Err(SandboxError::Expired { .. }) => {
                info!(fragment = fragment_id, "sandbox expired, recreating from template");
                let (sandbox, _) = provision(self.provider.as_ref(), fragment.framework)
                    .await
                    .map_err(StudioError::SandboxCreation)?;
                for (path, content) in &fragment.files {
                    sandbox.write_file(path, content).await.map_err(|e| {
                        StudioError::Other(
                            anyhow::Error::new(e).context("re-seeding recreated sandbox"),
                        )
                    })?;
                }
                let url = sandbox.host_url(fragment.framework.dev_port());
                let sandbox_id = sandbox.id().to_string();
                {
                    let sandbox_id = sandbox_id.clone();
                    let url = url.clone();
                    self.db
                        .call(move |db| db.update_fragment_sandbox(fragment_id, &sandbox_id, &url))
                        .await
                        .map_err(StudioError::Database)?;
                }
                self.release(sandbox.as_ref());
                Ok(TransferOutput {
                    fragment_id,
                    sandbox_id,
                    url,
                    recreated: true,
                })
            }
            Err(e) => Err(StudioError::SandboxResume(e)),
        }
    }
}
