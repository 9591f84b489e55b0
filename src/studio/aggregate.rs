//! Result aggregation: the composite error flag, the sandbox/agent file
//! overlay, and parallel title + response generation.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::SandboxError;
use crate::studio::agent::{TASK_SUMMARY_CLOSE, TASK_SUMMARY_OPEN};
use crate::studio::llm::{ChatMessage, CompletionRequest, LlmGateway};
use crate::studio::models::AgentState;
use crate::studio::sandbox::{LISTING_EXCLUDES, Sandbox};

pub const FALLBACK_TITLE: &str = "Fragment";
pub const GENERIC_ERROR_RESPONSE: &str = "Something went wrong. Please try again.";

const TITLE_SYSTEM_PROMPT: &str = "You name generated apps. Reply with a \
short title (3-6 words) for the app described by the summary. Plain text \
only, no quotes.";

const RESPONSE_SYSTEM_PROMPT: &str = "You report completed app generation \
back to the user. Reply with one friendly paragraph describing what was \
built, based on the summary.";

static ERROR_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\berrors?\b|\bfailed\b|\bcannot\b|\bunable to\b")
        .expect("valid error-phrase pattern")
});

/// Why a run was flagged as an error. Any single reason is sufficient; the
/// full list is kept so callers can report *why*, not just *whether*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    NoFiles,
    NoSummary,
    AssistantError,
    MissingRequiredImport,
    ValidationUnresolved,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFiles => "no_files",
            Self::NoSummary => "no_summary",
            Self::AssistantError => "assistant_error",
            Self::MissingRequiredImport => "missing_required_import",
            Self::ValidationUnresolved => "validation_unresolved",
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn strip_task_summary(text: &str) -> String {
    match text.find(TASK_SUMMARY_OPEN) {
        Some(start) => {
            let rest = &text[start..];
            match rest.find(TASK_SUMMARY_CLOSE) {
                Some(end) => format!(
                    "{}{}",
                    &text[..start],
                    &rest[end + TASK_SUMMARY_CLOSE.len()..]
                ),
                None => text[..start].to_string(),
            }
        }
        None => text.to_string(),
    }
}

/// Whether assistant text reads as a self-reported failure. The completion
/// marker's content is ignored so a summary like "fixed the lint errors"
/// does not count against the run.
pub fn signals_error(text: &str) -> bool {
    ERROR_PHRASE.is_match(&strip_task_summary(text))
}

/// Compute every reason the run should be flagged as an error.
pub fn error_reasons(
    state: &AgentState,
    last_assistant_text: &str,
    fix_exhausted: bool,
) -> Vec<ErrorReason> {
    let mut reasons = Vec::new();
    if !state.has_files() {
        reasons.push(ErrorReason::NoFiles);
    }
    if !state.has_summary() {
        reasons.push(ErrorReason::NoSummary);
    }
    if signals_error(last_assistant_text) {
        reasons.push(ErrorReason::AssistantError);
    }
    if let Some(import) = state.framework.required_import() {
        if !state.files.values().any(|content| content.contains(import)) {
            reasons.push(ErrorReason::MissingRequiredImport);
        }
    }
    if fix_exhausted {
        reasons.push(ErrorReason::ValidationUnresolved);
    }
    reasons
}

/// The final file set: the sandbox's full tree (minus dependency and build
/// artifacts) overlaid with the agent's in-memory map. The agent's copy wins
/// on collision. Re-running this without further agent writes is idempotent.
pub fn collect_files(
    sandbox: &dyn Sandbox,
    state: &AgentState,
) -> Result<BTreeMap<String, String>, SandboxError> {
    let mut files = sandbox.list_files(LISTING_EXCLUDES)?;
    for (path, content) in &state.files {
        files.insert(path.clone(), content.clone());
    }
    Ok(files)
}

/// Generate the fragment title and the user-facing response in parallel.
/// Either call failing degrades to a fallback instead of aborting the run.
pub async fn generate_title_and_response(
    gateway: &dyn LlmGateway,
    model: &str,
    summary: &str,
) -> (String, String) {
    let title_request = CompletionRequest {
        system: TITLE_SYSTEM_PROMPT.to_string(),
        model: model.to_string(),
        messages: vec![ChatMessage::user(summary)],
        tools: Vec::new(),
    };
    let response_request = CompletionRequest {
        system: RESPONSE_SYSTEM_PROMPT.to_string(),
        model: model.to_string(),
        messages: vec![ChatMessage::user(summary)],
        tools: Vec::new(),
    };

    let (title, response) = tokio::join!(
        gateway.complete(title_request),
        gateway.complete(response_request),
    );

    let title = match title {
        Ok(completion) if !completion.text.trim().is_empty() => {
            completion.text.trim().to_string()
        }
        Ok(_) => FALLBACK_TITLE.to_string(),
        Err(e) => {
            warn!("title generation failed, using fallback: {e}");
            FALLBACK_TITLE.to_string()
        }
    };
    let response = match response {
        Ok(completion) if !completion.text.trim().is_empty() => {
            completion.text.trim().to_string()
        }
        Ok(_) => summary.to_string(),
        Err(e) => {
            warn!("response generation failed, falling back to the summary: {e}");
            summary.to_string()
        }
    };
    (title, response)
}
