//! One-shot framework classification for projects that have no stack yet.
//!
//! Classification is best-effort: any gateway error or unrecognized reply
//! falls back to the default framework. This path must never abort a run.

use tracing::{info, warn};

use crate::studio::llm::{ChatMessage, CompletionRequest, LlmGateway};
use crate::studio::models::Framework;
use crate::studio::store::DbHandle;

const CLASSIFIER_SYSTEM_PROMPT: &str = "You classify app-generation requests \
by target framework. Reply with exactly one word from: nextjs, react, vue, \
svelte, angular. When the request does not clearly call for a specific \
framework, reply nextjs.";

/// Map a classifier reply onto the framework enum. Unrecognized output
/// defaults to the primary framework.
pub fn parse_classification(text: &str) -> Framework {
    let lowered = text.trim().to_lowercase();
    if let Ok(framework) = lowered.parse::<Framework>() {
        return framework;
    }
    for framework in Framework::all() {
        if lowered.contains(framework.as_str()) {
            return *framework;
        }
    }
    if lowered.contains("next") {
        return Framework::Nextjs;
    }
    Framework::default()
}

/// Issue the single constrained classification call. Errors are swallowed
/// and yield the default framework.
pub async fn classify(gateway: &dyn LlmGateway, model: &str, user_request: &str) -> Framework {
    let request = CompletionRequest {
        system: CLASSIFIER_SYSTEM_PROMPT.to_string(),
        model: model.to_string(),
        messages: vec![ChatMessage::user(user_request)],
        tools: Vec::new(),
    };
    match gateway.complete(request).await {
        Ok(completion) => {
            let framework = parse_classification(&completion.text);
            info!(%framework, "classified framework");
            framework
        }
        Err(e) => {
            warn!(
                "classification failed, defaulting to {}: {e}",
                Framework::default()
            );
            Framework::default()
        }
    }
}

/// Resolve the project's framework. Short-circuits when already set;
/// otherwise classifies and persists the pick on the project record. The
/// store's set-once guard keeps the side effect from ever overwriting an
/// earlier classification.
pub async fn ensure_framework(
    gateway: &dyn LlmGateway,
    db: &DbHandle,
    project_id: i64,
    current: Option<Framework>,
    model: &str,
    user_request: &str,
) -> Framework {
    if let Some(framework) = current {
        return framework;
    }
    let framework = classify(gateway, model, user_request).await;
    if let Err(e) = db
        .call(move |db| db.update_project_framework(project_id, framework))
        .await
    {
        warn!("failed to persist classified framework: {e}");
    }
    framework
}
