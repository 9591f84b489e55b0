//! The bounded auto-fix loop: feeds matched validation output back into the
//! agent network and re-validates, at most `AUTO_FIX_MAX_ATTEMPTS` times.
//!
//! The loop is an explicit counter over a discriminated outcome, never
//! recursion. Files accumulate across attempts; the agent edits in place.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::studio::agent::CodeAgent;
use crate::studio::aggregate::signals_error;
use crate::studio::llm::ChatMessage;
use crate::studio::models::AgentState;
use crate::studio::router;
use crate::studio::sandbox::Sandbox;
use crate::studio::validation::{self, ValidationCommands, ValidationReport};

pub const AUTO_FIX_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug)]
pub enum FixOutcome {
    /// Validation came back clean, after `attempts` repair passes (zero when
    /// the initial report was already clean).
    Clean { attempts: u32 },
    /// The budget is spent and the last report still has matches. The run is
    /// degraded but continues; partial progress is preserved.
    Exhausted {
        attempts: u32,
        report: ValidationReport,
    },
}

impl FixOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Clean { attempts } => *attempts,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean { .. })
    }
}

#[derive(Debug)]
pub struct FixResult {
    pub state: AgentState,
    pub outcome: FixOutcome,
    pub last_assistant_text: String,
}

/// Assemble the structured repair prompt from every matched check outcome,
/// labelled with its source and classification, plus the previous turn's
/// self-reported error text when it has one.
pub fn build_repair_prompt(report: &ValidationReport, last_assistant_text: &str) -> String {
    let mut sections = Vec::new();
    for outcome in report.matched() {
        let heading = match outcome.classification {
            Some(category) => format!("{} check: {}", outcome.source, category.label()),
            None => format!("{} check: exit code {}", outcome.source, outcome.exit_code),
        };
        sections.push(format!(
            "## {}\n```\n{}\n```",
            heading,
            outcome.raw_output.trim()
        ));
    }
    if signals_error(last_assistant_text) {
        sections.push(format!(
            "## previous attempt reported\n{}",
            last_assistant_text.trim()
        ));
    }
    format!(
        "The generated app has validation errors. Fix them by editing the \
         existing files in place; do not start over.\n\n{}\n\nWhen everything \
         passes, finish with a <task_summary>...</task_summary> tag.",
        sections.join("\n\n")
    )
}

/// Run repair attempts until validation is clean or the budget is spent.
/// The accumulated state (files above all) carries across attempts; only
/// the completion marker is reset so the router drives a fresh turn.
#[allow(clippy::too_many_arguments)]
pub async fn run_fix_loop(
    agent: &CodeAgent<'_>,
    sandbox: &dyn Sandbox,
    mut state: AgentState,
    conversation: &mut Vec<ChatMessage>,
    commands: &ValidationCommands,
    build_timeout: Duration,
    mut report: ValidationReport,
    mut last_assistant_text: String,
) -> Result<FixResult> {
    if report.is_clean() {
        return Ok(FixResult {
            state,
            outcome: FixOutcome::Clean { attempts: 0 },
            last_assistant_text,
        });
    }

    let mut attempts = 0;
    while attempts < AUTO_FIX_MAX_ATTEMPTS {
        attempts += 1;
        info!(attempt = attempts, "entering auto-fix attempt");

        conversation.push(ChatMessage::user(build_repair_prompt(
            &report,
            &last_assistant_text,
        )));
        // Files persist across attempts; the marker is re-earned each time.
        state.summary.clear();
        state.summary_retry_count = 0;

        let network = router::run_network(agent, state, conversation).await?;
        last_assistant_text = network.last_assistant_text().to_string();
        state = network.state;

        report = validation::run_validation(sandbox, commands, build_timeout).await;
        if report.is_clean() {
            info!(attempts, "validation clean after repair");
            return Ok(FixResult {
                state,
                outcome: FixOutcome::Clean { attempts },
                last_assistant_text,
            });
        }
    }

    info!(attempts, "auto-fix budget spent with errors remaining");
    Ok(FixResult {
        state,
        outcome: FixOutcome::Exhausted { attempts, report },
        last_assistant_text,
    })
}
