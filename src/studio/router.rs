//! Agent network router: the per-run state machine driving code-agent turns.
//!
//! The router owns the turn loop. It re-invokes the agent until a completion
//! marker arrives, nudges the agent a bounded number of times when files
//! exist but the marker is missing, and synthesizes a fallback summary when
//! the nudge budget runs out so a run never hangs on a forgotten marker.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::studio::agent::CodeAgent;
use crate::studio::llm::ChatMessage;
use crate::studio::models::AgentState;

/// How many times the router re-invokes the agent asking for an explicit
/// completion marker before giving up and synthesizing one.
pub const SUMMARY_RETRY_MAX: u32 = 2;

/// Hard ceiling on agent turns per network invocation, regardless of state.
pub const MAX_TURNS: u32 = 8;

const SUMMARY_REMINDER: &str = "The files look good. Reply with a \
<task_summary>...</task_summary> tag containing a one-paragraph summary of \
what you built. Do not write any more files.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    AwaitingFiles,
    AwaitingSummary,
    Terminal,
}

pub fn current_state(state: &AgentState) -> RouterState {
    if state.has_summary() {
        RouterState::Terminal
    } else if state.has_files() {
        RouterState::AwaitingSummary
    } else {
        RouterState::AwaitingFiles
    }
}

/// What one turn did: the state it started in, the files it wrote, and the
/// assistant's closing text.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub turn: u32,
    pub entered: RouterState,
    pub files_written: Vec<String>,
    pub assistant_text: String,
}

/// Ordered record of one network invocation plus the final agent state.
/// Append-only within a run.
#[derive(Debug)]
pub struct NetworkRun {
    pub turns: Vec<TurnRecord>,
    pub state: AgentState,
}

impl NetworkRun {
    pub fn last_assistant_text(&self) -> &str {
        self.turns
            .last()
            .map(|t| t.assistant_text.as_str())
            .unwrap_or("")
    }
}

/// Summary synthesized from the file list when the agent never emits a
/// marker. The escape hatch that keeps a file-producing run from hanging.
pub fn fallback_summary(files: &BTreeMap<String, String>) -> String {
    let paths: Vec<&str> = files.keys().map(String::as_str).collect();
    if paths.len() == 1 {
        format!("Generated 1 file: {}", paths[0])
    } else {
        format!("Generated {} files: {}", paths.len(), paths.join(", "))
    }
}

/// Drive agent turns until the state machine reaches `Terminal` or the turn
/// ceiling is hit.
///
/// Transitions, evaluated before each turn:
/// - summary present: terminal, stop.
/// - no files yet: invoke the agent again without touching the retry counter.
/// - files but no summary (and at least one turn already ran here): bump the
///   retry counter; below the cap, nudge the agent for an explicit marker;
///   past it, synthesize a fallback summary and stop.
pub async fn run_network(
    agent: &CodeAgent<'_>,
    mut state: AgentState,
    conversation: &mut Vec<ChatMessage>,
) -> Result<NetworkRun> {
    let mut turns = Vec::new();

    for turn in 0..MAX_TURNS {
        if state.has_summary() {
            break;
        }
        let entered = current_state(&state);
        if turn > 0 && entered == RouterState::AwaitingSummary {
            state.summary_retry_count += 1;
            if state.summary_retry_count > SUMMARY_RETRY_MAX {
                info!(
                    retries = state.summary_retry_count - 1,
                    "summary retry budget spent, synthesizing fallback"
                );
                state.summary = fallback_summary(&state.files);
                break;
            }
            conversation.push(ChatMessage::user(SUMMARY_REMINDER));
        }

        debug!(turn, state = ?entered, "running agent turn");
        let result = agent.run_turn(state, conversation).await?;
        state = result.state;
        turns.push(TurnRecord {
            turn,
            entered,
            files_written: result.files_written,
            assistant_text: result.assistant_text,
        });
    }

    // Turn ceiling spent with files on disk but no marker: same escape hatch.
    if !state.has_summary() && state.has_files() {
        state.summary = fallback_summary(&state.files);
    }

    Ok(NetworkRun { turns, state })
}
