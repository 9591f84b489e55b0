//! The code agent: an LLM entity bound to a framework-specific system prompt
//! and a three-tool surface over one sandbox.
//!
//! Tools are constructed per run from an explicit sandbox handle. Every tool
//! call mutates the sandbox before agent state is updated, so the state's
//! file map only ever reflects content that was actually written.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::studio::llm::{
    ChatMessage, Completion, CompletionRequest, LlmGateway, ToolCall, ToolSpec,
};
use crate::studio::models::{AgentState, FileEntry, Framework};
use crate::studio::sandbox::{ExecOptions, Sandbox};

pub const TASK_SUMMARY_OPEN: &str = "<task_summary>";
pub const TASK_SUMMARY_CLOSE: &str = "</task_summary>";

/// Rounds of tool dispatch allowed within a single router turn.
const MAX_TOOL_ROUNDS: u32 = 12;

/// Deadline for agent-issued terminal commands.
const TERMINAL_TIMEOUT_SECS: u64 = 60;

/// Extract the completion marker's content from assistant output.
/// Tolerates a missing close tag, like the other signal tags in this system.
pub fn extract_task_summary(text: &str) -> Option<String> {
    let start = text.find(TASK_SUMMARY_OPEN)?;
    let content_start = start + TASK_SUMMARY_OPEN.len();
    let content = match text[content_start..].find(TASK_SUMMARY_CLOSE) {
        Some(end) => &text[content_start..content_start + end],
        None => &text[content_start..],
    };
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Result of one router turn: the successor state plus what the turn did.
#[derive(Debug)]
pub struct TurnResult {
    pub state: AgentState,
    pub assistant_text: String,
    pub files_written: Vec<String>,
}

pub struct CodeAgent<'a> {
    gateway: &'a dyn LlmGateway,
    sandbox: &'a dyn Sandbox,
    model: String,
}

#[derive(Deserialize)]
struct TerminalArgs {
    command: String,
}

#[derive(Deserialize)]
struct CreateFilesArgs {
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct ReadFilesArgs {
    paths: Vec<String>,
}

impl<'a> CodeAgent<'a> {
    pub fn new(gateway: &'a dyn LlmGateway, sandbox: &'a dyn Sandbox, model: &str) -> Self {
        Self {
            gateway,
            sandbox,
            model: model.to_string(),
        }
    }

    pub fn system_prompt(framework: Framework) -> String {
        let mut prompt = format!(
            "You are a senior {} engineer working inside a live sandbox. \
             Build exactly what the user asks for by writing complete, production-quality files.\n\
             \n\
             Tools:\n\
             - terminal: run a shell command (e.g. install packages)\n\
             - create_or_update_files: write files into the sandbox\n\
             - read_files: read existing sandbox files\n\
             \n\
             Rules:\n\
             - Use relative paths from the project root.\n\
             - Never delete files; only create or overwrite.\n\
             - When the app is complete, finish your reply with \
             {}a one-paragraph summary of what you built{}.",
            framework, TASK_SUMMARY_OPEN, TASK_SUMMARY_CLOSE,
        );
        if let Some(import) = framework.required_import() {
            prompt.push_str(&format!(
                "\n- Build the UI from the shared component library; import components from {}.",
                import
            ));
        }
        prompt
    }

    pub fn tool_specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "terminal".to_string(),
                description: "Run a shell command in the sandbox and return its stdout."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "command": { "type": "string" }
                    },
                    "required": ["command"]
                }),
            },
            ToolSpec {
                name: "create_or_update_files".to_string(),
                description: "Write files into the sandbox, creating or overwriting each path."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "files": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": { "type": "string" },
                                    "content": { "type": "string" }
                                },
                                "required": ["path", "content"]
                            }
                        }
                    },
                    "required": ["files"]
                }),
            },
            ToolSpec {
                name: "read_files".to_string(),
                description: "Read sandbox files; returns an array of {path, content}."
                    .to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "paths": {
                            "type": "array",
                            "items": { "type": "string" }
                        }
                    },
                    "required": ["paths"]
                }),
            },
        ]
    }

    /// Execute one router turn: call the model, dispatch tool calls until it
    /// produces plain text (or the round budget runs out), and return the
    /// successor state.
    pub async fn run_turn(
        &self,
        mut state: AgentState,
        conversation: &mut Vec<ChatMessage>,
    ) -> Result<TurnResult> {
        let mut files_written = Vec::new();
        let mut assistant_text = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            let completion = self
                .gateway
                .complete(CompletionRequest {
                    system: Self::system_prompt(state.framework),
                    model: self.model.clone(),
                    messages: conversation.clone(),
                    tools: Self::tool_specs(),
                })
                .await
                .context("Agent completion failed")?;

            if completion.tool_calls.is_empty() {
                assistant_text = completion.text.clone();
                conversation.push(ChatMessage::assistant(completion.text));
                break;
            }

            let Completion { text, tool_calls } = completion;
            conversation.push(ChatMessage::assistant_with_calls(text, tool_calls.clone()));
            for call in &tool_calls {
                let result = self.dispatch(call, &mut state, &mut files_written).await;
                conversation.push(ChatMessage::tool_result(call.id.clone(), result));
            }

            if round + 1 == MAX_TOOL_ROUNDS {
                warn!("tool round budget exhausted without a final reply");
            }
        }

        if let Some(summary) = extract_task_summary(&assistant_text) {
            state.summary = summary;
        }

        Ok(TurnResult {
            state,
            assistant_text,
            files_written,
        })
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        state: &mut AgentState,
        files_written: &mut Vec<String>,
    ) -> String {
        debug!(tool = %call.name, "dispatching tool call");
        match call.name.as_str() {
            "terminal" => self.handle_terminal(call).await,
            "create_or_update_files" => self.handle_create_files(call, state, files_written).await,
            "read_files" => self.handle_read_files(call).await,
            other => format!("error: unknown tool '{}'", other),
        }
    }

    async fn handle_terminal(&self, call: &ToolCall) -> String {
        let args: TerminalArgs = match serde_json::from_value(call.arguments.clone()) {
            Ok(args) => args,
            Err(e) => return format!("error: invalid terminal arguments: {}", e),
        };
        match self
            .sandbox
            .run(
                &args.command,
                ExecOptions {
                    timeout: Some(std::time::Duration::from_secs(TERMINAL_TIMEOUT_SECS)),
                },
            )
            .await
        {
            Ok(result) => {
                // stderr is logged but not returned to the model, to limit noise.
                if !result.stderr.is_empty() {
                    debug!(command = %args.command, stderr = %result.stderr.trim(), "terminal stderr");
                }
                if result.success() {
                    result.stdout
                } else {
                    format!(
                        "command exited with code {}\n{}",
                        result.exit_code, result.stdout
                    )
                }
            }
            Err(e) => format!("error: {}", e),
        }
    }

    async fn handle_create_files(
        &self,
        call: &ToolCall,
        state: &mut AgentState,
        files_written: &mut Vec<String>,
    ) -> String {
        let args: CreateFilesArgs = match serde_json::from_value(call.arguments.clone()) {
            Ok(args) => args,
            Err(e) => return format!("error: invalid create_or_update_files arguments: {}", e),
        };
        let mut written = Vec::new();
        let mut failed = Vec::new();
        for entry in &args.files {
            // Sandbox first, state second: the map must never claim a file
            // that was not actually written.
            match self.sandbox.write_file(&entry.path, &entry.content).await {
                Ok(()) => {
                    state.merge_files(std::slice::from_ref(entry));
                    files_written.push(entry.path.clone());
                    written.push(entry.path.clone());
                }
                Err(e) => {
                    warn!(path = %entry.path, "file write failed: {e}");
                    failed.push(format!("{}: {}", entry.path, e));
                }
            }
        }
        if failed.is_empty() {
            format!("wrote {} file(s): {}", written.len(), written.join(", "))
        } else {
            format!(
                "wrote {} file(s); failed: {}",
                written.len(),
                failed.join("; ")
            )
        }
    }

    async fn handle_read_files(&self, call: &ToolCall) -> String {
        let args: ReadFilesArgs = match serde_json::from_value(call.arguments.clone()) {
            Ok(args) => args,
            Err(e) => return format!("error: invalid read_files arguments: {}", e),
        };
        let mut entries = Vec::new();
        for path in &args.paths {
            match self.sandbox.read_file(path).await {
                Ok(content) => entries.push(serde_json::json!({
                    "path": path,
                    "content": content,
                })),
                // Individual read failures never abort the batch.
                Err(e) => entries.push(serde_json::json!({
                    "path": path,
                    "error": e.to_string(),
                })),
            }
        }
        serde_json::Value::Array(entries).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::studio::llm::ScriptedGateway;
    use crate::studio::sandbox::{FALLBACK_TEMPLATE, ProcessSandboxProvider, SandboxProvider};
    use tempfile::tempdir;

    fn tool_call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments,
        }
    }

    async fn sandbox_in(dir: &std::path::Path) -> Box<dyn Sandbox> {
        let provider =
            ProcessSandboxProvider::new(dir.join("sb"), dir.join("tpl"), "127.0.0.1");
        provider.create(FALLBACK_TEMPLATE).await.unwrap()
    }

    #[test]
    fn test_extract_task_summary() {
        assert_eq!(
            extract_task_summary("done <task_summary>Built a todo app</task_summary>"),
            Some("Built a todo app".to_string())
        );
        assert_eq!(
            extract_task_summary("<task_summary>unclosed tag summary"),
            Some("unclosed tag summary".to_string())
        );
        assert_eq!(extract_task_summary("no marker here"), None);
        assert_eq!(extract_task_summary("<task_summary>  </task_summary>"), None);
    }

    #[test]
    fn test_system_prompt_mentions_component_library_for_nextjs_only() {
        assert!(CodeAgent::system_prompt(Framework::Nextjs).contains("@/components/ui/"));
        assert!(!CodeAgent::system_prompt(Framework::Vue).contains("@/components/ui/"));
    }

    #[test]
    fn test_tool_specs_expose_exactly_three_tools() {
        let specs = CodeAgent::tool_specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["terminal", "create_or_update_files", "read_files"]
        );
    }

    #[tokio::test]
    async fn test_turn_writes_sandbox_then_state() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(dir.path()).await;
        let gateway = ScriptedGateway::new(vec![
            Completion {
                text: String::new(),
                tool_calls: vec![tool_call(
                    "create_or_update_files",
                    serde_json::json!({
                        "files": [{"path": "app/page.tsx", "content": "export default 1"}]
                    }),
                )],
            },
            Completion {
                text: "done <task_summary>Wrote the page</task_summary>".into(),
                tool_calls: vec![],
            },
        ]);
        let agent = CodeAgent::new(&gateway, sandbox.as_ref(), "test-model");
        let mut conversation = vec![ChatMessage::user("build it")];
        let result = agent
            .run_turn(AgentState::new(Framework::Nextjs), &mut conversation)
            .await
            .unwrap();

        // Sandbox holds what the state claims.
        assert_eq!(
            sandbox.read_file("app/page.tsx").await.unwrap(),
            "export default 1"
        );
        assert_eq!(
            result.state.files.get("app/page.tsx").unwrap(),
            "export default 1"
        );
        assert_eq!(result.files_written, vec!["app/page.tsx"]);
        assert_eq!(result.state.summary, "Wrote the page");
    }

    #[tokio::test]
    async fn test_turn_without_marker_leaves_summary_empty() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(dir.path()).await;
        let gateway = ScriptedGateway::new(vec![Completion {
            text: "I wrote some files".into(),
            tool_calls: vec![],
        }]);
        let agent = CodeAgent::new(&gateway, sandbox.as_ref(), "test-model");
        let mut conversation = vec![ChatMessage::user("build it")];
        let result = agent
            .run_turn(AgentState::new(Framework::React), &mut conversation)
            .await
            .unwrap();
        assert!(result.state.summary.is_empty());
        assert_eq!(result.assistant_text, "I wrote some files");
    }

    #[tokio::test]
    async fn test_terminal_returns_stdout_only() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(dir.path()).await;
        let gateway = ScriptedGateway::new(vec![
            Completion {
                text: String::new(),
                tool_calls: vec![tool_call(
                    "terminal",
                    serde_json::json!({"command": "echo out; echo noisy >&2"}),
                )],
            },
            Completion {
                text: "<task_summary>ran a command</task_summary>".into(),
                tool_calls: vec![],
            },
        ]);
        let agent = CodeAgent::new(&gateway, sandbox.as_ref(), "test-model");
        let mut conversation = vec![ChatMessage::user("run it")];
        agent
            .run_turn(AgentState::new(Framework::Nextjs), &mut conversation)
            .await
            .unwrap();

        // The tool-result message carries stdout but not stderr.
        let tool_msg = conversation
            .iter()
            .find(|m| m.tool_call_id.is_some())
            .unwrap();
        assert!(tool_msg.content.contains("out"));
        assert!(!tool_msg.content.contains("noisy"));
    }

    #[tokio::test]
    async fn test_read_files_tolerates_individual_failures() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(dir.path()).await;
        sandbox.write_file("exists.txt", "hello").await.unwrap();
        let gateway = ScriptedGateway::new(vec![
            Completion {
                text: String::new(),
                tool_calls: vec![tool_call(
                    "read_files",
                    serde_json::json!({"paths": ["exists.txt", "missing.txt"]}),
                )],
            },
            Completion {
                text: "<task_summary>read files</task_summary>".into(),
                tool_calls: vec![],
            },
        ]);
        let agent = CodeAgent::new(&gateway, sandbox.as_ref(), "test-model");
        let mut conversation = vec![ChatMessage::user("read")];
        agent
            .run_turn(AgentState::new(Framework::Nextjs), &mut conversation)
            .await
            .unwrap();

        let tool_msg = conversation
            .iter()
            .find(|m| m.tool_call_id.is_some())
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&tool_msg.content).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["content"], "hello");
        assert!(entries[1]["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_malformed_tool_arguments_do_not_abort_turn() {
        let dir = tempdir().unwrap();
        let sandbox = sandbox_in(dir.path()).await;
        let gateway = ScriptedGateway::new(vec![
            Completion {
                text: String::new(),
                tool_calls: vec![tool_call("terminal", serde_json::json!({"cmd": "wrong"}))],
            },
            Completion {
                text: "<task_summary>recovered</task_summary>".into(),
                tool_calls: vec![],
            },
        ]);
        let agent = CodeAgent::new(&gateway, sandbox.as_ref(), "test-model");
        let mut conversation = vec![ChatMessage::user("go")];
        let result = agent
            .run_turn(AgentState::new(Framework::Nextjs), &mut conversation)
            .await
            .unwrap();
        assert_eq!(result.state.summary, "recovered");
        let tool_msg = conversation
            .iter()
            .find(|m| m.tool_call_id.is_some())
            .unwrap();
        assert!(tool_msg.content.starts_with("error:"));
    }
}
