//! Integration tests for kiln.
//!
//! Scenario tests drive the full studio pipeline with a scripted gateway and
//! a real process sandbox under a temp directory; CLI tests run the binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

use kiln::config::KilnConfig;
use kiln::errors::StudioError;
use kiln::studio::fetcher::HttpFetcher;
use kiln::studio::llm::{Completion, LlmGateway, ScriptedGateway, ToolCall};
use kiln::studio::models::{Framework, MessageKind, MessageRole};
use kiln::studio::pipeline::Studio;
use kiln::studio::sandbox::{ProcessSandboxProvider, Sandbox, SandboxProvider};
use kiln::studio::store::{DbHandle, StudioDb};

struct Harness {
    _dir: TempDir,
    db: DbHandle,
    gateway: Arc<ScriptedGateway>,
    provider: Arc<ProcessSandboxProvider>,
    studio: Studio,
}

/// Studio wired to a scripted gateway, an in-memory database, and a process
/// sandbox provider. Validation verdicts come from marker files (`lint.out`,
/// `build.out`) the agent can create and remove, instead of real toolchains.
fn harness(script: Vec<Completion>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = KilnConfig::for_root(dir.path());
    for framework in Framework::all() {
        config.lint_overrides.insert(
            framework.as_str().to_string(),
            "if [ -f lint.out ]; then cat lint.out; exit 1; fi".to_string(),
        );
        config.build_overrides.insert(
            framework.as_str().to_string(),
            "if [ -f build.out ]; then cat build.out; exit 1; fi".to_string(),
        );
    }
    config.ensure_directories().unwrap();
    let template = config.templates_dir.join("kiln-react");
    std::fs::create_dir_all(&template).unwrap();
    std::fs::write(template.join("package.json"), "{\"name\":\"app\"}").unwrap();

    let db = DbHandle::new(StudioDb::new_in_memory().unwrap());
    let gateway = Arc::new(ScriptedGateway::new(script));
    let provider = Arc::new(ProcessSandboxProvider::new(
        config.sandbox_root.clone(),
        config.templates_dir.clone(),
        &config.sandbox_host,
    ));
    let studio = Studio::new(
        config,
        db.clone(),
        gateway.clone() as Arc<dyn LlmGateway>,
        provider.clone() as Arc<dyn SandboxProvider>,
        Arc::new(HttpFetcher::new()),
    );
    Harness {
        _dir: dir,
        db,
        gateway,
        provider,
        studio,
    }
}

async fn project_with_framework(db: &DbHandle, framework: Framework) -> i64 {
    let project = db.call(|db| db.create_project("app")).await.unwrap();
    let project_id = project.id;
    db.call(move |db| db.update_project_framework(project_id, framework))
        .await
        .unwrap();
    project_id
}

fn text(content: &str) -> Completion {
    Completion {
        text: content.to_string(),
        tool_calls: vec![],
    }
}

fn tool_calls(calls: Vec<ToolCall>) -> Completion {
    Completion {
        text: String::new(),
        tool_calls: calls,
    }
}

fn terminal(command: &str) -> ToolCall {
    ToolCall {
        id: format!("call_term_{}", command.len()),
        name: "terminal".to_string(),
        arguments: serde_json::json!({ "command": command }),
    }
}

fn write_files(entries: &[(&str, &str)]) -> ToolCall {
    let files: Vec<serde_json::Value> = entries
        .iter()
        .map(|(path, content)| serde_json::json!({ "path": path, "content": content }))
        .collect();
    ToolCall {
        id: "call_write".to_string(),
        name: "create_or_update_files".to_string(),
        arguments: serde_json::json!({ "files": files }),
    }
}

// =============================================================================
// Full run scenarios
// =============================================================================

mod scenario_runs {
    use super::*;

    #[tokio::test]
    async fn test_fresh_run_classifies_generates_and_persists() {
        let script = vec![
            // Classifier pick for the unset project.
            text("react"),
            // Agent turn: write the app, then close with a marker.
            tool_calls(vec![write_files(&[(
                "app/App.jsx",
                "export default function App() { return null; }",
            )])]),
            text("All set. <task_summary>Built a todo app with add and complete actions.</task_summary>"),
            // Secondary generation.
            text("Todo App"),
            text("I built a simple todo app with add and complete actions."),
        ];
        let h = harness(script);
        let project = h.db.call(|db| db.create_project("todo")).await.unwrap();
        let project_id = project.id;
        assert!(project.framework.is_none());

        let output = h.studio.run(project_id, "build a todo app").await.unwrap();

        assert!(!output.is_error, "reasons: {:?}", output.error_reasons);
        assert_eq!(output.title, "Todo App");
        assert_eq!(
            output.summary,
            "Built a todo app with add and complete actions."
        );
        assert_eq!(output.url, "http://127.0.0.1:5173");
        assert!(output.files.contains_key("app/App.jsx"));
        // The template seed survives into the final file set.
        assert!(output.files.contains_key("package.json"));
        assert_eq!(output.auto_fix_attempts, 0);
        assert_eq!(h.gateway.remaining(), 0);

        let loaded = h
            .db
            .call(move |db| db.get_project(project_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.framework, Some(Framework::React));

        let messages = h
            .db
            .call(move |db| db.list_messages(project_id))
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].kind, MessageKind::Result);

        let fragment_id = output.fragment_id;
        let fragment = h
            .db
            .call(move |db| db.get_fragment(fragment_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fragment.files, output.files);
        assert_eq!(fragment.framework, Framework::React);
        assert!(!fragment.sandbox_url.is_empty());
    }

    #[tokio::test]
    async fn test_lint_failure_fixed_in_one_attempt() {
        let script = vec![
            tool_calls(vec![
                terminal("printf 'ESLint: 2 problems (2 errors, 0 warnings)\n' > lint.out"),
                write_files(&[("app/App.jsx", "export default 1")]),
            ]),
            text("Done. <task_summary>Initial build.</task_summary>"),
            // Fix attempt: remove the offending output, re-earn the marker.
            tool_calls(vec![terminal("rm lint.out")]),
            text("Cleaned up. <task_summary>Tidied the rule violations.</task_summary>"),
            text("Todo App"),
            text("I built it and tidied the style issues."),
        ];
        let h = harness(script);
        let project_id = project_with_framework(&h.db, Framework::React).await;

        let output = h.studio.run(project_id, "build a todo app").await.unwrap();

        assert!(!output.is_error, "reasons: {:?}", output.error_reasons);
        assert_eq!(output.auto_fix_attempts, 1);
        assert_eq!(h.gateway.remaining(), 0);

        // The repair prompt carried the lint output and its classification.
        let requests = h.gateway.requests();
        let repair = requests[2]
            .messages
            .iter()
            .rev()
            .find(|m| m.tool_call_id.is_none() && m.tool_calls.is_none())
            .unwrap();
        assert!(repair.content.contains("ESLint"));
        assert!(repair.content.contains("lint violation"));
    }

    #[tokio::test]
    async fn test_build_failure_exhausts_budget_and_degrades() {
        let script = vec![
            tool_calls(vec![
                terminal("printf 'Build failed\n' > build.out"),
                write_files(&[("app/App.jsx", "export default 1")]),
            ]),
            text("Finished. <task_summary>First pass.</task_summary>"),
            // Neither fix attempt removes the failure marker.
            text("Adjusted the config. <task_summary>Config tweak.</task_summary>"),
            text("Tried another approach. <task_summary>Second tweak.</task_summary>"),
        ];
        let h = harness(script);
        let project_id = project_with_framework(&h.db, Framework::React).await;

        let output = h.studio.run(project_id, "build a todo app").await.unwrap();

        assert!(output.is_error);
        assert_eq!(output.auto_fix_attempts, 2);
        assert_eq!(output.response, "Something went wrong. Please try again.");
        // Title/response generation is skipped entirely on error runs.
        assert_eq!(h.gateway.remaining(), 0);

        let messages = h
            .db
            .call(move |db| db.list_messages(project_id))
            .await
            .unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.kind, MessageKind::Error);
        assert_eq!(last.content, "Something went wrong. Please try again.");

        // Partial progress is preserved and persisted, not discarded.
        let fragment_id = output.fragment_id;
        let fragment = h
            .db
            .call(move |db| db.get_fragment(fragment_id))
            .await
            .unwrap()
            .unwrap();
        assert!(fragment.files.contains_key("app/App.jsx"));
        assert_eq!(fragment.title, "Fragment");
    }

    #[tokio::test]
    async fn test_missing_marker_yields_fallback_summary() {
        let script = vec![
            tool_calls(vec![write_files(&[("app/App.jsx", "export default 1")])]),
            text("The files are in place."),
            text("Anything else you need?"),
            text("Let me know how it looks."),
            text("Todo App"),
            text("Here it is."),
        ];
        let h = harness(script);
        let project_id = project_with_framework(&h.db, Framework::React).await;

        let output = h.studio.run(project_id, "build a todo app").await.unwrap();

        assert!(!output.is_error, "reasons: {:?}", output.error_reasons);
        assert_eq!(output.summary, "Generated 1 file: app/App.jsx");
        assert_eq!(h.gateway.remaining(), 0);

        // The router nudged for the marker before synthesizing.
        let requests = h.gateway.requests();
        assert!(
            requests[2]
                .messages
                .iter()
                .any(|m| m.content.contains("<task_summary>"))
        );
    }

    #[tokio::test]
    async fn test_run_on_unknown_project_errors() {
        let h = harness(vec![]);
        let err = h.studio.run(999, "build anything").await.unwrap_err();
        assert!(matches!(err, StudioError::ProjectNotFound { id: 999 }));
    }
}

// =============================================================================
// Fix and transfer operations
// =============================================================================

mod scenario_fixes {
    use super::*;

    async fn seeded_fragment(
        h: &Harness,
        files: BTreeMap<String, String>,
    ) -> (i64, String) {
        let project_id = project_with_framework(&h.db, Framework::React).await;
        let sandbox = h.provider.create("kiln-react").await.unwrap();
        let sandbox_id = sandbox.id().to_string();
        let fragment = {
            let files = files.clone();
            let sandbox_id = sandbox_id.clone();
            h.db.call(move |db| {
                db.create_fragment(
                    project_id,
                    &sandbox_id,
                    "http://127.0.0.1:5173",
                    "Todo App",
                    &files,
                    Framework::React,
                    None,
                )
            })
            .await
            .unwrap()
        };
        (fragment.id, sandbox_id)
    }

    #[tokio::test]
    async fn test_fix_on_clean_fragment_returns_without_agent() {
        let h = harness(vec![]);
        let mut files = BTreeMap::new();
        files.insert("app/App.jsx".to_string(), "export default 1".to_string());
        let (fragment_id, _) = seeded_fragment(&h, files).await;

        let output = h.studio.fix(fragment_id).await.unwrap();
        assert!(output.clean);
        assert_eq!(output.attempts, 0);
        assert!(h.gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_fix_repairs_fragment_and_records_history() {
        let script = vec![
            tool_calls(vec![terminal("rm build.out")]),
            text("Dropped the stale artifact. <task_summary>Removed the bad build marker.</task_summary>"),
        ];
        let h = harness(script);
        let mut files = BTreeMap::new();
        files.insert("app/App.jsx".to_string(), "export default 1".to_string());
        files.insert("build.out".to_string(), "Build failed".to_string());
        let (fragment_id, _) = seeded_fragment(&h, files).await;

        let output = h.studio.fix(fragment_id).await.unwrap();
        assert!(output.clean);
        assert_eq!(output.attempts, 1);
        assert_eq!(h.gateway.remaining(), 0);

        let updated = h
            .db
            .call(move |db| db.get_fragment(fragment_id))
            .await
            .unwrap()
            .unwrap();
        let metadata = updated.metadata.unwrap();
        assert_eq!(metadata["backups"]["build.out"], "Build failed");
        assert_eq!(metadata["fix_history"].as_array().unwrap().len(), 1);
        assert_eq!(metadata["fix_history"][0]["attempts"], 1);
        assert_eq!(metadata["fix_history"][0]["clean"], true);
    }

    #[tokio::test]
    async fn test_fix_on_dead_sandbox_is_fatal() {
        let h = harness(vec![]);
        let project_id = project_with_framework(&h.db, Framework::React).await;
        let fragment = h
            .db
            .call(move |db| {
                db.create_fragment(
                    project_id,
                    "sb-gone",
                    "http://127.0.0.1:5173",
                    "Todo App",
                    &BTreeMap::new(),
                    Framework::React,
                    None,
                )
            })
            .await
            .unwrap();

        let err = h.studio.fix(fragment.id).await.unwrap_err();
        assert!(matches!(err, StudioError::SandboxResume(_)));
    }

    #[tokio::test]
    async fn test_transfer_reattaches_live_sandbox() {
        let h = harness(vec![]);
        let mut files = BTreeMap::new();
        files.insert("app/App.jsx".to_string(), "export default 1".to_string());
        let (fragment_id, sandbox_id) = seeded_fragment(&h, files).await;

        let output = h.studio.transfer(fragment_id).await.unwrap();
        assert!(!output.recreated);
        assert_eq!(output.sandbox_id, sandbox_id);

        let updated = h
            .db
            .call(move |db| db.get_fragment(fragment_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.sandbox_url, output.url);
    }

    #[tokio::test]
    async fn test_transfer_recreates_expired_sandbox() {
        let h = harness(vec![]);
        let project_id = project_with_framework(&h.db, Framework::React).await;
        let mut files = BTreeMap::new();
        files.insert("app/App.jsx".to_string(), "export default 1".to_string());
        let fragment = {
            let files = files.clone();
            h.db.call(move |db| {
                db.create_fragment(
                    project_id,
                    "sb-gone",
                    "http://127.0.0.1:5173",
                    "Todo App",
                    &files,
                    Framework::React,
                    None,
                )
            })
            .await
            .unwrap()
        };

        let output = h.studio.transfer(fragment.id).await.unwrap();
        assert!(output.recreated);
        assert_ne!(output.sandbox_id, "sb-gone");

        // The new sandbox is seeded from the fragment's file map.
        let resumed = h.provider.resume(&output.sandbox_id).await.unwrap();
        assert_eq!(
            resumed.read_file("app/App.jsx").await.unwrap(),
            "export default 1"
        );
    }
}

// =============================================================================
// Basic CLI tests
// =============================================================================

mod cli_basics {
    use super::*;

    fn kiln() -> Command {
        cargo_bin_cmd!("kiln")
    }

    #[test]
    fn test_kiln_help() {
        kiln().arg("--help").assert().success();
    }

    #[test]
    fn test_kiln_version() {
        kiln().arg("--version").assert().success();
    }

    #[test]
    fn test_project_new_and_list() {
        let dir = TempDir::new().unwrap();
        kiln()
            .arg("--data-dir")
            .arg(dir.path())
            .args(["project", "new", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("demo"));

        kiln()
            .arg("--data-dir")
            .arg(dir.path())
            .args(["project", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("demo"));
    }

    #[test]
    fn test_sweep_with_no_sandboxes() {
        let dir = TempDir::new().unwrap();
        kiln()
            .arg("--data-dir")
            .arg(dir.path())
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("Reaped 0"));
    }
}
