//! Studio — app-generation orchestration back-end.
//!
//! ## Overview
//!
//! The Studio subsystem drives an LLM coding agent through iterative file
//! generation inside an isolated sandbox, validates the result with
//! concurrent lint + build checks, runs a bounded auto-fix loop, and
//! persists the final artifact as a `Fragment` plus a conversation
//! `Message`.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────┐  run/fix/transfer  ┌────────────────────────────────────────┐
//! │   CLI   │ ─────────────────> │  pipeline.rs  (Studio facade)          │
//! │ (main)  │ <───────────────── │      │                                 │
//! └─────────┘                    │      │ classifier::ensure_framework()  │
//!                                │      v                                 │
//!                                │  classifier.rs  (one-shot LLM pick)    │
//!                                │      │                                 │
//!                                │      │ sandbox::provision()            │
//!                                │      v                                 │
//!                                │  sandbox.rs  (SandboxProvider traits)  │
//!                                │      │                                 │
//!                                │      │ router::run_network()           │
//!                                │      v                                 │
//!                                │  router.rs ──> agent.rs (tool surface) │
//!                                │      │                                 │
//!                                │      │ validation::run_validation()    │
//!                                │      v                                 │
//!                                │  validation.rs ──> fixer.rs (retries)  │
//!                                │      │                                 │
//!                                │      │ aggregate + store persistence   │
//!                                │      v                                 │
//!                                │  aggregate.rs / store.rs               │
//!                                └────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                          |
//! |--------------|---------------------------------------------------------|
//! | `models`     | Shared types: `Framework`, `AgentState`, `Fragment`     |
//! | `llm`        | `LlmGateway` trait + OpenAI-compatible HTTP client      |
//! | `store`      | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)     |
//! | `fetcher`    | Optional URL-context fetches before the first turn      |
//!
//! ## Typical Run Flow
//!
//! 1. `Studio::run(project_id, request)` resolves the project's framework,
//!    classifying it with one constrained LLM call when unset.
//! 2. A sandbox is provisioned from the framework's template (falling back
//!    to the generic template, coercing the framework, when it is missing).
//! 3. `router::run_network()` drives code-agent turns until the agent emits
//!    a `<task_summary>` marker, the summary retry budget is spent, or the
//!    hard turn ceiling is hit.
//! 4. Lint and build run concurrently against the sandbox; matched outcomes
//!    feed the bounded auto-fix loop, which re-enters the router with the
//!    accumulated file state.
//! 5. The aggregator overlays the agent's file map on the sandbox tree,
//!    computes the composite error flag, generates title + response in
//!    parallel on success, and persists a `Fragment` and a `Message`.

pub mod agent;
pub mod aggregate;
pub mod classifier;
pub mod fetcher;
pub mod fixer;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod validation;
