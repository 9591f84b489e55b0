//! Validation pipeline: concurrent lint + build checks against the live
//! sandbox, with a typed, ordered error taxonomy.
//!
//! Lint and build are deliberately asymmetric: a non-zero build exit is
//! always an error, while lint only counts when a known error signature
//! matches. Build correctness is binary; lint is advisory.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::studio::models::Framework;
use crate::studio::sandbox::{ExecOptions, Sandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    Lint,
    Build,
}

impl CheckSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lint => "lint",
            Self::Build => "build",
        }
    }
}

impl std::fmt::Display for CheckSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a check failed, in match-priority order. The typed category lets the
/// repair prompt and the error flag reason about the kind of defect instead
/// of a bare boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Type,
    ModuleResolution,
    Lint,
    BuildFailure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Type => "type",
            Self::ModuleResolution => "module_resolution",
            Self::Lint => "lint",
            Self::BuildFailure => "build_failure",
        }
    }

    /// Human-readable label used in repair prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax error",
            Self::Type => "type error",
            Self::ModuleResolution => "unresolved module",
            Self::Lint => "lint violation",
            Self::BuildFailure => "build failure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered taxonomy of error signatures. Evaluated top to bottom; the first
/// match wins, so specific categories come before the generic ones.
static TAXONOMY: LazyLock<Vec<(ErrorCategory, Regex)>> = LazyLock::new(|| {
    vec![
        (
            ErrorCategory::Syntax,
            Regex::new(r"(?i)syntax\s?error|unexpected token|parsing ecmascript source code failed")
                .expect("valid syntax pattern"),
        ),
        (
            ErrorCategory::Type,
            Regex::new(r"TS\d{4}|(?i)type error").expect("valid type pattern"),
        ),
        (
            ErrorCategory::ModuleResolution,
            Regex::new(r"(?i)cannot find module|module not found|failed to resolve import|could not resolve")
                .expect("valid module pattern"),
        ),
        (
            ErrorCategory::Lint,
            Regex::new(r"(?i)eslint|\d+ problems? \(\d+ errors?").expect("valid lint pattern"),
        ),
        (
            ErrorCategory::BuildFailure,
            Regex::new(r"(?i)failed to compile|build failed|compilation failed|npm ERR!")
                .expect("valid build pattern"),
        ),
    ]
});

/// Classify check output against the taxonomy. First match in order wins.
pub fn classify(output: &str) -> Option<ErrorCategory> {
    TAXONOMY
        .iter()
        .find(|(_, pattern)| pattern.is_match(output))
        .map(|(category, _)| *category)
}

/// Outcome of a single lint or build check. Created fresh per validation
/// pass; never persisted.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub source: CheckSource,
    pub raw_output: String,
    pub exit_code: i32,
    pub classification: Option<ErrorCategory>,
}

impl CheckOutcome {
    /// Whether this outcome should drive the auto-fix loop. A failed build
    /// always matches; lint additionally needs a taxonomy hit.
    pub fn matched(&self) -> bool {
        if self.exit_code == 0 {
            return false;
        }
        match self.source {
            CheckSource::Build => true,
            CheckSource::Lint => self.classification.is_some(),
        }
    }

    /// Degraded outcome for a check that could not execute at all. Never
    /// matched: a validation failure must not be more fatal than the
    /// condition it checks for.
    fn degraded(source: CheckSource) -> Self {
        Self {
            source,
            raw_output: String::new(),
            exit_code: 0,
            classification: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub lint: CheckOutcome,
    pub build: CheckOutcome,
}

impl ValidationReport {
    pub fn matched(&self) -> Vec<&CheckOutcome> {
        [&self.lint, &self.build]
            .into_iter()
            .filter(|o| o.matched())
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.matched().is_empty()
    }
}

/// Concrete commands for one validation pass. Framework defaults,
/// overridable per framework through configuration.
#[derive(Debug, Clone)]
pub struct ValidationCommands {
    pub lint: String,
    pub build: String,
}

impl ValidationCommands {
    pub fn for_framework(
        framework: Framework,
        lint_overrides: &HashMap<String, String>,
        build_overrides: &HashMap<String, String>,
    ) -> Self {
        let key = framework.as_str();
        Self {
            lint: lint_overrides
                .get(key)
                .cloned()
                .unwrap_or_else(|| framework.lint_command().to_string()),
            build: build_overrides
                .get(key)
                .cloned()
                .unwrap_or_else(|| framework.build_command().to_string()),
        }
    }
}

async fn run_check(
    sandbox: &dyn Sandbox,
    source: CheckSource,
    command: &str,
    timeout: Option<Duration>,
) -> CheckOutcome {
    match sandbox.run(command, ExecOptions { timeout }).await {
        Ok(result) => {
            let raw_output = result.combined_output();
            CheckOutcome {
                source,
                classification: classify(&raw_output),
                raw_output,
                exit_code: result.exit_code,
            }
        }
        Err(e) => {
            warn!(source = %source, "check could not execute, degrading to unmatched: {e}");
            CheckOutcome::degraded(source)
        }
    }
}

/// Run lint and build concurrently. Only the build carries the hard deadline;
/// exceeding it surfaces as a failed build via exit code 124.
pub async fn run_validation(
    sandbox: &dyn Sandbox,
    commands: &ValidationCommands,
    build_timeout: Duration,
) -> ValidationReport {
    let (lint, build) = tokio::join!(
        run_check(sandbox, CheckSource::Lint, &commands.lint, None),
        run_check(
            sandbox,
            CheckSource::Build,
            &commands.build,
            Some(build_timeout)
        ),
    );
    ValidationReport { lint, build }
}
