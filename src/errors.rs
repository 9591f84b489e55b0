//! Typed error hierarchy for the kiln orchestrator.
//!
//! Two top-level enums cover the two subsystems:
//! - `SandboxError` — sandbox provisioning, resume, and execution failures
//! - `StudioError` — run/fix/transfer pipeline failures
//!
//! Only sandbox creation and sandbox resume are fatal to a run. Every other
//! failure kind (classification, validation mismatch, agent-reported errors,
//! exhausted fix budget, secondary generation) is captured into run state and
//! resolved into the final `is_error` flag instead of propagating.

use thiserror::Error;

/// Errors from the sandbox lifecycle manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox template '{template}' not found")]
    TemplateNotFound { template: String },

    #[error("Failed to provision sandbox: {source}")]
    CreationFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Sandbox {id} is dead or expired; a fresh run is required")]
    Expired { id: String },

    #[error("Failed to execute command in sandbox {id}: {source}")]
    CommandFailed {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the run/fix/transfer pipeline.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Fragment {id} not found")]
    FragmentNotFound { id: i64 },

    #[error("Sandbox creation failed: {0}")]
    SandboxCreation(#[source] SandboxError),

    #[error("Sandbox resume failed: {0}")]
    SandboxResume(#[source] SandboxError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_error_expired_carries_id() {
        let err = SandboxError::Expired {
            id: "sb-abc123".to_string(),
        };
        match &err {
            SandboxError::Expired { id } => assert_eq!(id, "sb-abc123"),
            _ => panic!("Expected Expired variant"),
        }
        assert!(err.to_string().contains("sb-abc123"));
    }

    #[test]
    fn sandbox_error_template_not_found_names_template() {
        let err = SandboxError::TemplateNotFound {
            template: "kiln-vue".to_string(),
        };
        assert!(err.to_string().contains("kiln-vue"));
    }

    #[test]
    fn studio_error_wraps_resume_failure() {
        let inner = SandboxError::Expired {
            id: "sb-1".to_string(),
        };
        let err = StudioError::SandboxResume(inner);
        assert!(matches!(
            err,
            StudioError::SandboxResume(SandboxError::Expired { .. })
        ));
    }

    #[test]
    fn studio_error_fragment_not_found_carries_id() {
        let err = StudioError::FragmentNotFound { id: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let sandbox_err = SandboxError::Expired { id: "x".into() };
        assert_std_error(&sandbox_err);
        let studio_err = StudioError::ProjectNotFound { id: 1 };
        assert_std_error(&studio_err);
    }
}
