//! Typed error hierarchy for kiln.
//!
//! Three top-level enums cover the three layers a turn passes through:
//! - `SandboxError`: session lifecycle, file operations and application runs
//! - `GenerationError`: the stream from the generation service
//! - `TurnError`: a whole user turn, as surfaced to the chat

use std::time::Duration;

use thiserror::Error;

/// Errors from the sandbox manager and the application engine.
///
/// Provider failures never appear here in their native shape: the manager
/// folds them into `Provision` or `Io` with the provider's message as `cause`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox: {reason}")]
    Provision { reason: String },

    #[error("I/O error on {path}: {cause}")]
    Io { path: String, cause: String },

    #[error("Sandbox {session_id} has expired")]
    SessionExpired { session_id: String },

    #[error("Sandbox {expected} is no longer active (active: {})", .active.as_deref().unwrap_or("none"))]
    StaleSession {
        expected: String,
        active: Option<String>,
    },

    #[error("No active sandbox")]
    NoActiveSession,

    #[error("Timed out during {stage}")]
    Timeout { stage: String },

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
}

impl SandboxError {
    /// True when the target session is gone. Retrying in place cannot
    /// succeed; only an expiry may be retargeted at a replacement.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            SandboxError::SessionExpired { .. }
                | SandboxError::StaleSession { .. }
                | SandboxError::NoActiveSession
        )
    }

    pub fn io(path: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        SandboxError::Io {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    pub fn timeout(stage: impl Into<String>) -> Self {
        SandboxError::Timeout {
            stage: stage.into(),
        }
    }
}

/// Errors from the generation service stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    #[error("Generation transport error: {0}")]
    Transport(String),

    #[error("Generation service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Generation stream was idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("Generation service reported an error: {0}")]
    Service(String),
}

/// Errors that fail a whole turn.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Instruction is empty")]
    EmptyPrompt,

    #[error("Could not prepare sandbox: {0}")]
    Sandbox(#[source] SandboxError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("Applying files failed: {0}")]
    Apply(#[source] SandboxError),

    #[error("No files were applied ({failed} failed)")]
    NothingApplied { failed: usize },

    #[error("Changes discarded because the sandbox changed during the turn: {0}")]
    Discarded(#[source] SandboxError),

    #[error("There is no generation to reapply")]
    NothingToReapply,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_error_io_carries_path() {
        let err = SandboxError::io("src/App.jsx", "permission denied");
        match &err {
            SandboxError::Io { path, cause } => {
                assert_eq!(path, "src/App.jsx");
                assert_eq!(cause, "permission denied");
            }
            _ => panic!("Expected Io"),
        }
        assert!(err.to_string().contains("src/App.jsx"));
    }

    #[test]
    fn stale_session_message_names_both_sessions() {
        let err = SandboxError::StaleSession {
            expected: "sbx-1".into(),
            active: Some("sbx-2".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("sbx-1"));
        assert!(msg.contains("sbx-2"));

        let err = SandboxError::StaleSession {
            expected: "sbx-1".into(),
            active: None,
        };
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn session_lost_covers_expiry_and_staleness_only() {
        assert!(
            SandboxError::SessionExpired {
                session_id: "a".into()
            }
            .is_session_lost()
        );
        assert!(
            SandboxError::StaleSession {
                expected: "a".into(),
                active: None
            }
            .is_session_lost()
        );
        assert!(SandboxError::NoActiveSession.is_session_lost());
        assert!(!SandboxError::io("a.js", "denied").is_session_lost());
        assert!(!SandboxError::timeout("writing").is_session_lost());
    }

    #[test]
    fn timeout_names_the_stage() {
        let err = SandboxError::timeout("installing");
        assert_eq!(err.to_string(), "Timed out during installing");
    }

    #[test]
    fn turn_error_converts_from_generation_error() {
        let err: TurnError = GenerationError::Transport("connection reset".into()).into();
        match &err {
            TurnError::Generation(GenerationError::Transport(msg)) => {
                assert_eq!(msg, "connection reset");
            }
            _ => panic!("Expected TurnError::Generation(Transport)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SandboxError::NoActiveSession);
        assert_std_error(&GenerationError::Service("x".into()));
        assert_std_error(&TurnError::EmptyPrompt);
    }
}
