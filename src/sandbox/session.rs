use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a sandbox session. `Expired`, `Replaced` and `Killed` are
/// terminal; a session never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Provisioning,
    Running,
    Expired,
    Replaced,
    Killed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Provisioning => "provisioning",
            SessionState::Running => "running",
            SessionState::Expired => "expired",
            SessionState::Replaced => "replaced",
            SessionState::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Expired | SessionState::Replaced | SessionState::Killed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a session state transition.
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (SessionState::Provisioning, SessionState::Running)
            | (SessionState::Provisioning, SessionState::Killed)
            | (SessionState::Running, SessionState::Expired)
            | (SessionState::Running, SessionState::Replaced)
            | (SessionState::Running, SessionState::Killed)
    )
}

/// Snapshot of one sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: String,
    /// Where the sandbox's dev server is reachable
    pub base_url: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    /// Paths written through the manager during this session
    pub known_files: BTreeSet<String>,
}

impl SandboxSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.timeout_at
    }

    /// Move to `to`, refusing anything the lifecycle does not allow.
    pub fn transition(&mut self, to: SessionState) -> Result<(), InvalidSessionTransition> {
        if !is_valid_transition(self.state, to) {
            return Err(InvalidSessionTransition {
                session_id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Sandbox {session_id} cannot move from {from} to {to}")]
pub struct InvalidSessionTransition {
    pub session_id: String,
    pub from: SessionState,
    pub to: SessionState,
}
