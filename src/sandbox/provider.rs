//! The seam between the sandbox manager and a concrete sandbox backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directories never included in file listings.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", ".next"];

/// True if any component of `path` is an excluded directory.
pub fn is_excluded(path: &str) -> bool {
    path.split('/').any(|segment| EXCLUDED_DIRS.contains(&segment))
}

/// Failures reported by a sandbox backend. The manager folds these into
/// [`SandboxError`](crate::errors::SandboxError) before they leave it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("io error: {0}")]
    Io(String),
}

impl ProviderError {
    pub fn from_io(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ProviderError::NotFound(what.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ProviderError::PermissionDenied(what.to_string())
            }
            _ => ProviderError::Io(format!("{what}: {err}")),
        }
    }
}

/// Parameters for provisioning a new sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub template: String,
    pub port: u16,
    /// How long the sandbox lives before it expires
    pub lifetime: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            template: "vite-react".to_string(),
            port: 5173,
            lifetime: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedSandbox {
    pub id: String,
    pub host_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    /// Run detached; the returned handle has no exit code
    pub background: bool,
}

impl CommandSpec {
    pub fn foreground(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            background: false,
        }
    }

    pub fn background(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            background: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHandle {
    pub id: String,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: String,
}

impl CommandHandle {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last few lines of output, for error messages.
    pub fn output_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// A sandbox backend. Paths are relative to the sandbox root and already
/// validated by the manager.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, config: &ProvisionConfig) -> Result<ProvisionedSandbox, ProviderError>;

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ProviderError>;

    async fn make_directory(&self, sandbox_id: &str, path: &str) -> Result<(), ProviderError>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, ProviderError>;

    /// Every file path in the sandbox, excluded directories left out.
    async fn list_files(&self, sandbox_id: &str) -> Result<Vec<String>, ProviderError>;

    async fn run_command(
        &self,
        sandbox_id: &str,
        spec: &CommandSpec,
    ) -> Result<CommandHandle, ProviderError>;

    async fn stop_command(&self, sandbox_id: &str, command_id: &str) -> Result<(), ProviderError>;

    async fn kill(&self, sandbox_id: &str) -> Result<(), ProviderError>;
}
