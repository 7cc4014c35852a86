//! Sandbox sessions: the provider seam, the session manager and the
//! concrete providers.

pub mod http;
pub mod local;
pub mod manager;
pub mod memory;
pub mod provider;
pub mod session;
pub mod template;

use std::sync::Arc;

pub use http::HttpSandboxProvider;
pub use local::LocalSandboxProvider;
pub use manager::{ManagerSettings, SandboxManager, is_valid_package_name};
pub use memory::MemorySandboxProvider;
pub use provider::{
    CommandHandle, CommandSpec, ProviderError, ProvisionConfig, ProvisionedSandbox,
    SandboxProvider,
};
pub use session::{SandboxSession, SessionState};

use crate::config::{KilnConfig, ProviderKind};

/// Build the provider selected in the configuration.
pub fn provider_from_config(config: &KilnConfig) -> Arc<dyn SandboxProvider> {
    match config.toml.sandbox.provider {
        ProviderKind::Local => Arc::new(LocalSandboxProvider::new(config.sandbox_root())),
        ProviderKind::Http => Arc::new(HttpSandboxProvider::new(
            config.toml.sandbox.api_url.clone(),
            config.sandbox_api_key(),
        )),
        ProviderKind::Memory => Arc::new(MemorySandboxProvider::new()),
    }
}
