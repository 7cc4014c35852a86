//! Turn orchestration and project persistence.

pub mod runner;
pub mod store;

use std::sync::Arc;

use tokio::sync::broadcast;

pub use runner::{GenerationOrchestrator, TurnOutcome, is_package_check};
pub use store::{JsonFileStore, ProjectSnapshot, ProjectStore};

use crate::apply::ApplicationEngine;
use crate::config::KilnConfig;
use crate::context::ConversationContext;
use crate::generate::{GenerationClient, HttpGenerationClient};
use crate::sandbox::{SandboxManager, provider_from_config};

/// Wire an orchestrator from configuration. `client` replaces the HTTP
/// generation client when given.
pub fn build(
    config: &KilnConfig,
    ui_tx: broadcast::Sender<String>,
    client: Option<Arc<dyn GenerationClient>>,
) -> GenerationOrchestrator {
    let settings = config.generation_settings();
    let client = client.unwrap_or_else(|| {
        Arc::new(HttpGenerationClient::new(
            settings.endpoint.clone(),
            settings.api_key.clone(),
        ))
    });
    let manager = Arc::new(SandboxManager::new(
        provider_from_config(config),
        config.manager_settings(),
    ));
    let engine = ApplicationEngine::new(manager, config.engine_settings(), ui_tx.clone());
    let context = ConversationContext::new(config.toml.context.max_turns);

    GenerationOrchestrator::new(client, engine, settings, context, ui_tx).with_store(
        Arc::new(JsonFileStore::new(config.store_dir())),
        config.project_id(),
    )
}
