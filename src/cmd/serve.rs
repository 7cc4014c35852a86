//! HTTP API server command: `kiln serve`.

use std::sync::Arc;

use anyhow::Result;

use kiln::config::KilnConfig;
use kiln::orchestrator;
use kiln::server::{ServerConfig, start_server};
use kiln::ui::ui_channel;

pub async fn cmd_serve(config: &KilnConfig, port: u16, dev: bool) -> Result<()> {
    config.ensure_directories()?;
    let orchestrator = Arc::new(orchestrator::build(config, ui_channel(), None));
    start_server(ServerConfig { port, dev_mode: dev }, orchestrator).await
}
