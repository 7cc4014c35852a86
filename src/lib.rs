pub mod apply;
pub mod config;
pub mod context;
pub mod errors;
pub mod generate;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod telemetry;
pub mod ui;
