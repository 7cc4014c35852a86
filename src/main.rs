use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kiln::config::{KilnConfig, ProviderKind};
use kiln::telemetry::{self, TelemetryConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "Generate code from natural language and apply it live to a sandbox")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Sandbox provider: local, http, memory. Overrides kiln.toml.
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one instruction against the sandbox
    Turn {
        prompt: String,

        /// Provision a fresh sandbox from the last saved project first
        #[arg(long)]
        restore: bool,

        /// Open the preview in a browser afterwards
        #[arg(long)]
        open: bool,

        /// Replay a recorded generation stream instead of calling the service
        #[arg(long)]
        replay: Option<PathBuf>,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Interactive loop of turns
    Chat {
        /// Provision a fresh sandbox from the last saved project first
        #[arg(long)]
        restore: bool,
    },
    /// Serve the HTTP API and live progress WebSocket
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value = "3141")]
        port: u16,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Print the protocol events found in a recorded stream or raw output
    Parse {
        file: PathBuf,

        /// Feed the parser this many bytes at a time (0 = all at once)
        #[arg(long, default_value = "0")]
        chunk_size: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default kiln.toml file
    Init,
}

fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<KilnConfig> {
    let provider = cli
        .provider
        .as_deref()
        .map(str::parse::<ProviderKind>)
        .transpose()?;
    KilnConfig::with_cli_args(project_dir, cli.verbose, provider, cli.log_json)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Parse { file, chunk_size } => {
            let _telemetry = telemetry::init(TelemetryConfig {
                verbose: cli.verbose,
                json: cli.log_json,
                log_dir: None,
            });
            cmd::cmd_parse(file, *chunk_size)?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, command.clone())?;
        }
        command => {
            let config = load_config(&cli, project_dir)?;
            let _telemetry = telemetry::init(TelemetryConfig {
                verbose: config.verbose,
                json: config.toml.logging.json,
                log_dir: config.log_dir(),
            });
            for warning in config.validate() {
                tracing::warn!(%warning, "configuration");
            }

            match command {
                Commands::Turn {
                    prompt,
                    restore,
                    open,
                    replay,
                    ui,
                } => {
                    cmd::cmd_turn(
                        &config,
                        cmd::TurnArgs {
                            prompt: prompt.clone(),
                            restore: *restore,
                            open: *open,
                            replay: replay.clone(),
                            ui: ui.clone(),
                        },
                    )
                    .await?;
                }
                Commands::Chat { restore } => cmd::cmd_chat(&config, *restore).await?,
                Commands::Serve { port, dev } => cmd::cmd_serve(&config, *port, *dev).await?,
                Commands::Parse { .. } | Commands::Config { .. } => {}
            }
        }
    }

    Ok(())
}
