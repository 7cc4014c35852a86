//! Configuration view and validation commands: `kiln config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use kiln::config::{KilnConfig, KilnToml};

    let kiln_dir = project_dir.join(".kiln");
    let config_path = kiln_dir.join("kiln.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("kiln Configuration");
            println!("==================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No kiln.toml found at {}", config_path.display());
                println!("Using defaults. Run 'kiln config init' to create one.");
            }
            println!();

            // Effective values, including env overrides
            let config = KilnConfig::new(project_dir.to_path_buf())?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();
            println!(
                "  generation api key ({}): {}",
                config.toml.generation.api_key_env,
                if config.generation_api_key().is_some() { "set" } else { "not set" }
            );
            println!(
                "  sandbox api key ({}): {}",
                config.toml.sandbox.api_key_env,
                if config.sandbox_api_key().is_some() { "set" } else { "not set" }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = KilnConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("kiln.toml already exists at {}", config_path.display());
                return Ok(());
            }
            std::fs::create_dir_all(&kiln_dir)
                .with_context(|| format!("Failed to create {}", kiln_dir.display()))?;
            KilnToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
