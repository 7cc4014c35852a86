//! One-shot and interactive turns: `kiln turn`, `kiln chat`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use console::style;

use kiln::config::KilnConfig;
use kiln::generate::{GenerationClient, ReplayGenerationClient};
use kiln::orchestrator::{self, GenerationOrchestrator};
use kiln::ui::{TurnReporter, UiMessage, UiMode, ui_channel};

pub struct TurnArgs {
    pub prompt: String,
    pub restore: bool,
    pub open: bool,
    pub replay: Option<PathBuf>,
    pub ui: String,
}

fn open_preview(orchestrator_url: &str) {
    let url = UiMessage::preview_href(orchestrator_url, chrono::Utc::now().timestamp_millis());
    if let Err(e) = open::that(&url) {
        eprintln!("Failed to open browser: {}", e);
    }
}

async fn active_url(orchestrator: &GenerationOrchestrator) -> Option<String> {
    orchestrator.manager().active().await.map(|s| s.base_url)
}

pub async fn cmd_turn(config: &KilnConfig, args: TurnArgs) -> Result<()> {
    config.ensure_directories()?;
    let client: Option<Arc<dyn GenerationClient>> = match &args.replay {
        Some(path) => Some(Arc::new(ReplayGenerationClient::from_file(path)?)),
        None => None,
    };

    let ui_tx = ui_channel();
    let orchestrator = orchestrator::build(config, ui_tx.clone(), client);
    let mode: UiMode = args.ui.parse().unwrap_or_default();
    let reporter = TurnReporter::new(mode, config.verbose);
    let mut rx = ui_tx.subscribe();

    if args.restore {
        reporter
            .follow(&mut rx, orchestrator.create_session(true))
            .await?;
    }
    let result = reporter
        .follow(&mut rx, orchestrator.run_turn(&args.prompt))
        .await;
    orchestrator.wait_for_saves().await;
    let outcome = result?;

    if mode != UiMode::Json {
        println!(
            "{} {} file(s) applied to {}",
            style("Done:").green().bold(),
            outcome.applied_paths.len(),
            style(&outcome.session_id).bold()
        );
    }
    if args.open
        && let Some(url) = active_url(&orchestrator).await
    {
        open_preview(&url);
    }
    Ok(())
}

pub async fn cmd_chat(config: &KilnConfig, restore: bool) -> Result<()> {
    use dialoguer::Input;

    config.ensure_directories()?;
    let ui_tx = ui_channel();
    let orchestrator = orchestrator::build(config, ui_tx.clone(), None);
    let reporter = TurnReporter::new(UiMode::Full, config.verbose);
    let mut rx = ui_tx.subscribe();

    println!();
    println!("{}", style("kiln chat").bold());
    println!(
        "{}",
        style("Describe what to build. 'reapply' re-applies the last generation, 'open' shows the preview, 'exit' quits.").dim()
    );
    println!();

    if restore
        && let Err(e) = reporter
            .follow(&mut rx, orchestrator.create_session(true))
            .await
    {
        eprintln!("{} {}", style("Restore failed:").red(), e);
    }

    loop {
        let prompt: String = Input::new()
            .with_prompt(">")
            .allow_empty(true)
            .interact_text()?;
        let prompt = prompt.trim();
        match prompt {
            "" => continue,
            "exit" | "quit" => break,
            "open" => {
                match active_url(&orchestrator).await {
                    Some(url) => open_preview(&url),
                    None => println!("{}", style("No sandbox yet.").dim()),
                }
                continue;
            }
            "reapply" => {
                let _ = reporter.follow(&mut rx, orchestrator.reapply_last()).await;
                continue;
            }
            _ => {}
        }
        // Failures are already rendered by the reporter.
        let _ = reporter.follow(&mut rx, orchestrator.run_turn(prompt)).await;
    }

    orchestrator.wait_for_saves().await;
    orchestrator.manager().shutdown().await;
    Ok(())
}
