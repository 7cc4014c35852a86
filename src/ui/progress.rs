use std::future::Future;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use super::icons::{
    CHECK, CROSS, FILE_CUT, FILE_NEW, PACKAGE, PREVIEW, SANDBOX, SPARKLE, THINKING, WARN,
};
use super::messages::UiMessage;
use crate::apply::RunStatus;
use crate::context::Role;

/// Output mode for the terminal reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Spinner plus one line per file and notable event
    #[default]
    Full,
    /// Notable events only, no spinner
    Minimal,
    /// Every UiMessage as a JSON line on stdout
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

/// Renders the UI channel of a turn on the terminal.
///
/// Text goes through the spinner's `println` so it never tears the bar; if
/// the terminal is gone it falls back to `eprintln!`.
pub struct TurnReporter {
    mode: UiMode,
    verbose: bool,
    spinner: Option<ProgressBar>,
}

impl TurnReporter {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let spinner = (mode == UiMode::Full).then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {msg}")
                    .expect("progress bar template is a valid static string"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        Self {
            mode,
            verbose,
            spinner,
        }
    }

    /// Drive `fut` to completion while rendering everything arriving on `rx`,
    /// then render whatever is still queued.
    pub async fn follow<F: Future>(&self, rx: &mut broadcast::Receiver<String>, fut: F) -> F::Output {
        tokio::pin!(fut);
        let output = loop {
            tokio::select! {
                output = &mut fut => break output,
                received = rx.recv() => match received {
                    Ok(json) => self.render_json(&json),
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "reporter lagged behind"),
                    Err(RecvError::Closed) => break fut.await,
                },
            }
        };
        loop {
            match rx.try_recv() {
                Ok(json) => self.render_json(&json),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        output
    }

    pub fn render_json(&self, json: &str) {
        if self.mode == UiMode::Json {
            println!("{json}");
            return;
        }
        match serde_json::from_str::<UiMessage>(json) {
            Ok(message) => self.render(&message),
            Err(e) => debug!(error = %e, "unreadable ui message"),
        }
    }

    pub fn render(&self, message: &UiMessage) {
        match message {
            UiMessage::Status { message } => self.set_status(message),
            UiMessage::Thinking { delta } => {
                if self.verbose {
                    self.print_line(format!("  {} {}", THINKING, style(delta.trim()).dim()));
                }
            }
            UiMessage::Narration { text } => {
                if self.verbose && !text.trim().is_empty() {
                    self.print_line(format!("  {}", style(text.trim()).dim()));
                }
            }
            UiMessage::FileStreaming { path } => self.set_status(&format!("Writing {path}")),
            UiMessage::FileReady {
                path,
                size_bytes,
                truncated,
            } => {
                let icon = if *truncated { FILE_CUT } else { FILE_NEW };
                let suffix = if *truncated {
                    style(" (cut off)".to_string()).red()
                } else {
                    style(format!(" ({size_bytes} bytes)")).dim()
                };
                self.print_line(format!("  {}{}{}", icon, style(path).green(), suffix));
            }
            UiMessage::PackageRequested { name } => {
                self.print_line(format!("  {}{}", PACKAGE, style(name).cyan()));
            }
            UiMessage::SandboxCreated { session } => {
                self.print_line(format!(
                    "{}Sandbox {} at {}",
                    SANDBOX,
                    style(&session.id).bold(),
                    style(&session.base_url).underlined()
                ));
            }
            UiMessage::SessionReplaced { previous, current } => {
                self.print_line(format!(
                    "{}Sandbox {} replaced by {}",
                    WARN,
                    style(previous).dim(),
                    style(current).bold()
                ));
            }
            UiMessage::RunProgress { snapshot } => {
                self.set_status(&format!(
                    "{} ({} applied)",
                    snapshot.stage.as_str(),
                    snapshot.applied_paths.len()
                ));
            }
            UiMessage::PreviewReady { url, token, .. } => {
                self.print_line(format!(
                    "{}Preview: {}",
                    PREVIEW,
                    style(UiMessage::preview_href(url, *token)).underlined()
                ));
            }
            UiMessage::Chat { role, text } => match role {
                Role::Error => self.print_line(format!("{}{}", CROSS, style(text).red())),
                Role::User => {}
                Role::Assistant | Role::System => self.print_line(text),
            },
            UiMessage::TurnCompleted {
                status,
                summary,
                failed_paths,
                warnings,
                ..
            } => {
                for (path, reason) in failed_paths {
                    self.print_line(format!("  {}{}: {}", CROSS, style(path).red(), reason));
                }
                for warning in warnings {
                    self.print_line(format!("  {}{}", WARN, style(warning).yellow()));
                }
                let icon = match status {
                    RunStatus::Succeeded => CHECK,
                    RunStatus::NoChanges => SPARKLE,
                    RunStatus::Partial | RunStatus::Failed => WARN,
                };
                self.finish(format!("{}{}", icon, summary));
            }
            UiMessage::TurnFailed { error } => {
                self.finish(format!("{}{}", CROSS, style(error).red().bold()));
            }
        }
    }

    fn set_status(&self, text: &str) {
        match &self.spinner {
            Some(bar) => bar.set_message(text.to_string()),
            None => {
                if self.verbose {
                    self.print_line(format!("  {}", style(text).dim()));
                }
            }
        }
    }

    fn finish(&self, line: String) {
        if let Some(bar) = &self.spinner {
            bar.set_message(String::new());
        }
        self.print_line(line);
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        match &self.spinner {
            Some(bar) => bar.println(msg.as_ref()),
            None => eprintln!("{}", msg.as_ref()),
        }
    }
}

impl Drop for TurnReporter {
    fn drop(&mut self) {
        if let Some(bar) = &self.spinner {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::{broadcast_message, ui_channel};

    #[test]
    fn test_ui_mode_from_str() {
        assert_eq!("json".parse::<UiMode>().unwrap(), UiMode::Json);
        assert_eq!("MINIMAL".parse::<UiMode>().unwrap(), UiMode::Minimal);
        assert_eq!("anything".parse::<UiMode>().unwrap(), UiMode::Full);
    }

    #[tokio::test]
    async fn test_follow_returns_future_output_and_drains() {
        let tx = ui_channel();
        let mut rx = tx.subscribe();
        let reporter = TurnReporter::new(UiMode::Minimal, false);

        let sender = tx.clone();
        let output = reporter
            .follow(&mut rx, async move {
                broadcast_message(&sender, &UiMessage::Status { message: "one".into() });
                broadcast_message(
                    &sender,
                    &UiMessage::TurnFailed {
                        error: "boom".into(),
                    },
                );
                42
            })
            .await;
        assert_eq!(output, 42);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_render_tolerates_garbage() {
        let reporter = TurnReporter::new(UiMode::Minimal, true);
        reporter.render_json("not json");
        reporter.render_json("{\"type\":\"Status\",\"data\":{\"message\":\"hi\"}}");
    }
}
