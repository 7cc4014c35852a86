//! Applies a batch of artifacts to a sandbox session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::run::{ApplicationRun, ApplyBatch, InstallOutcome, RunStage, dedup_artifacts};
use crate::errors::SandboxError;
use crate::paths::{file_name, parent_dir};
use crate::protocol::FileArtifact;
use crate::sandbox::SandboxManager;
use crate::ui::{UiMessage, broadcast_message};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// File names that make a batch need a dependency install
    pub manifest_files: Vec<String>,
    pub run_timeout: Duration,
    pub restart_after_install: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            manifest_files: vec!["package.json".to_string()],
            run_timeout: Duration::from_secs(600),
            restart_after_install: true,
        }
    }
}

pub struct ApplicationEngine {
    manager: Arc<SandboxManager>,
    settings: EngineSettings,
    ui_tx: broadcast::Sender<String>,
}

impl ApplicationEngine {
    pub fn new(
        manager: Arc<SandboxManager>,
        settings: EngineSettings,
        ui_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            manager,
            settings,
            ui_tx,
        }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    fn is_manifest(&self, path: &str) -> bool {
        let name = file_name(path);
        self.settings.manifest_files.iter().any(|m| m == name)
    }

    /// Apply `batch` to `session_id`.
    ///
    /// Holds the manager's run lock for the whole run. Per-file failures are
    /// recorded on the returned run; losing the session or running past the
    /// run deadline aborts with an error.
    pub async fn apply(
        &self,
        session_id: &str,
        batch: ApplyBatch,
    ) -> Result<ApplicationRun, SandboxError> {
        let _run_lock = self.manager.acquire_run_lock().await;
        let mut run = ApplicationRun::new(session_id);
        info!(
            run_id = %run.id,
            sandbox_id = %session_id,
            artifacts = batch.artifacts.len(),
            packages = batch.packages.len(),
            "starting application run"
        );

        let outcome =
            tokio::time::timeout(self.settings.run_timeout, self.execute(&mut run, batch)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(SandboxError::timeout(run.stage.as_str())),
        };

        match result {
            Ok(()) => {
                self.advance(&mut run, RunStage::Complete);
                info!(
                    run_id = %run.id,
                    applied = run.applied_paths.len(),
                    failed = run.failed_paths.len(),
                    status = ?run.status(),
                    "application run finished"
                );
                Ok(run)
            }
            Err(e) => {
                warn!(run_id = %run.id, stage = run.stage.as_str(), error = %e, "application run failed");
                run.fail(e.to_string());
                self.emit_progress(&run);
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &mut ApplicationRun, batch: ApplyBatch) -> Result<(), SandboxError> {
        let session_id = run.session_id.clone();
        self.advance(run, RunStage::Analyzing);
        let session = self.manager.ensure_current(&session_id).await?;

        let artifacts = dedup_artifacts(batch.artifacts);
        let (manifests, sources): (Vec<FileArtifact>, Vec<FileArtifact>) = artifacts
            .into_iter()
            .partition(|a| self.is_manifest(&a.path));
        let needs_install = !manifests.is_empty() || !batch.packages.is_empty();
        debug!(
            run_id = %run.id,
            manifests = manifests.len(),
            sources = sources.len(),
            needs_install,
            "analyzed batch"
        );
        if manifests.is_empty() && sources.is_empty() && !needs_install {
            return Ok(());
        }

        let mut created_dirs = HashSet::new();
        let mut installed = false;
        if needs_install {
            self.advance(run, RunStage::Installing);
            for manifest in &manifests {
                self.write_one(run, manifest, &mut created_dirs).await?;
            }
            let manifest_paths: Vec<String> = manifests.iter().map(|m| m.path.clone()).collect();
            match self
                .manager
                .install_dependencies(&session_id, &batch.packages)
                .await
            {
                Ok(_) => {
                    installed = true;
                    run.install = Some(InstallOutcome {
                        packages: batch.packages.clone(),
                        manifests: manifest_paths,
                        succeeded: true,
                        error: None,
                    });
                }
                Err(e) if e.is_session_lost() => return Err(e),
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "dependency install failed, continuing");
                    run.warnings.push(format!("Dependency install failed: {e}"));
                    run.install = Some(InstallOutcome {
                        packages: batch.packages.clone(),
                        manifests: manifest_paths,
                        succeeded: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        self.advance(run, RunStage::Writing);
        for artifact in &sources {
            self.write_one(run, artifact, &mut created_dirs).await?;
        }

        if run.applied_paths.is_empty() {
            return Ok(());
        }

        self.advance(run, RunStage::Restarting);
        if installed && self.settings.restart_after_install {
            match self.manager.restart_process(&session_id).await {
                Ok(_) => {}
                Err(e) if e.is_session_lost() => return Err(e),
                Err(e) => run.warnings.push(format!("Restart failed: {e}")),
            }
        }
        match self.manager.wait_ready(&session_id).await {
            Ok(()) => {
                broadcast_message(
                    &self.ui_tx,
                    &UiMessage::PreviewReady {
                        session_id: session_id.clone(),
                        url: session.base_url.clone(),
                        token: Utc::now().timestamp_millis(),
                    },
                );
            }
            Err(e) if e.is_session_lost() => return Err(e),
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "preview did not become ready");
                run.warnings.push(format!("Preview not ready: {e}"));
            }
        }
        Ok(())
    }

    /// Write one artifact, creating its parent directory once per run.
    /// The manager re-checks the session before every operation.
    async fn write_one(
        &self,
        run: &mut ApplicationRun,
        artifact: &FileArtifact,
        created_dirs: &mut HashSet<String>,
    ) -> Result<(), SandboxError> {
        let session_id = run.session_id.clone();
        if let Some(dir) = parent_dir(&artifact.path)
            && created_dirs.insert(dir.to_string())
        {
            match self.manager.make_directory(&session_id, dir).await {
                Ok(()) => {}
                Err(e) if e.is_session_lost() => return Err(e),
                Err(e) => {
                    warn!(run_id = %run.id, path = %artifact.path, error = %e, "creating parent directory failed");
                    created_dirs.remove(dir);
                    run.failed_paths.insert(artifact.path.clone(), e.to_string());
                    return Ok(());
                }
            }
        }

        match self
            .manager
            .write_file(&session_id, &artifact.path, &artifact.content)
            .await
        {
            Ok(()) => {
                run.failed_paths.remove(&artifact.path);
                run.applied_paths.push(artifact.path.clone());
                if artifact.truncated {
                    run.warnings.push(format!(
                        "{} was cut off mid-stream; partial content applied",
                        artifact.path
                    ));
                }
                Ok(())
            }
            Err(e) if e.is_session_lost() => Err(e),
            Err(e) => {
                warn!(run_id = %run.id, path = %artifact.path, error = %e, "write failed");
                run.failed_paths.insert(artifact.path.clone(), e.to_string());
                Ok(())
            }
        }
    }

    fn advance(&self, run: &mut ApplicationRun, next: RunStage) {
        match run.advance(next) {
            Ok(()) => {
                debug!(run_id = %run.id, stage = run.stage.as_str(), "run stage changed");
                self.emit_progress(run);
            }
            Err(e) => warn!(run_id = %run.id, error = %e, "ignoring stage change"),
        }
    }

    fn emit_progress(&self, run: &ApplicationRun) {
        broadcast_message(
            &self.ui_tx,
            &UiMessage::RunProgress {
                snapshot: run.snapshot(),
            },
        );
    }
}
