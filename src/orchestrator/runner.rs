use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::ProjectStore;
use crate::apply::{ApplicationEngine, ApplicationRun, ApplyBatch, RunStatus};
use crate::context::{ConversationContext, Role};
use crate::errors::{GenerationError, SandboxError, TurnError};
use crate::generate::{
    GenerationClient, GenerationRequest, GenerationSettings, GenerationStream, RecentTurn,
    RequestContext, bounded_listing,
};
use crate::protocol::{EventAssembler, FileArtifact, ProtocolEvent};
use crate::sandbox::{SandboxManager, SandboxSession};
use crate::ui::{UiMessage, broadcast_message};

/// Instructions that skip generation and reinstall dependencies instead.
const PACKAGE_CHECK_PROMPTS: [&str; 2] = ["check packages", "npm install"];

pub fn is_package_check(prompt: &str) -> bool {
    let prompt = prompt.trim();
    PACKAGE_CHECK_PROMPTS
        .iter()
        .any(|p| prompt.eq_ignore_ascii_case(p))
}

/// Result of one successful turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub session_id: String,
    pub status: RunStatus,
    pub summary: String,
    /// Narration streamed around the files
    pub narration: String,
    pub applied_paths: Vec<String>,
    pub failed_paths: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    pub run: Option<ApplicationRun>,
}

/// What a generation stream produced.
#[derive(Debug, Default)]
struct StreamHarvest {
    artifacts: Vec<FileArtifact>,
    packages: Vec<String>,
    summary: String,
    narration: String,
    errors: Vec<String>,
}

impl StreamHarvest {
    fn absorb(&mut self, event: &ProtocolEvent) {
        match event {
            ProtocolEvent::FileClose {
                path,
                content,
                truncated,
            } => self
                .artifacts
                .push(FileArtifact::new(path.clone(), content.clone()).with_truncated(*truncated)),
            ProtocolEvent::Package { name } => {
                if !self.packages.contains(name) {
                    self.packages.push(name.clone());
                }
            }
            ProtocolEvent::Narration { text } => self.narration.push_str(text),
            ProtocolEvent::Complete { summary } => self.summary = summary.clone(),
            ProtocolEvent::Error { message } => self.errors.push(message.clone()),
            ProtocolEvent::Status { .. }
            | ProtocolEvent::Thinking { .. }
            | ProtocolEvent::FileOpen { .. }
            | ProtocolEvent::FileChunk { .. } => {}
        }
    }
}

/// Drives turns: session upkeep, the generation stream, and the hand-off to
/// the application engine.
pub struct GenerationOrchestrator {
    client: Arc<dyn GenerationClient>,
    engine: ApplicationEngine,
    manager: Arc<SandboxManager>,
    settings: GenerationSettings,
    context: Mutex<ConversationContext>,
    store: Option<Arc<dyn ProjectStore>>,
    project_id: String,
    ui_tx: broadcast::Sender<String>,
    turn_lock: Mutex<()>,
    pending_save: Mutex<Option<JoinHandle<()>>>,
    /// Batch of the last turn that generated anything
    last_batch: Mutex<Option<ApplyBatch>>,
}

impl GenerationOrchestrator {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        engine: ApplicationEngine,
        settings: GenerationSettings,
        context: ConversationContext,
        ui_tx: broadcast::Sender<String>,
    ) -> Self {
        let manager = engine.manager().clone();
        Self {
            client,
            engine,
            manager,
            settings,
            context: Mutex::new(context),
            store: None,
            project_id: "default".to_string(),
            ui_tx,
            turn_lock: Mutex::new(()),
            pending_save: Mutex::new(None),
            last_batch: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProjectStore>, project_id: impl Into<String>) -> Self {
        self.store = Some(store);
        self.project_id = project_id.into();
        self
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    pub fn ui_sender(&self) -> &broadcast::Sender<String> {
        &self.ui_tx
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub async fn context(&self) -> ConversationContext {
        self.context.lock().await.clone()
    }

    /// Wait for the last background project save, if one is in flight.
    pub async fn wait_for_saves(&self) {
        let handle = self.pending_save.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "project save task panicked");
        }
    }

    /// Provision a new session and start its dev server, replacing the active
    /// one. With `restore`, the last saved project is loaded into it.
    pub async fn create_session(&self, restore: bool) -> Result<SandboxSession, TurnError> {
        let previous = self.manager.active().await.map(|s| s.id);
        let mut warnings = Vec::new();
        self.provision(previous, restore, &mut warnings).await
    }

    /// Run one turn end to end.
    ///
    /// Every failure is also recorded in the context and broadcast as
    /// `TurnFailed`; the session is only replaced when it expired.
    pub async fn run_turn(&self, prompt: &str) -> Result<TurnOutcome, TurnError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(TurnError::EmptyPrompt);
        }
        let _turn = self.turn_lock.lock().await;
        info!(prompt_len = prompt.len(), "starting turn");
        broadcast_message(
            &self.ui_tx,
            &UiMessage::Chat {
                role: Role::User,
                text: prompt.to_string(),
            },
        );

        let result = if is_package_check(prompt) {
            self.context.lock().await.record_user(prompt);
            self.check_packages().await
        } else {
            self.generate_and_apply(prompt).await
        };
        self.conclude(result).await
    }

    /// Apply the last generated batch again, to the active session or a
    /// fresh one. Nothing is generated.
    pub async fn reapply_last(&self) -> Result<TurnOutcome, TurnError> {
        let _turn = self.turn_lock.lock().await;
        info!("reapplying last generation");
        let result = self.reapply().await;
        self.conclude(result).await
    }

    /// Log, record and broadcast how a turn ended.
    async fn conclude(
        &self,
        result: Result<TurnOutcome, TurnError>,
    ) -> Result<TurnOutcome, TurnError> {
        match result {
            Ok(outcome) => {
                info!(
                    sandbox_id = %outcome.session_id,
                    status = ?outcome.status,
                    applied = outcome.applied_paths.len(),
                    "turn finished"
                );
                broadcast_message(
                    &self.ui_tx,
                    &UiMessage::TurnCompleted {
                        status: outcome.status,
                        summary: outcome.summary.clone(),
                        applied_paths: outcome.applied_paths.clone(),
                        failed_paths: outcome.failed_paths.clone(),
                        warnings: outcome.warnings.clone(),
                    },
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "turn failed");
                self.context.lock().await.record_error(e.to_string());
                broadcast_message(
                    &self.ui_tx,
                    &UiMessage::TurnFailed {
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    async fn check_packages(&self) -> Result<TurnOutcome, TurnError> {
        let session = self
            .manager
            .active()
            .await
            .ok_or(TurnError::Sandbox(SandboxError::NoActiveSession))?;
        self.manager
            .install_dependencies(&session.id, &[])
            .await
            .map_err(TurnError::Sandbox)?;
        let summary = "Dependencies installed".to_string();
        self.context.lock().await.record_system(summary.clone());
        Ok(TurnOutcome {
            session_id: session.id,
            status: RunStatus::Succeeded,
            summary,
            narration: String::new(),
            applied_paths: Vec::new(),
            failed_paths: BTreeMap::new(),
            warnings: Vec::new(),
            run: None,
        })
    }

    async fn generate_and_apply(&self, prompt: &str) -> Result<TurnOutcome, TurnError> {
        let mut warnings = Vec::new();
        let session = self.ensure_session(&mut warnings).await?;

        let request = self.build_request(prompt, &session, &mut warnings).await;
        self.context.lock().await.record_user(prompt);

        let harvest = self.stream(&request).await?;
        for error in &harvest.errors {
            warnings.push(format!("Generation: {error}"));
        }
        let batch = ApplyBatch::new(harvest.artifacts).with_packages(harvest.packages);
        if batch.is_empty() {
            if !harvest.errors.is_empty() {
                return Err(GenerationError::Service(harvest.errors.join("; ")).into());
            }
            let summary = non_empty_or(&harvest.summary, &harvest.narration, "No changes");
            self.context
                .lock()
                .await
                .record_assistant(summary.clone(), Vec::new());
            return Ok(TurnOutcome {
                session_id: session.id,
                status: RunStatus::NoChanges,
                summary,
                narration: harvest.narration,
                applied_paths: Vec::new(),
                failed_paths: BTreeMap::new(),
                warnings,
                run: None,
            });
        }

        *self.last_batch.lock().await = Some(batch.clone());
        let run = self.apply_with_retry(&session, batch, &mut warnings).await?;
        self.finish_run(run, &harvest.summary, harvest.narration, warnings)
            .await
    }

    async fn reapply(&self) -> Result<TurnOutcome, TurnError> {
        let batch = self
            .last_batch
            .lock()
            .await
            .clone()
            .ok_or(TurnError::NothingToReapply)?;
        let mut warnings = Vec::new();
        let session = self.ensure_session(&mut warnings).await?;
        let run = self.apply_with_retry(&session, batch, &mut warnings).await?;
        let summary = format!("Reapplied {} file(s)", run.applied_paths.len());
        self.finish_run(run, &summary, String::new(), warnings).await
    }

    /// Turn a finished run into the turn's outcome: record it, save the
    /// project and collect warnings.
    async fn finish_run(
        &self,
        run: ApplicationRun,
        summary: &str,
        narration: String,
        mut warnings: Vec<String>,
    ) -> Result<TurnOutcome, TurnError> {
        warnings.extend(run.warnings.iter().cloned());
        if run.status() == RunStatus::Failed {
            return Err(TurnError::NothingApplied {
                failed: run.failed_paths.len(),
            });
        }

        let fallback = format!("Applied {} file(s)", run.applied_paths.len());
        let summary = non_empty_or(summary, &narration, &fallback);
        self.context
            .lock()
            .await
            .record_assistant(summary.clone(), run.applied_paths.clone());
        self.spawn_save(&run).await;

        Ok(TurnOutcome {
            session_id: run.session_id.clone(),
            status: run.status(),
            summary,
            narration,
            applied_paths: run.applied_paths.clone(),
            failed_paths: run.failed_paths.clone(),
            warnings,
            run: Some(run),
        })
    }

    /// The active session, or a freshly provisioned one when there is none or
    /// it has expired.
    async fn ensure_session(&self, warnings: &mut Vec<String>) -> Result<SandboxSession, TurnError> {
        let mut previous = None;
        if let Some(active) = self.manager.active().await {
            match self.manager.ensure_current(&active.id).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_session_lost() => {
                    debug!(sandbox_id = %active.id, error = %e, "active sandbox unusable");
                    previous = Some(active.id);
                }
                Err(e) => return Err(TurnError::Sandbox(e)),
            }
        }
        let restore = self.context.lock().await.is_edit();
        self.provision(previous, restore, warnings).await
    }

    async fn provision(
        &self,
        previous: Option<String>,
        restore: bool,
        warnings: &mut Vec<String>,
    ) -> Result<SandboxSession, TurnError> {
        let files = if restore { self.load_snapshot().await } else { None };
        let session = self
            .manager
            .create(files.as_ref())
            .await
            .map_err(TurnError::Sandbox)?;
        broadcast_message(
            &self.ui_tx,
            &UiMessage::SandboxCreated {
                session: session.clone(),
            },
        );
        if let Some(previous) = previous {
            info!(previous = %previous, current = %session.id, "sandbox replaced");
            broadcast_message(
                &self.ui_tx,
                &UiMessage::SessionReplaced {
                    previous,
                    current: session.id.clone(),
                },
            );
        }
        self.bootstrap(&session, warnings).await?;
        Ok(session)
    }

    /// Install, start the dev server and wait for it. Failures other than
    /// losing the session are warnings.
    async fn bootstrap(
        &self,
        session: &SandboxSession,
        warnings: &mut Vec<String>,
    ) -> Result<(), TurnError> {
        if let Err(e) = self.manager.install_dependencies(&session.id, &[]).await {
            Self::bootstrap_warning(session, "install", e, warnings)?;
        }
        if let Err(e) = self.manager.start_process(&session.id, None).await {
            Self::bootstrap_warning(session, "start", e, warnings)?;
            return Ok(());
        }
        match self.manager.wait_ready(&session.id).await {
            Ok(()) => broadcast_message(
                &self.ui_tx,
                &UiMessage::PreviewReady {
                    session_id: session.id.clone(),
                    url: session.base_url.clone(),
                    token: chrono::Utc::now().timestamp_millis(),
                },
            ),
            Err(e) => Self::bootstrap_warning(session, "readiness", e, warnings)?,
        }
        Ok(())
    }

    fn bootstrap_warning(
        session: &SandboxSession,
        step: &str,
        error: SandboxError,
        warnings: &mut Vec<String>,
    ) -> Result<(), TurnError> {
        if error.is_session_lost() {
            return Err(TurnError::Sandbox(error));
        }
        warn!(sandbox_id = %session.id, step, error = %error, "sandbox bootstrap step failed");
        warnings.push(format!("Sandbox {step} failed: {error}"));
        Ok(())
    }

    async fn load_snapshot(&self) -> Option<BTreeMap<String, String>> {
        let store = self.store.as_ref()?;
        match store.load(&self.project_id).await {
            Ok(Some(snapshot)) => {
                info!(project_id = %self.project_id, files = snapshot.files.len(), "restoring project");
                Some(snapshot.files)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(project_id = %self.project_id, error = %e, "could not load saved project");
                None
            }
        }
    }

    async fn build_request(
        &self,
        prompt: &str,
        session: &SandboxSession,
        warnings: &mut Vec<String>,
    ) -> GenerationRequest {
        let files = match self.manager.list_files(&session.id).await {
            Ok(files) => files,
            Err(e) => {
                warn!(sandbox_id = %session.id, error = %e, "listing sandbox files failed");
                warnings.push(format!("Could not list sandbox files: {e}"));
                BTreeMap::new()
            }
        };
        let context = self.context.lock().await;
        GenerationRequest {
            prompt: prompt.to_string(),
            model: self.settings.model.clone(),
            context: RequestContext {
                sandbox_id: Some(session.id.clone()),
                sandbox_url: Some(session.base_url.clone()),
                file_listing: bounded_listing(&files, self.settings.max_context_bytes),
                recent_turns: context
                    .recent(context.max_turns())
                    .into_iter()
                    .map(RecentTurn::from)
                    .collect(),
            },
            is_edit: context.is_edit() || !session.known_files.is_empty(),
        }
    }

    /// Consume the whole stream. A transport failure discards everything
    /// collected so far.
    async fn stream(&self, request: &GenerationRequest) -> Result<StreamHarvest, GenerationError> {
        let body = self.client.open_stream(request).await?;
        let mut lines = GenerationStream::new(body, self.settings.idle_timeout);
        let mut assembler = EventAssembler::new();
        let mut harvest = StreamHarvest::default();

        while let Some(line) = lines.next_line().await? {
            for event in assembler.push_line(&line) {
                self.forward(&event, &mut harvest);
            }
            if assembler.is_complete() {
                break;
            }
        }
        for event in assembler.finish() {
            self.forward(&event, &mut harvest);
        }
        debug!(
            files = harvest.artifacts.len(),
            packages = harvest.packages.len(),
            errors = harvest.errors.len(),
            "generation stream finished"
        );
        Ok(harvest)
    }

    fn forward(&self, event: &ProtocolEvent, harvest: &mut StreamHarvest) {
        if let Some(message) = UiMessage::from_event(event) {
            broadcast_message(&self.ui_tx, &message);
        }
        harvest.absorb(event);
    }

    /// Apply `batch` to `session`. An expired session is replaced once and
    /// the batch applied there. A session that someone else replaced or
    /// killed in the meantime discards the batch.
    async fn apply_with_retry(
        &self,
        session: &SandboxSession,
        batch: ApplyBatch,
        warnings: &mut Vec<String>,
    ) -> Result<ApplicationRun, TurnError> {
        match self.engine.apply(&session.id, batch.clone()).await {
            Ok(run) => Ok(run),
            Err(SandboxError::SessionExpired { .. }) => {
                info!(sandbox_id = %session.id, "sandbox expired during turn, retrying against a replacement");
                let replacement = self
                    .provision(Some(session.id.clone()), true, warnings)
                    .await?;
                warnings.push(format!(
                    "Sandbox {} expired during the turn; applied to {}",
                    session.id, replacement.id
                ));
                self.engine
                    .apply(&replacement.id, batch)
                    .await
                    .map_err(Self::apply_error)
            }
            Err(e) => Err(Self::apply_error(e)),
        }
    }

    fn apply_error(error: SandboxError) -> TurnError {
        if error.is_session_lost() {
            warn!(error = %error, "discarding changes for a sandbox that is no longer active");
            TurnError::Discarded(error)
        } else {
            TurnError::Apply(error)
        }
    }

    async fn spawn_save(&self, run: &ApplicationRun) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if run.applied_paths.is_empty() {
            return;
        }
        let manager = self.manager.clone();
        let project_id = self.project_id.clone();
        let session_id = run.session_id.clone();
        let handle = tokio::spawn(async move {
            let files = match manager.list_files(&session_id).await {
                Ok(files) => files,
                Err(e) => {
                    warn!(sandbox_id = %session_id, error = %e, "could not read files to save");
                    return;
                }
            };
            if let Err(e) = store.save(&project_id, &files).await {
                warn!(project_id = %project_id, error = %e, "saving project failed");
            }
        });

        let previous = self.pending_save.lock().await.replace(handle);
        if let Some(previous) = previous
            && !previous.is_finished()
        {
            debug!("previous project save still running");
        }
    }
}

fn non_empty_or(first: &str, second: &str, fallback: &str) -> String {
    [first, second]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::EngineSettings;
    use crate::generate::ReplayGenerationClient;
    use crate::generate::client::event_stream_body;
    use crate::orchestrator::JsonFileStore;
    use crate::sandbox::{ManagerSettings, MemorySandboxProvider, SessionState};
    use crate::ui::ui_channel;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        provider: Arc<MemorySandboxProvider>,
        client: Arc<ReplayGenerationClient>,
        orchestrator: GenerationOrchestrator,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MemorySandboxProvider::new());
        let manager = Arc::new(SandboxManager::new(
            provider.clone(),
            ManagerSettings {
                settle_delay: Duration::ZERO,
                ..ManagerSettings::default()
            },
        ));
        let ui_tx = ui_channel();
        let engine = ApplicationEngine::new(manager, EngineSettings::default(), ui_tx.clone());
        let client = Arc::new(ReplayGenerationClient::new().with_chunk_size(7));
        let orchestrator = GenerationOrchestrator::new(
            client.clone(),
            engine,
            GenerationSettings::default(),
            ConversationContext::new(10),
            ui_tx,
        );
        Fixture {
            provider,
            client,
            orchestrator,
        }
    }

    fn stream_of(text: &str) -> String {
        event_stream_body(&[
            json!({"type": "status", "message": "Generating"}),
            json!({"type": "stream", "text": text, "raw": true}),
            json!({"type": "complete", "explanation": "Built it"}),
        ])
    }

    #[test]
    fn test_is_package_check() {
        assert!(is_package_check("check packages"));
        assert!(is_package_check("  NPM Install "));
        assert!(!is_package_check("npm install lodash"));
    }

    #[tokio::test]
    async fn test_turn_creates_session_and_applies() {
        let f = fixture();
        f.client
            .push_body(stream_of("<file path=\"src/App.jsx\">export default 1</file>"));

        let outcome = f.orchestrator.run_turn("make an app").await.unwrap();
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.summary, "Built it");
        assert_eq!(outcome.applied_paths, vec!["src/App.jsx"]);
        assert_eq!(
            f.provider.files(&outcome.session_id).get("src/App.jsx").map(String::as_str),
            Some("export default 1")
        );

        let context = f.orchestrator.context().await;
        assert!(context.is_edit());
        let roles: Vec<_> = context.entries().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_second_turn_sends_context() {
        let f = fixture();
        f.client
            .push_body(stream_of("<file path=\"src/App.jsx\">v1</file>"));
        f.client
            .push_body(stream_of("<file path=\"src/App.jsx\">v2</file>"));

        let first = f.orchestrator.run_turn("make an app").await.unwrap();
        let second = f.orchestrator.run_turn("change it").await.unwrap();
        assert_eq!(first.session_id, second.session_id);

        let requests = f.client.requests();
        assert!(!requests[0].is_edit);
        assert!(requests[1].is_edit);
        assert_eq!(requests[1].context.recent_turns.len(), 2);
        assert!(
            requests[1]
                .context
                .file_listing
                .iter()
                .any(|f| f.path == "src/App.jsx" && f.content.as_deref() == Some("v1"))
        );
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_session() {
        let f = fixture();
        f.client.push_body(stream_of("<file path=\"a.js\">1</file>"));
        f.client.push_status(502, "bad gateway");

        let first = f.orchestrator.run_turn("one").await.unwrap();
        let err = f.orchestrator.run_turn("two").await.unwrap_err();
        assert!(matches!(
            err,
            TurnError::Generation(GenerationError::Status { status: 502, .. })
        ));
        let active = f.orchestrator.manager().active().await.unwrap();
        assert_eq!(active.id, first.session_id);

        let last = f.orchestrator.context().await.recent(1).remove(0);
        assert_eq!(last.role, Role::Error);
    }

    #[tokio::test]
    async fn test_error_only_stream_fails_turn() {
        let f = fixture();
        f.client.push_body(event_stream_body(&[json!({
            "type": "error",
            "error": "model overloaded"
        })]));
        let err = f.orchestrator.run_turn("build").await.unwrap_err();
        assert!(matches!(err, TurnError::Generation(GenerationError::Service(_))));
    }

    #[tokio::test]
    async fn test_narration_only_is_no_changes() {
        let f = fixture();
        f.client
            .push_body(stream_of("Everything already looks right."));
        let outcome = f.orchestrator.run_turn("check it").await.unwrap();
        assert_eq!(outcome.status, RunStatus::NoChanges);
        assert_eq!(outcome.summary, "Built it");
    }

    #[tokio::test]
    async fn test_truncated_file_applied_with_warning() {
        let f = fixture();
        f.client.push_body(event_stream_body(&[json!({
            "type": "stream",
            "text": "<file path=\"a.js\">const x = 1"
        })]));
        let outcome = f.orchestrator.run_turn("go").await.unwrap();
        assert_eq!(outcome.applied_paths, vec!["a.js"]);
        assert_eq!(
            f.provider.files(&outcome.session_id).get("a.js").map(String::as_str),
            Some("const x = 1")
        );
        assert!(outcome.warnings.iter().any(|w| w.contains("cut off")));
        assert!(outcome.warnings.iter().any(|w| w.starts_with("Generation:")));
    }

    #[tokio::test]
    async fn test_expired_session_is_replaced_before_turn() {
        let f = fixture();
        f.client.push_body(stream_of("<file path=\"a.js\">1</file>"));
        f.client.push_body(stream_of("<file path=\"b.js\">2</file>"));

        let first = f.orchestrator.run_turn("one").await.unwrap();
        f.orchestrator.manager().expire(&first.session_id).await;

        let second = f.orchestrator.run_turn("two").await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(
            f.orchestrator.manager().session_state(&first.session_id).await,
            Some(SessionState::Expired)
        );
    }

    #[tokio::test]
    async fn test_package_check_installs() {
        let f = fixture();
        f.client.push_body(stream_of("<file path=\"a.js\">1</file>"));
        let first = f.orchestrator.run_turn("one").await.unwrap();

        let outcome = f.orchestrator.run_turn("check packages").await.unwrap();
        assert_eq!(outcome.session_id, first.session_id);
        assert_eq!(f.client.requests().len(), 1);
        let installs = f
            .provider
            .commands()
            .into_iter()
            .filter(|(_, cmd)| cmd == "npm install")
            .count();
        assert_eq!(installs, 2);
    }

    #[tokio::test]
    async fn test_package_check_without_session_fails() {
        let f = fixture();
        let err = f.orchestrator.run_turn("check packages").await.unwrap_err();
        assert!(matches!(err, TurnError::Sandbox(SandboxError::NoActiveSession)));
    }

    #[tokio::test]
    async fn test_reapply_without_generation_fails() {
        let f = fixture();
        let err = f.orchestrator.reapply_last().await.unwrap_err();
        assert!(matches!(err, TurnError::NothingToReapply));
        assert_eq!(
            f.orchestrator.context().await.recent(1)[0].role,
            Role::Error
        );
    }

    #[tokio::test]
    async fn test_reapply_writes_last_batch_again() {
        let f = fixture();
        f.client
            .push_body(stream_of("<file path=\"src/App.jsx\">generated</file>"));
        let first = f.orchestrator.run_turn("make an app").await.unwrap();
        f.orchestrator
            .manager()
            .write_file(&first.session_id, "src/App.jsx", "hand edited")
            .await
            .unwrap();

        let outcome = f.orchestrator.reapply_last().await.unwrap();
        assert_eq!(outcome.session_id, first.session_id);
        assert_eq!(outcome.summary, "Reapplied 1 file(s)");
        assert_eq!(
            f.provider.files(&first.session_id).get("src/App.jsx").map(String::as_str),
            Some("generated")
        );
        assert_eq!(f.client.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_reapply_after_kill_uses_fresh_session() {
        let f = fixture();
        f.client.push_body(stream_of("<file path=\"a.js\">1</file>"));
        let first = f.orchestrator.run_turn("one").await.unwrap();
        f.orchestrator.manager().kill(&first.session_id).await;

        let outcome = f.orchestrator.reapply_last().await.unwrap();
        assert_ne!(outcome.session_id, first.session_id);
        assert_eq!(
            f.provider.files(&outcome.session_id).get("a.js").map(String::as_str),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let f = fixture();
        assert!(matches!(
            f.orchestrator.run_turn("   ").await,
            Err(TurnError::EmptyPrompt)
        ));
    }

    #[tokio::test]
    async fn test_saves_and_restores_project() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture();
        let orchestrator = f
            .orchestrator
            .with_store(Arc::new(JsonFileStore::new(dir.path())), "demo");
        f.client
            .push_body(stream_of("<file path=\"src/App.jsx\">saved</file>"));

        orchestrator.run_turn("make").await.unwrap();
        orchestrator.wait_for_saves().await;
        assert!(dir.path().join("demo.json").exists());

        let restored = orchestrator.create_session(true).await.unwrap();
        assert_eq!(
            f.provider.files(&restored.id).get("src/App.jsx").map(String::as_str),
            Some("saved")
        );
    }
}
