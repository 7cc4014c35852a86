//! Owner of the single active sandbox session.
//!
//! All session mutation (create, replace, expire, kill) goes through
//! [`SandboxManager`]. The active slot sits behind a `tokio::sync::Mutex`;
//! a separate run lock serializes `create`, `kill` and `expire` against
//! application runs. Expiry noticed mid-run by `ensure_current` retires the
//! session without it, since the run itself holds the lock.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::provider::{
    CommandHandle, CommandSpec, ProviderError, ProvisionConfig, ProvisionedSandbox,
    SandboxProvider, is_excluded,
};
use super::session::{SandboxSession, SessionState};
use crate::errors::SandboxError;
use crate::paths::{parent_dir, validate_relative};

static PACKAGE_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@?[A-Za-z0-9][A-Za-z0-9._~/-]*(@[A-Za-z0-9.^~_-]+)?$").unwrap());

/// Package names end up on a shell command line.
pub fn is_valid_package_name(name: &str) -> bool {
    name.len() <= 214 && PACKAGE_NAME_REGEX.is_match(name)
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub provision: ProvisionConfig,
    pub provision_timeout: Duration,
    pub install_command: String,
    pub install_timeout: Duration,
    pub start_command: String,
    /// Fixed wait after starting the dev server
    pub settle_delay: Duration,
    /// Also poll `base_url` until it answers
    pub health_probe: bool,
    pub probe_timeout: Duration,
    pub max_file_bytes: usize,
    /// How many retired sessions `session_state` remembers
    pub retired_history: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            provision: ProvisionConfig::default(),
            provision_timeout: Duration::from_secs(60),
            install_command: "npm install".to_string(),
            install_timeout: Duration::from_secs(300),
            start_command: "npm run dev".to_string(),
            settle_delay: Duration::from_secs(3),
            health_probe: false,
            probe_timeout: Duration::from_secs(20),
            max_file_bytes: 200_000,
            retired_history: 16,
        }
    }
}

struct ActiveSlot {
    session: SandboxSession,
    /// The dev server started by `start_process`
    process: Option<CommandHandle>,
}

#[derive(Default)]
struct ManagerState {
    active: Option<ActiveSlot>,
    retired: VecDeque<SandboxSession>,
}

impl ManagerState {
    /// Move `session` into `terminal` and remember it. A session that is
    /// already terminal keeps its state.
    fn retire(&mut self, session: &SandboxSession, terminal: SessionState, history: usize) {
        let mut retired = session.clone();
        if let Err(e) = retired.transition(terminal) {
            warn!(error = %e, "ignoring session transition");
            return;
        }
        self.retired.retain(|r| r.id != session.id);
        self.retired.push_back(retired);
        while self.retired.len() > history.max(1) {
            self.retired.pop_front();
        }
    }

    fn is_retired(&self, id: &str) -> bool {
        self.retired.iter().any(|r| r.id == id)
    }
}

pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    settings: ManagerSettings,
    state: Mutex<ManagerState>,
    run_lock: Arc<Mutex<()>>,
    http: reqwest::Client,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: ManagerSettings) -> Self {
        Self {
            provider,
            settings,
            state: Mutex::new(ManagerState::default()),
            run_lock: Arc::new(Mutex::new(())),
            http: reqwest::Client::new(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Exclusive lock held for `create` and for each application run.
    /// Waiters are served in FIFO order.
    pub async fn acquire_run_lock(&self) -> OwnedMutexGuard<()> {
        self.run_lock.clone().lock_owned().await
    }

    /// Provision a new sandbox, replacing the active one.
    ///
    /// The previous session (if any) is marked `Replaced` and released
    /// first. On failure the half-built sandbox is killed and the active
    /// slot stays empty; nothing is retried.
    pub async fn create(
        &self,
        initial_files: Option<&BTreeMap<String, String>>,
    ) -> Result<SandboxSession, SandboxError> {
        let _run = self.acquire_run_lock().await;
        self.create_locked(initial_files).await
    }

    async fn create_locked(
        &self,
        initial_files: Option<&BTreeMap<String, String>>,
    ) -> Result<SandboxSession, SandboxError> {
        let previous = {
            let mut state = self.state.lock().await;
            let previous = state.active.take();
            if let Some(slot) = &previous {
                state.retire(&slot.session, SessionState::Replaced, self.settings.retired_history);
            }
            previous
        };
        if let Some(slot) = previous {
            info!(sandbox_id = %slot.session.id, "replacing active sandbox");
            self.release(slot).await;
        }

        let provider = self.provider.clone();
        let config = self.settings.provision.clone();
        let mut pending = tokio::spawn(async move { provider.create(&config).await });
        let provisioned = match tokio::time::timeout(self.settings.provision_timeout, &mut pending).await
        {
            Ok(Ok(Ok(provisioned))) => provisioned,
            Ok(Ok(Err(e))) => {
                warn!(provider = self.provider.name(), error = %e, "sandbox provisioning rejected");
                return Err(SandboxError::Provision {
                    reason: e.to_string(),
                });
            }
            Ok(Err(e)) => {
                warn!(provider = self.provider.name(), error = %e, "sandbox provisioning task failed");
                return Err(SandboxError::Provision {
                    reason: format!("provisioning task failed: {e}"),
                });
            }
            Err(_) => {
                warn!(provider = self.provider.name(), "sandbox provisioning timed out");
                self.reap_late(pending);
                return Err(SandboxError::Provision {
                    reason: format!(
                        "provider did not respond within {:?}",
                        self.settings.provision_timeout
                    ),
                });
            }
        };

        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(self.settings.provision.lifetime)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut session = SandboxSession {
            id: provisioned.id.clone(),
            base_url: provisioned.host_url,
            state: SessionState::Provisioning,
            created_at: now,
            timeout_at: now + lifetime,
            known_files: BTreeSet::new(),
        };
        debug!(sandbox_id = %session.id, "sandbox provisioned");

        if let Some(files) = initial_files
            && let Err(reason) = self.preload(&session.id, files, &mut session.known_files).await
        {
            warn!(sandbox_id = %session.id, %reason, "preloading files failed, killing sandbox");
            if let Err(e) = self.provider.kill(&session.id).await {
                warn!(sandbox_id = %session.id, error = %e, "failed to release sandbox");
            }
            let mut state = self.state.lock().await;
            state.retire(&session, SessionState::Killed, self.settings.retired_history);
            return Err(SandboxError::Provision { reason });
        }

        session
            .transition(SessionState::Running)
            .map_err(|e| SandboxError::Provision {
                reason: e.to_string(),
            })?;
        info!(
            sandbox_id = %session.id,
            url = %session.base_url,
            files = session.known_files.len(),
            "sandbox running"
        );
        let mut state = self.state.lock().await;
        state.active = Some(ActiveSlot {
            session: session.clone(),
            process: None,
        });
        Ok(session)
    }

    async fn preload(
        &self,
        sandbox_id: &str,
        files: &BTreeMap<String, String>,
        known: &mut BTreeSet<String>,
    ) -> Result<(), String> {
        let mut normalized = Vec::with_capacity(files.len());
        for (path, content) in files {
            let path = validate_relative(path).map_err(|e| format!("{path}: {e}"))?;
            normalized.push((path, content));
        }

        let mut dirs: Vec<&str> = normalized
            .iter()
            .filter_map(|(path, _)| parent_dir(path))
            .collect();
        dirs.sort_unstable();
        dirs.dedup();
        for dir in dirs {
            self.provider
                .make_directory(sandbox_id, dir)
                .await
                .map_err(|e| format!("creating {dir}: {e}"))?;
        }

        for (path, content) in &normalized {
            self.provider
                .write_file(sandbox_id, path, content)
                .await
                .map_err(|e| format!("writing {path}: {e}"))?;
            known.insert(path.clone());
        }
        Ok(())
    }

    /// Snapshot of the active session, if any.
    pub async fn active(&self) -> Option<SandboxSession> {
        self.state
            .lock()
            .await
            .active
            .as_ref()
            .map(|slot| slot.session.clone())
    }

    /// State of the active session or of a recently retired one.
    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let state = self.state.lock().await;
        if let Some(slot) = &state.active
            && slot.session.id == session_id
        {
            return Some(slot.session.state);
        }
        state
            .retired
            .iter()
            .rev()
            .find(|r| r.id == session_id)
            .map(|r| r.state)
    }

    /// Check that `session_id` is the active, unexpired session.
    ///
    /// A session past its `timeout_at` is transitioned to `Expired` and
    /// released here.
    pub async fn ensure_current(&self, session_id: &str) -> Result<SandboxSession, SandboxError> {
        let expired = {
            let mut state = self.state.lock().await;
            let Some(slot) = &state.active else {
                if state.is_retired(session_id) {
                    return Err(SandboxError::StaleSession {
                        expected: session_id.to_string(),
                        active: None,
                    });
                }
                return Err(SandboxError::NoActiveSession);
            };
            if slot.session.id != session_id {
                return Err(SandboxError::StaleSession {
                    expected: session_id.to_string(),
                    active: Some(slot.session.id.clone()),
                });
            }
            if !slot.session.is_expired_at(Utc::now()) {
                return Ok(slot.session.clone());
            }
            let slot = state.active.take();
            if let Some(slot) = &slot {
                state.retire(&slot.session, SessionState::Expired, self.settings.retired_history);
            }
            slot
        };

        if let Some(slot) = expired {
            info!(sandbox_id = %session_id, "sandbox expired");
            self.release(slot).await;
        }
        Err(SandboxError::SessionExpired {
            session_id: session_id.to_string(),
        })
    }

    pub async fn write_file(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let path = validate_relative(path).map_err(|e| SandboxError::io(path, e))?;
        self.ensure_current(session_id).await?;
        self.provider
            .write_file(session_id, &path, content)
            .await
            .map_err(|e| SandboxError::io(&path, e))?;
        debug!(sandbox_id = %session_id, path = %path, bytes = content.len(), "wrote file");

        let mut state = self.state.lock().await;
        if let Some(slot) = state.active.as_mut()
            && slot.session.id == session_id
        {
            slot.session.known_files.insert(path);
        }
        Ok(())
    }

    pub async fn make_directory(&self, session_id: &str, path: &str) -> Result<(), SandboxError> {
        let path = validate_relative(path).map_err(|e| SandboxError::io(path, e))?;
        self.ensure_current(session_id).await?;
        self.provider
            .make_directory(session_id, &path)
            .await
            .map_err(|e| SandboxError::io(&path, e))
    }

    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<String, SandboxError> {
        let path = validate_relative(path).map_err(|e| SandboxError::io(path, e))?;
        self.ensure_current(session_id).await?;
        self.provider
            .read_file(session_id, &path)
            .await
            .map_err(|e| SandboxError::io(&path, e))
    }

    /// Contents of every listable file. Dependency and build directories and
    /// files over the size limit are left out.
    pub async fn list_files(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<String, String>, SandboxError> {
        self.ensure_current(session_id).await?;
        let paths = self
            .provider
            .list_files(session_id)
            .await
            .map_err(|e| SandboxError::io(".", e))?;

        let mut files = BTreeMap::new();
        for raw in paths {
            let Ok(path) = validate_relative(&raw) else {
                debug!(path = %raw, "skipping unlistable path");
                continue;
            };
            if is_excluded(&path) {
                continue;
            }
            match self.provider.read_file(session_id, &path).await {
                Ok(content) if content.len() > self.settings.max_file_bytes => {
                    debug!(path = %path, bytes = content.len(), "skipping oversized file");
                }
                Ok(content) => {
                    files.insert(path, content);
                }
                Err(ProviderError::NotFound(_)) => {}
                Err(e) => return Err(SandboxError::io(&path, e)),
            }
        }
        Ok(files)
    }

    /// Run the install command in the foreground, with `packages` appended.
    /// Invalid package names are dropped.
    pub async fn install_dependencies(
        &self,
        session_id: &str,
        packages: &[String],
    ) -> Result<CommandHandle, SandboxError> {
        self.ensure_current(session_id).await?;
        let mut command = self.settings.install_command.clone();
        let mut seen = HashSet::new();
        for package in packages {
            if !is_valid_package_name(package) {
                warn!(package = %package, "ignoring invalid package name");
                continue;
            }
            if seen.insert(package.as_str()) {
                command.push(' ');
                command.push_str(package);
            }
        }
        info!(sandbox_id = %session_id, command = %command, "installing dependencies");
        self.run_foreground(session_id, &command, self.settings.install_timeout, "installing")
            .await
    }

    async fn run_foreground(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        stage: &str,
    ) -> Result<CommandHandle, SandboxError> {
        let spec = CommandSpec::foreground(command);
        let handle = tokio::time::timeout(timeout, self.provider.run_command(session_id, &spec))
            .await
            .map_err(|_| SandboxError::timeout(stage))?
            .map_err(|e| SandboxError::Command {
                command: command.to_string(),
                reason: e.to_string(),
            })?;
        if !handle.succeeded() {
            let code = handle
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(SandboxError::Command {
                command: command.to_string(),
                reason: format!("exit {code}: {}", handle.output_tail(5)),
            });
        }
        Ok(handle)
    }

    /// Start the dev server (or `command`) in the background.
    pub async fn start_process(
        &self,
        session_id: &str,
        command: Option<&str>,
    ) -> Result<CommandHandle, SandboxError> {
        self.ensure_current(session_id).await?;
        let command = command.unwrap_or(&self.settings.start_command);
        let handle = self
            .provider
            .run_command(session_id, &CommandSpec::background(command))
            .await
            .map_err(|e| SandboxError::Command {
                command: command.to_string(),
                reason: e.to_string(),
            })?;
        info!(sandbox_id = %session_id, command = %command, "started process");

        let mut state = self.state.lock().await;
        if let Some(slot) = state.active.as_mut()
            && slot.session.id == session_id
        {
            slot.process = Some(handle.clone());
        }
        Ok(handle)
    }

    /// Stop the tracked process (best effort) and start it again.
    pub async fn restart_process(&self, session_id: &str) -> Result<CommandHandle, SandboxError> {
        self.ensure_current(session_id).await?;
        let previous = {
            let mut state = self.state.lock().await;
            state
                .active
                .as_mut()
                .filter(|slot| slot.session.id == session_id)
                .and_then(|slot| slot.process.take())
        };
        if let Some(handle) = previous
            && let Err(e) = self.provider.stop_command(session_id, &handle.id).await
        {
            debug!(sandbox_id = %session_id, error = %e, "stopping previous process failed");
        }
        self.start_process(session_id, None).await
    }

    /// Wait the settle delay, then optionally poll `base_url` until it answers.
    pub async fn wait_ready(&self, session_id: &str) -> Result<(), SandboxError> {
        let session = self.ensure_current(session_id).await?;
        tokio::time::sleep(self.settings.settle_delay).await;
        if !self.settings.health_probe {
            return Ok(());
        }

        let probe = async {
            loop {
                match self.http.get(&session.base_url).send().await {
                    Ok(resp) if resp.status().is_success() => return,
                    Ok(resp) => debug!(status = %resp.status(), "preview not ready"),
                    Err(e) => debug!(error = %e, "preview not reachable"),
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        };
        tokio::time::timeout(self.settings.probe_timeout, probe)
            .await
            .map_err(|_| SandboxError::timeout("readiness"))
    }

    /// Mark the session expired and release it. No-op unless it is active.
    /// Waits for an application run in progress.
    pub async fn expire(&self, session_id: &str) {
        self.retire_active(session_id, SessionState::Expired).await;
    }

    /// Kill the session and release it. No-op unless it is active.
    /// Waits for an application run in progress.
    pub async fn kill(&self, session_id: &str) {
        self.retire_active(session_id, SessionState::Killed).await;
    }

    /// Kill whatever session is active.
    pub async fn shutdown(&self) {
        if let Some(session) = self.active().await {
            self.kill(&session.id).await;
        }
    }

    async fn retire_active(&self, session_id: &str, terminal: SessionState) {
        let _run = self.acquire_run_lock().await;
        let slot = {
            let mut state = self.state.lock().await;
            let is_active = state
                .active
                .as_ref()
                .is_some_and(|slot| slot.session.id == session_id);
            let slot = if is_active { state.active.take() } else { None };
            if let Some(slot) = &slot {
                state.retire(&slot.session, terminal, self.settings.retired_history);
            }
            slot
        };
        if let Some(slot) = slot {
            info!(sandbox_id = %session_id, state = %terminal, "sandbox retired");
            self.release(slot).await;
        }
    }

    /// Kill a sandbox whose provisioning outlived the deadline, once the
    /// provider gets around to returning it.
    fn reap_late(&self, pending: JoinHandle<Result<ProvisionedSandbox, ProviderError>>) {
        let provider = self.provider.clone();
        tokio::spawn(async move {
            if let Ok(Ok(late)) = pending.await {
                warn!(sandbox_id = %late.id, "sandbox arrived after the provisioning deadline, killing it");
                if let Err(e) = provider.kill(&late.id).await {
                    warn!(sandbox_id = %late.id, error = %e, "failed to release late sandbox");
                }
            }
        });
    }

    /// Release the remote resource behind a retired slot. Failures are logged.
    async fn release(&self, slot: ActiveSlot) {
        let id = &slot.session.id;
        if let Some(process) = &slot.process
            && let Err(e) = self.provider.stop_command(id, &process.id).await
        {
            debug!(sandbox_id = %id, error = %e, "stopping process during teardown failed");
        }
        if let Err(e) = self.provider.kill(id).await {
            warn!(sandbox_id = %id, error = %e, "failed to release sandbox");
        }
    }
}
