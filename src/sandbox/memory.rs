//! In-process sandbox provider. Nothing is executed; files live in memory.
//! Used by tests and by `--provider memory` dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::provider::{
    CommandHandle, CommandSpec, ProviderError, ProvisionConfig, ProvisionedSandbox,
    SandboxProvider, is_excluded,
};

#[derive(Debug, Default)]
struct MemorySandbox {
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    alive: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    sandboxes: HashMap<String, MemorySandbox>,
    next_id: u64,
    next_command: u64,
    commands: Vec<(String, CommandSpec)>,
    stopped: Vec<String>,
    killed: Vec<String>,
    fail_writes: HashSet<String>,
    fail_next_create: Option<ProviderError>,
    exit_codes: Vec<(String, i32)>,
    create_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MemorySandboxProvider {
    inner: Mutex<MemoryInner>,
}

impl MemorySandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every write to `path` fails with `PermissionDenied`.
    pub fn fail_writes_to(&self, path: &str) {
        self.inner().fail_writes.insert(path.to_string());
    }

    pub fn fail_next_create(&self, err: ProviderError) {
        self.inner().fail_next_create = Some(err);
    }

    /// Foreground commands starting with `prefix` exit with `code`.
    pub fn set_exit_code(&self, prefix: &str, code: i32) {
        self.inner().exit_codes.push((prefix.to_string(), code));
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.inner().create_delay = Some(delay);
    }

    /// Commands run so far, as `(sandbox_id, command)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.inner()
            .commands
            .iter()
            .map(|(id, spec)| (id.clone(), spec.command.clone()))
            .collect()
    }

    pub fn stopped_commands(&self) -> Vec<String> {
        self.inner().stopped.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.inner().killed.clone()
    }

    pub fn is_alive(&self, sandbox_id: &str) -> bool {
        self.inner()
            .sandboxes
            .get(sandbox_id)
            .is_some_and(|s| s.alive)
    }

    pub fn files(&self, sandbox_id: &str) -> BTreeMap<String, String> {
        self.inner()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }

    pub fn directories(&self, sandbox_id: &str) -> BTreeSet<String> {
        self.inner()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.dirs.clone())
            .unwrap_or_default()
    }

    /// Put a file in place without going through the manager.
    pub fn seed_file(&self, sandbox_id: &str, path: &str, content: &str) {
        if let Some(sandbox) = self.inner().sandboxes.get_mut(sandbox_id) {
            sandbox.files.insert(path.to_string(), content.to_string());
        }
    }
}

fn alive<'a>(
    inner: &'a mut MemoryInner,
    sandbox_id: &str,
) -> Result<&'a mut MemorySandbox, ProviderError> {
    inner
        .sandboxes
        .get_mut(sandbox_id)
        .filter(|s| s.alive)
        .ok_or_else(|| ProviderError::NotFound(format!("sandbox {sandbox_id}")))
}

#[async_trait]
impl SandboxProvider for MemorySandboxProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, _config: &ProvisionConfig) -> Result<ProvisionedSandbox, ProviderError> {
        let delay = self.inner().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner();
        if let Some(err) = inner.fail_next_create.take() {
            return Err(err);
        }
        inner.next_id += 1;
        let id = format!("mem-{}", inner.next_id);
        inner.sandboxes.insert(
            id.clone(),
            MemorySandbox {
                alive: true,
                ..MemorySandbox::default()
            },
        );
        Ok(ProvisionedSandbox {
            host_url: format!("http://{id}.sandbox.local"),
            id,
        })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner();
        if inner.fail_writes.contains(path) {
            return Err(ProviderError::PermissionDenied(path.to_string()));
        }
        let sandbox = alive(&mut inner, sandbox_id)?;
        sandbox.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn make_directory(&self, sandbox_id: &str, path: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner();
        let sandbox = alive(&mut inner, sandbox_id)?;
        sandbox.dirs.insert(path.to_string());
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, ProviderError> {
        let mut inner = self.inner();
        let sandbox = alive(&mut inner, sandbox_id)?;
        sandbox
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(path.to_string()))
    }

    async fn list_files(&self, sandbox_id: &str) -> Result<Vec<String>, ProviderError> {
        let mut inner = self.inner();
        let sandbox = alive(&mut inner, sandbox_id)?;
        Ok(sandbox
            .files
            .keys()
            .filter(|p| !is_excluded(p))
            .cloned()
            .collect())
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        spec: &CommandSpec,
    ) -> Result<CommandHandle, ProviderError> {
        let mut inner = self.inner();
        alive(&mut inner, sandbox_id)?;
        inner.next_command += 1;
        let id = format!("cmd-{}", inner.next_command);
        inner.commands.push((sandbox_id.to_string(), spec.clone()));

        if spec.background {
            return Ok(CommandHandle {
                id,
                exit_code: None,
                output: String::new(),
            });
        }
        let exit_code = inner
            .exit_codes
            .iter()
            .find(|(prefix, _)| spec.command.starts_with(prefix.as_str()))
            .map_or(0, |(_, code)| *code);
        Ok(CommandHandle {
            id,
            exit_code: Some(exit_code),
            output: format!("ran {}", spec.command),
        })
    }

    async fn stop_command(&self, _sandbox_id: &str, command_id: &str) -> Result<(), ProviderError> {
        self.inner().stopped.push(command_id.to_string());
        Ok(())
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner();
        if let Some(sandbox) = inner.sandboxes.get_mut(sandbox_id) {
            sandbox.alive = false;
        }
        inner.killed.push(sandbox_id.to_string());
        Ok(())
    }
}
