//! Sandboxes as plain directories on this machine.
//!
//! Each sandbox is `<root>/<id>`, seeded with the configured starter
//! template. Commands run through `sh -c` inside it; background processes
//! are tracked so teardown can stop them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::provider::{
    CommandHandle, CommandSpec, EXCLUDED_DIRS, ProviderError, ProvisionConfig, ProvisionedSandbox,
    SandboxProvider,
};
use super::template;

struct BackgroundProcess {
    sandbox_id: String,
    child: Child,
}

pub struct LocalSandboxProvider {
    root: PathBuf,
    processes: Mutex<HashMap<String, BackgroundProcess>>,
}

impl LocalSandboxProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.root.join(sandbox_id)
    }

    fn existing_dir(&self, sandbox_id: &str) -> Result<PathBuf, ProviderError> {
        let dir = self.sandbox_dir(sandbox_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(ProviderError::NotFound(format!("sandbox {sandbox_id}")))
        }
    }
}

fn list_dir(dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !EXCLUDED_DIRS.iter().any(|excluded| name == *excluded)
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry.path().strip_prefix(dir).ok().map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .collect()
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, config: &ProvisionConfig) -> Result<ProvisionedSandbox, ProviderError> {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("local-{}", &simple[..12]);
        let dir = self.sandbox_dir(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::from_io(e, &dir.display().to_string()))?;
        let files = template::scaffold(&config.template, config.port).unwrap_or_default();
        for (path, body) in &files {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProviderError::from_io(e, path))?;
            }
            tokio::fs::write(&target, body)
                .await
                .map_err(|e| ProviderError::from_io(e, path))?;
        }
        debug!(
            sandbox_id = %id,
            dir = %dir.display(),
            template = %config.template,
            files = files.len(),
            "created local sandbox"
        );
        Ok(ProvisionedSandbox {
            id,
            host_url: format!("http://127.0.0.1:{}", config.port),
        })
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), ProviderError> {
        let target = self.existing_dir(sandbox_id)?.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::from_io(e, path))?;
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| ProviderError::from_io(e, path))
    }

    async fn make_directory(&self, sandbox_id: &str, path: &str) -> Result<(), ProviderError> {
        let target = self.existing_dir(sandbox_id)?.join(path);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| ProviderError::from_io(e, path))
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String, ProviderError> {
        let target = self.existing_dir(sandbox_id)?.join(path);
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|e| ProviderError::from_io(e, path))
    }

    async fn list_files(&self, sandbox_id: &str) -> Result<Vec<String>, ProviderError> {
        let dir = self.existing_dir(sandbox_id)?;
        let mut files = tokio::task::spawn_blocking(move || list_dir(&dir))
            .await
            .map_err(|e| ProviderError::Io(format!("listing task failed: {e}")))?;
        files.sort();
        Ok(files)
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        spec: &CommandSpec,
    ) -> Result<CommandHandle, ProviderError> {
        let dir = self.existing_dir(sandbox_id)?;
        let id = uuid::Uuid::new_v4().to_string();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command).current_dir(&dir);

        if spec.background {
            let child = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ProviderError::from_io(e, &spec.command))?;
            debug!(sandbox_id, command = %spec.command, pid = ?child.id(), "started background process");
            self.processes.lock().await.insert(
                id.clone(),
                BackgroundProcess {
                    sandbox_id: sandbox_id.to_string(),
                    child,
                },
            );
            return Ok(CommandHandle {
                id,
                exit_code: None,
                output: String::new(),
            });
        }

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::from_io(e, &spec.command))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandHandle {
            id,
            exit_code: output.status.code(),
            output: text,
        })
    }

    async fn stop_command(&self, _sandbox_id: &str, command_id: &str) -> Result<(), ProviderError> {
        let process = self.processes.lock().await.remove(command_id);
        match process {
            Some(mut process) => process
                .child
                .kill()
                .await
                .map_err(|e| ProviderError::from_io(e, command_id)),
            None => Err(ProviderError::NotFound(format!("command {command_id}"))),
        }
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), ProviderError> {
        let owned: Vec<BackgroundProcess> = {
            let mut processes = self.processes.lock().await;
            let ids: Vec<String> = processes
                .iter()
                .filter(|(_, p)| p.sandbox_id == sandbox_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| processes.remove(id)).collect()
        };
        for mut process in owned {
            if let Err(e) = process.child.kill().await {
                warn!(sandbox_id, error = %e, "failed to stop background process");
            }
        }

        let dir = self.sandbox_dir(sandbox_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProviderError::from_io(e, &dir.display().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_write_list_kill() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let sandbox = provider.create(&ProvisionConfig::default()).await.unwrap();
        assert!(sandbox.id.starts_with("local-"));
        assert_eq!(sandbox.host_url, "http://127.0.0.1:5173");

        provider
            .write_file(&sandbox.id, "src/App.jsx", "export default 1;")
            .await
            .unwrap();
        provider
            .write_file(&sandbox.id, "node_modules/react/index.js", "x")
            .await
            .unwrap();
        assert_eq!(
            provider.read_file(&sandbox.id, "src/App.jsx").await.unwrap(),
            "export default 1;"
        );
        let files = provider.list_files(&sandbox.id).await.unwrap();
        assert!(files.contains(&"src/App.jsx".to_string()));
        assert!(!files.iter().any(|f| f.starts_with("node_modules/")));

        provider.kill(&sandbox.id).await.unwrap();
        assert!(!provider.sandbox_dir(&sandbox.id).exists());
        provider.kill(&sandbox.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_scaffolds_vite_app() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let sandbox = provider.create(&ProvisionConfig::default()).await.unwrap();

        let files = provider.list_files(&sandbox.id).await.unwrap();
        for expected in ["package.json", "vite.config.js", "src/main.jsx", "src/App.jsx"] {
            assert!(files.contains(&expected.to_string()), "missing {expected}");
        }
        let config = provider.read_file(&sandbox.id, "vite.config.js").await.unwrap();
        assert!(config.contains("port: 5173"));
    }

    #[tokio::test]
    async fn test_unknown_template_starts_empty() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let config = ProvisionConfig {
            template: "unknown".to_string(),
            ..ProvisionConfig::default()
        };
        let sandbox = provider.create(&config).await.unwrap();
        assert!(provider.list_files(&sandbox.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let sandbox = provider.create(&ProvisionConfig::default()).await.unwrap();
        let err = provider.read_file(&sandbox.id, "nope.js").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_sandbox_is_not_found() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let err = provider.write_file("local-missing", "a.js", "").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_foreground_command_reports_exit_code_and_output() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let sandbox = provider.create(&ProvisionConfig::default()).await.unwrap();

        let ok = provider
            .run_command(&sandbox.id, &CommandSpec::foreground("echo hello > out.txt && cat out.txt"))
            .await
            .unwrap();
        assert!(ok.succeeded());
        assert!(ok.output.contains("hello"));

        let failed = provider
            .run_command(&sandbox.id, &CommandSpec::foreground("exit 3"))
            .await
            .unwrap();
        assert_eq!(failed.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_command_is_tracked_and_stopped() {
        let root = tempdir().unwrap();
        let provider = LocalSandboxProvider::new(root.path());
        let sandbox = provider.create(&ProvisionConfig::default()).await.unwrap();

        let handle = provider
            .run_command(&sandbox.id, &CommandSpec::background("sleep 30"))
            .await
            .unwrap();
        assert!(handle.exit_code.is_none());
        provider.stop_command(&sandbox.id, &handle.id).await.unwrap();
        assert!(provider.stop_command(&sandbox.id, &handle.id).await.is_err());
    }
}
