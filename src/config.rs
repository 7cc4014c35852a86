//! Configuration for kiln.
//!
//! Settings are read from `.kiln/kiln.toml`, then environment overrides,
//! then CLI flags. Every key is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! id = "default"
//! store_dir = ".kiln/projects"
//!
//! [generation]
//! endpoint = "http://127.0.0.1:3000/api/generate-ai-code-stream"
//! model = "openai/gpt-4o"
//! api_key_env = "KILN_GENERATION_API_KEY"
//! stream_idle_timeout_secs = 120
//! max_context_bytes = 32000
//!
//! [sandbox]
//! provider = "local"            # local | http | memory
//! root = ".kiln/sandboxes"
//! api_url = "https://api.sandbox.example/v1"
//! api_key_env = "KILN_SANDBOX_API_KEY"
//! template = "vite-react"
//! port = 5173
//! timeout_secs = 900
//! provision_timeout_secs = 60
//! install_command = "npm install"
//! install_timeout_secs = 300
//! start_command = "npm run dev"
//! settle_delay_ms = 3000
//! health_probe = false
//! probe_timeout_secs = 20
//! max_file_bytes = 200000
//!
//! [apply]
//! manifest_files = ["package.json"]
//! run_timeout_secs = 600
//! restart_after_install = true
//!
//! [context]
//! max_turns = 10
//!
//! [logging]
//! dir = ".kiln/logs"
//! json = false
//! ```
//!
//! Environment overrides: `KILN_GENERATION_URL`, `KILN_MODEL`,
//! `KILN_SANDBOX_PROVIDER`, `KILN_SANDBOX_API_URL`, `KILN_PROJECT_ID`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::apply::EngineSettings;
use crate::generate::GenerationSettings;
use crate::sandbox::{ManagerSettings, ProvisionConfig};

/// Which sandbox backend to provision against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// A directory per sandbox on this machine
    #[default]
    Local,
    /// A hosted sandbox REST API
    Http,
    /// In-process, nothing is executed
    Memory,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Http => write!(f, "http"),
            ProviderKind::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ProviderKind::Local),
            "http" => Ok(ProviderKind::Http),
            "memory" => Ok(ProviderKind::Memory),
            _ => anyhow::bail!(
                "Invalid sandbox provider '{}'. Valid values: local, http, memory",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Key used when saving and restoring project files
    #[serde(default = "default_project_id")]
    pub id: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_project_id() -> String {
    "default".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".kiln/projects")
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            id: default_project_id(),
            store_dir: default_store_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the bearer token, if any
    #[serde(default = "default_generation_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    /// Budget for file contents sent along with a request
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:3000/api/generate-ai-code-stream".to_string()
}

fn default_model() -> String {
    "openai/gpt-4o".to_string()
}

fn default_generation_key_env() -> String {
    "KILN_GENERATION_API_KEY".to_string()
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_max_context_bytes() -> usize {
    32_000
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_generation_key_env(),
            stream_idle_timeout_secs: default_idle_timeout(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Root directory for the local provider
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
    /// Base URL of the hosted sandbox API
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_sandbox_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_template")]
    pub template: String,
    /// Port the dev server listens on inside the sandbox
    #[serde(default = "default_port")]
    pub port: u16,
    /// Lifetime of a sandbox before it expires
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,
    #[serde(default = "default_install_command")]
    pub install_command: String,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_start_command")]
    pub start_command: String,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub health_probe: bool,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Files larger than this are left out of listings
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from(".kiln/sandboxes")
}

fn default_api_url() -> String {
    "https://api.sandbox.example/v1".to_string()
}

fn default_sandbox_key_env() -> String {
    "KILN_SANDBOX_API_KEY".to_string()
}

fn default_template() -> String {
    "vite-react".to_string()
}

fn default_port() -> u16 {
    5173
}

fn default_sandbox_timeout() -> u64 {
    900
}

fn default_provision_timeout() -> u64 {
    60
}

fn default_install_command() -> String {
    "npm install".to_string()
}

fn default_install_timeout() -> u64 {
    300
}

fn default_start_command() -> String {
    "npm run dev".to_string()
}

fn default_settle_delay() -> u64 {
    3000
}

fn default_probe_timeout() -> u64 {
    20
}

fn default_max_file_bytes() -> usize {
    200_000
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            root: default_sandbox_root(),
            api_url: default_api_url(),
            api_key_env: default_sandbox_key_env(),
            template: default_template(),
            port: default_port(),
            timeout_secs: default_sandbox_timeout(),
            provision_timeout_secs: default_provision_timeout(),
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout(),
            start_command: default_start_command(),
            settle_delay_ms: default_settle_delay(),
            health_probe: false,
            probe_timeout_secs: default_probe_timeout(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySection {
    /// File names that trigger a dependency install when written
    #[serde(default = "default_manifest_files")]
    pub manifest_files: Vec<String>,
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_restart_after_install")]
    pub restart_after_install: bool,
}

fn default_manifest_files() -> Vec<String> {
    vec!["package.json".to_string()]
}

fn default_run_timeout() -> u64 {
    600
}

fn default_restart_after_install() -> bool {
    true
}

impl Default for ApplySection {
    fn default() -> Self {
        Self {
            manifest_files: default_manifest_files(),
            run_timeout_secs: default_run_timeout(),
            restart_after_install: default_restart_after_install(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Number of recent turns sent with each request
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize {
    10
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Directory for daily-rolling log files; stderr only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// Contents of `.kiln/kiln.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub generation: GenerationSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub apply: ApplySection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl KilnToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse kiln.toml")
    }

    /// Load `.kiln/kiln.toml`, or defaults when the file does not exist.
    pub fn load_or_default(kiln_dir: &Path) -> Result<Self> {
        let config_path = kiln_dir.join("kiln.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize kiln.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `KILN_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("KILN_GENERATION_URL") {
            self.generation.endpoint = url;
        }
        if let Some(model) = get("KILN_MODEL") {
            self.generation.model = model;
        }
        if let Some(provider) = get("KILN_SANDBOX_PROVIDER") {
            self.sandbox.provider = provider
                .parse()
                .context("Invalid KILN_SANDBOX_PROVIDER")?;
        }
        if let Some(url) = get("KILN_SANDBOX_API_URL") {
            self.sandbox.api_url = url;
        }
        if let Some(id) = get("KILN_PROJECT_ID") {
            self.project.id = id;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.generation.endpoint.trim().is_empty() {
            warnings.push("generation.endpoint is empty".to_string());
        }
        if self.sandbox.provider == ProviderKind::Http
            && std::env::var(&self.sandbox.api_key_env).is_err()
        {
            warnings.push(format!(
                "sandbox.provider is 'http' but {} is not set",
                self.sandbox.api_key_env
            ));
        }

        for (name, value) in [
            ("generation.stream_idle_timeout_secs", self.generation.stream_idle_timeout_secs),
            ("sandbox.timeout_secs", self.sandbox.timeout_secs),
            ("sandbox.provision_timeout_secs", self.sandbox.provision_timeout_secs),
            ("sandbox.install_timeout_secs", self.sandbox.install_timeout_secs),
            ("apply.run_timeout_secs", self.apply.run_timeout_secs),
        ] {
            if value == 0 {
                warnings.push(format!("{name} is 0; every operation will time out"));
            }
        }

        if self.apply.manifest_files.is_empty() {
            warnings.push(
                "apply.manifest_files is empty; dependency installs only run for package tags"
                    .to_string(),
            );
        }
        if self.context.max_turns == 0 {
            warnings.push("context.max_turns is 0; requests carry no history".to_string());
        }

        warnings
    }
}

/// Resolved configuration: `kiln.toml` plus environment and CLI overrides,
/// with relative paths anchored at the project directory.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    pub project_dir: PathBuf,
    pub kiln_dir: PathBuf,
    pub toml: KilnToml,
    pub verbose: bool,
}

impl KilnConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let kiln_dir = project_dir.join(".kiln");
        let mut toml = KilnToml::load_or_default(&kiln_dir)?;
        toml.apply_env_overrides()?;

        Ok(Self {
            project_dir,
            kiln_dir,
            toml,
            verbose: false,
        })
    }

    /// Create a KilnConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        provider: Option<ProviderKind>,
        log_json: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(provider) = provider {
            config.toml.sandbox.provider = provider;
        }
        if log_json {
            config.toml.logging.json = true;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.kiln_dir.join("kiln.toml")
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.resolve(&self.toml.project.store_dir)
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.resolve(&self.toml.sandbox.root)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_deref().map(|dir| self.resolve(dir))
    }

    pub fn project_id(&self) -> &str {
        &self.toml.project.id
    }

    pub fn generation_api_key(&self) -> Option<String> {
        std::env::var(&self.toml.generation.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }

    pub fn sandbox_api_key(&self) -> Option<String> {
        std::env::var(&self.toml.sandbox.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let sandbox = &self.toml.sandbox;
        ManagerSettings {
            provision: ProvisionConfig {
                template: sandbox.template.clone(),
                port: sandbox.port,
                lifetime: Duration::from_secs(sandbox.timeout_secs),
            },
            provision_timeout: Duration::from_secs(sandbox.provision_timeout_secs),
            install_command: sandbox.install_command.clone(),
            install_timeout: Duration::from_secs(sandbox.install_timeout_secs),
            start_command: sandbox.start_command.clone(),
            settle_delay: Duration::from_millis(sandbox.settle_delay_ms),
            health_probe: sandbox.health_probe,
            probe_timeout: Duration::from_secs(sandbox.probe_timeout_secs),
            max_file_bytes: sandbox.max_file_bytes,
            ..ManagerSettings::default()
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            manifest_files: self.toml.apply.manifest_files.clone(),
            run_timeout: Duration::from_secs(self.toml.apply.run_timeout_secs),
            restart_after_install: self.toml.apply.restart_after_install,
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        let generation = &self.toml.generation;
        GenerationSettings {
            endpoint: generation.endpoint.clone(),
            model: generation.model.clone(),
            api_key: self.generation_api_key(),
            idle_timeout: Duration::from_secs(generation.stream_idle_timeout_secs),
            max_context_bytes: generation.max_context_bytes,
        }
    }

    /// Create the directories kiln writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.kiln_dir).with_context(|| {
            format!("Failed to create directory: {}", self.kiln_dir.display())
        })?;
        let store_dir = self.store_dir();
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create directory: {}", store_dir.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_provider_kind_display_and_parse() {
        assert_eq!(ProviderKind::Local.to_string(), "local");
        assert_eq!("HTTP".parse::<ProviderKind>().unwrap(), ProviderKind::Http);
        assert_eq!(" memory ".parse::<ProviderKind>().unwrap(), ProviderKind::Memory);
        let err = "docker".parse::<ProviderKind>().unwrap_err();
        assert!(err.to_string().contains("Invalid sandbox provider"));
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = KilnToml::parse("").unwrap();
        assert_eq!(config.project.id, "default");
        assert_eq!(config.sandbox.provider, ProviderKind::Local);
        assert_eq!(config.sandbox.port, 5173);
        assert_eq!(config.sandbox.install_command, "npm install");
        assert_eq!(config.apply.manifest_files, vec!["package.json"]);
        assert!(config.apply.restart_after_install);
        assert_eq!(config.context.max_turns, 10);
        assert_eq!(config.generation.max_context_bytes, 32_000);
        assert!(config.logging.dir.is_none());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = KilnToml::parse(
            r#"
[sandbox]
provider = "memory"
settle_delay_ms = 0

[apply]
manifest_files = ["package.json", "requirements.txt"]
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.provider, ProviderKind::Memory);
        assert_eq!(config.sandbox.settle_delay_ms, 0);
        assert_eq!(config.sandbox.start_command, "npm run dev");
        assert_eq!(config.apply.manifest_files.len(), 2);
        assert_eq!(config.apply.run_timeout_secs, 600);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = KilnToml::parse("[sandbox\nport = 1").unwrap_err();
        assert!(err.to_string().contains("kiln.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KILN_GENERATION_URL", "http://gen.local/stream"),
            ("KILN_MODEL", "anthropic/claude"),
            ("KILN_SANDBOX_PROVIDER", "http"),
            ("KILN_PROJECT_ID", "landing-page"),
            ("KILN_SANDBOX_API_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = KilnToml::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.generation.endpoint, "http://gen.local/stream");
        assert_eq!(config.generation.model, "anthropic/claude");
        assert_eq!(config.sandbox.provider, ProviderKind::Http);
        assert_eq!(config.project.id, "landing-page");
        assert_eq!(config.sandbox.api_url, default_api_url());
    }

    #[test]
    fn test_env_override_rejects_bad_provider() {
        let mut config = KilnToml::default();
        let result = config.apply_overrides_from(|k| {
            (k == "KILN_SANDBOX_PROVIDER").then(|| "vm".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_flags_zero_timeouts_and_empty_manifests() {
        let mut config = KilnToml::default();
        config.apply.run_timeout_secs = 0;
        config.apply.manifest_files.clear();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("apply.run_timeout_secs")));
        assert!(warnings.iter().any(|w| w.contains("manifest_files")));
    }

    #[test]
    fn test_default_config_validates_clean() {
        assert!(KilnToml::default().validate().is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        let mut config = KilnToml::default();
        config.sandbox.port = 3000;
        config.save(&path).unwrap();
        let loaded = KilnToml::load(&path).unwrap();
        assert_eq!(loaded.sandbox.port, 3000);
    }

    #[test]
    fn test_kiln_config_resolves_paths_under_project_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".kiln")).unwrap();
        std::fs::write(
            dir.path().join(".kiln/kiln.toml"),
            "[logging]\ndir = \"logs\"\n",
        )
        .unwrap();

        let config = KilnConfig::with_cli_args(
            dir.path().to_path_buf(),
            true,
            Some(ProviderKind::Memory),
            false,
        )
        .unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.store_dir(), root.join(".kiln/projects"));
        assert_eq!(config.sandbox_root(), root.join(".kiln/sandboxes"));
        assert_eq!(config.log_dir(), Some(root.join("logs")));
        assert_eq!(config.toml.sandbox.provider, ProviderKind::Memory);
        assert!(config.verbose);
    }

    #[test]
    fn test_component_settings() {
        let mut toml = KilnToml::default();
        toml.sandbox.settle_delay_ms = 250;
        toml.apply.restart_after_install = false;
        let config = KilnConfig {
            project_dir: PathBuf::from("/tmp/p"),
            kiln_dir: PathBuf::from("/tmp/p/.kiln"),
            toml,
            verbose: false,
        };
        let manager = config.manager_settings();
        assert_eq!(manager.settle_delay, Duration::from_millis(250));
        assert_eq!(manager.provision.port, 5173);
        assert!(!config.engine_settings().restart_after_install);
        assert_eq!(config.generation_settings().model, "openai/gpt-4o");
    }
}
