//! Daemon configuration
//!
//! Loaded once at startup from a TOML file (path from `AIDEV_CONFIG`,
//! default `./aidev.toml`). Scalar daemon settings can be overridden from
//! the environment so the same file works across deployments.

use aidev_core::domain::provider::{
    ProviderId, ProviderProfile, QuotaCeiling, QuotaWindowKind, Role, RoleBinding,
};
use aidev_core::domain::run::RetryBudgets;
use aidev_gateway::{HealthPolicy, RoleProfile};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::service::review::LanguageTarget;

const DEFAULT_CONFIG_PATH: &str = "aidev.toml";

/// Complete daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Retry budget per pipeline step
    #[serde(default)]
    pub retries: RetryBudgets,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Role bindings, keyed by role name
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,

    #[serde(default)]
    pub projects: Vec<ProjectConfig>,

    /// GitHub token, taken from `GITHUB_TOKEN` only
    #[serde(skip)]
    pub github_token: Option<String>,
}

/// Process-level settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How often to poll the issue tracker
    pub poll_interval_secs: u64,

    /// How often queued and resumable runs are admitted
    pub tick_interval_secs: u64,

    /// Label that marks an issue for autonomous resolution
    pub trigger_label: String,

    /// Runs allowed in coding or testing at the same time; bounded by
    /// sandbox capacity
    pub max_concurrent_runs: usize,

    /// Runs driven at the same time, at most one per project
    pub max_workers: usize,

    pub api_bind_addr: String,

    /// Checkpoints, archive and the audit log live here
    pub state_dir: PathBuf,

    /// Bound on a single provider call
    pub gateway_timeout_secs: u64,

    /// Bound on a single collaborator call (git, sandbox, tracker)
    pub collaborator_timeout_secs: u64,

    /// First backoff delay before a collaborator retry
    pub retry_backoff_ms: u64,

    /// Ask the reviewer role for an advisory opinion on clean candidates
    pub ai_review: bool,

    pub github_api_url: String,

    /// Name and email used for commits
    pub git_author_name: String,
    pub git_author_email: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            tick_interval_secs: 5,
            trigger_label: "aidev".to_string(),
            max_concurrent_runs: 2,
            max_workers: 8,
            api_bind_addr: "127.0.0.1:8700".to_string(),
            state_dir: PathBuf::from("./state"),
            gateway_timeout_secs: 180,
            collaborator_timeout_secs: 900,
            retry_backoff_ms: 2_000,
            ai_review: false,
            github_api_url: "https://api.github.com".to_string(),
            git_author_name: "aidev".to_string(),
            git_author_email: "aidev@localhost".to_string(),
        }
    }
}

/// Provider health tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.failure_threshold,
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

/// One provider+model pair
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, e.g. `nvidia`
    pub name: String,
    pub model: String,
    /// OpenAI-compatible API root, e.g. `https://integrate.api.nvidia.com/v1`
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Roles this profile may serve; empty means any bound role
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_window")]
    pub window: QuotaWindowKind,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window() -> QuotaWindowKind {
    QuotaWindowKind::Fixed
}

fn default_window_secs() -> u64 {
    86_400
}

impl ProviderConfig {
    pub fn id(&self) -> ProviderId {
        ProviderId::new(&self.name, &self.model)
    }

    pub fn profile(&self) -> ProviderProfile {
        ProviderProfile::new(
            self.id(),
            self.roles.clone(),
            QuotaCeiling {
                max_requests: self.max_requests,
                max_tokens: self.max_tokens,
                window: self.window,
                window_secs: self.window_secs,
            },
        )
    }
}

/// Binding and sampling overrides for one role
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    /// Ordered `provider:model` ids, primary first
    pub providers: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
}

impl RoleConfig {
    pub fn binding(&self, role: Role) -> Result<RoleBinding> {
        let providers = self
            .providers
            .iter()
            .map(|s| s.parse::<ProviderId>().map_err(|e| anyhow::anyhow!(e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(RoleBinding { role, providers })
    }

    /// Built-in role settings with this entry's overrides applied
    pub fn role_profile(&self, role: Role) -> RoleProfile {
        let mut profile = RoleProfile::default_for(role);
        if let Some(prompt) = &self.system_prompt {
            profile.system_prompt = prompt.clone();
        }
        if let Some(max_tokens) = self.max_tokens {
            profile.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            profile.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            profile.top_p = top_p;
        }
        profile
    }
}

/// A repository the daemon resolves issues for
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// GitHub repository in `owner/repo` form
    pub repo: String,
    /// Local checkout the daemon owns
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default)]
    pub test_image: Option<String>,
    /// Shell command run inside the test image; no tests when unset
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// Target language and minimum version, e.g. `php` / `5.6`
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub language_version: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

impl ProjectConfig {
    pub fn language_target(&self) -> Result<Option<LanguageTarget>> {
        match (&self.language, &self.language_version) {
            (Some(language), Some(version)) => LanguageTarget::parse(language, version)
                .map(Some)
                .map_err(|e| anyhow::anyhow!("project '{}': {}", self.name, e)),
            (None, None) => Ok(None),
            _ => anyhow::bail!(
                "project '{}': language and language_version must be set together",
                self.name
            ),
        }
    }
}

impl Config {
    /// Loads the file named by `AIDEV_CONFIG` (or `./aidev.toml`) and applies
    /// environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var("AIDEV_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies environment overrides through `lookup`
    ///
    /// - AIDEV_POLL_INTERVAL (seconds)
    /// - AIDEV_MAX_CONCURRENT_RUNS
    /// - AIDEV_MAX_WORKERS
    /// - AIDEV_API_BIND_ADDR
    /// - AIDEV_STATE_DIR
    /// - GITHUB_TOKEN
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = lookup("AIDEV_POLL_INTERVAL").and_then(|s| s.parse::<u64>().ok()) {
            self.daemon.poll_interval_secs = secs;
        }
        if let Some(n) = lookup("AIDEV_MAX_CONCURRENT_RUNS").and_then(|s| s.parse::<usize>().ok())
        {
            self.daemon.max_concurrent_runs = n;
        }
        if let Some(n) = lookup("AIDEV_MAX_WORKERS").and_then(|s| s.parse::<usize>().ok()) {
            self.daemon.max_workers = n;
        }
        if let Some(addr) = lookup("AIDEV_API_BIND_ADDR") {
            self.daemon.api_bind_addr = addr;
        }
        if let Some(dir) = lookup("AIDEV_STATE_DIR") {
            self.daemon.state_dir = PathBuf::from(dir);
        }
        self.github_token = lookup("GITHUB_TOKEN").filter(|t| !t.is_empty());
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.poll_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.tick_interval_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.gateway_timeout_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.collaborator_timeout_secs)
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Role bindings parsed into provider ids
    pub fn bindings(&self) -> Result<Vec<RoleBinding>> {
        self.roles
            .iter()
            .map(|(name, cfg)| {
                let role = name.parse::<Role>().map_err(|e| anyhow::anyhow!(e))?;
                cfg.binding(role)
            })
            .collect()
    }

    /// Role profiles with configured overrides, one per bound role
    pub fn role_profiles(&self) -> Result<Vec<(Role, RoleProfile)>> {
        self.roles
            .iter()
            .map(|(name, cfg)| {
                let role = name.parse::<Role>().map_err(|e| anyhow::anyhow!(e))?;
                Ok((role, cfg.role_profile(role)))
            })
            .collect()
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than 0");
        }
        if self.daemon.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be greater than 0");
        }
        if self.daemon.max_concurrent_runs == 0 {
            anyhow::bail!("max_concurrent_runs must be greater than 0");
        }
        if self.daemon.max_workers == 0 {
            anyhow::bail!("max_workers must be greater than 0");
        }
        if self.daemon.gateway_timeout_secs == 0 || self.daemon.collaborator_timeout_secs == 0 {
            anyhow::bail!("timeouts must be greater than 0");
        }
        if self.daemon.trigger_label.trim().is_empty() {
            anyhow::bail!("trigger_label cannot be empty");
        }

        let mut known = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() || provider.model.is_empty() {
                anyhow::bail!("provider name and model cannot be empty");
            }
            if !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                anyhow::bail!(
                    "provider {}: base_url must start with http:// or https://",
                    provider.id()
                );
            }
            if provider.window_secs == 0 {
                anyhow::bail!("provider {}: window_secs must be greater than 0", provider.id());
            }
            if provider.max_requests == Some(0) || provider.max_tokens == Some(0) {
                anyhow::bail!("provider {}: quota ceilings must be greater than 0", provider.id());
            }
            if !known.insert(provider.id()) {
                anyhow::bail!("provider {} is defined twice", provider.id());
            }
        }

        for required in [Role::Planner, Role::Coder] {
            if !self.roles.contains_key(required.as_str()) {
                anyhow::bail!("role '{}' has no provider binding", required);
            }
        }
        for binding in self.bindings()? {
            if binding.providers.is_empty() {
                anyhow::bail!("role '{}' is bound to no providers", binding.role);
            }
            for id in &binding.providers {
                if !known.contains(id) {
                    anyhow::bail!("role '{}' is bound to unknown provider {}", binding.role, id);
                }
            }
        }

        let mut names = HashSet::new();
        for project in &self.projects {
            if !names.insert(project.name.as_str()) {
                anyhow::bail!("project '{}' is defined twice", project.name);
            }
            if !project.repo.contains('/') {
                anyhow::bail!("project '{}': repo must be in owner/repo form", project.name);
            }
            if project.test_command.is_some() && project.test_image.is_none() {
                anyhow::bail!("project '{}': test_command requires test_image", project.name);
            }
            project.language_target()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[daemon]
poll_interval_secs = 120
max_concurrent_runs = 3
max_workers = 4

[retries]
regeneration = 4

[[providers]]
name = "nvidia"
model = "qwen/qwen3-coder-480b-a35b-instruct"
base_url = "https://integrate.api.nvidia.com/v1"
api_key_env = "NVIDIA_API_KEY"
roles = ["coder"]
max_requests = 1000
window = "rolling"
window_secs = 3600

[[providers]]
name = "openrouter"
model = "meta/llama-3.3-70b"
base_url = "https://openrouter.ai/api/v1"
api_key_env = "OPENROUTER_API_KEY"

[roles.planner]
providers = ["openrouter:meta/llama-3.3-70b"]

[roles.coder]
providers = ["nvidia:qwen/qwen3-coder-480b-a35b-instruct", "openrouter:meta/llama-3.3-70b"]
temperature = 0.05

[[projects]]
name = "shop"
repo = "acme/shop"
path = "/srv/shop"
test_image = "docker.io/library/php:5.6-cli"
test_command = "php tests/run.php"
language = "php"
language_version = "5.6"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.poll_interval(), Duration::from_secs(120));
        assert_eq!(config.daemon.trigger_label, "aidev");
        assert_eq!(config.daemon.max_concurrent_runs, 3);
        assert_eq!(config.daemon.max_workers, 4);
        assert_eq!(config.retries.regeneration, 4);
        assert_eq!(config.retries.coding, RetryBudgets::default().coding);

        let coder = config.providers[0].profile();
        assert_eq!(coder.ceiling.window, QuotaWindowKind::Rolling);
        assert_eq!(coder.ceiling.max_requests, Some(1000));

        let bindings = config.bindings().unwrap();
        let coder_binding = bindings.iter().find(|b| b.role == Role::Coder).unwrap();
        assert_eq!(coder_binding.providers.len(), 2);
        assert_eq!(coder_binding.providers[0].model, "qwen/qwen3-coder-480b-a35b-instruct");

        let profile = config.roles["coder"].role_profile(Role::Coder);
        assert_eq!(profile.temperature, 0.05);

        let project = config.project("shop").unwrap();
        assert_eq!(project.branch, "main");
        assert!(project.language_target().unwrap().is_some());
    }

    #[test]
    fn test_defaults_without_daemon_section() {
        let daemon = DaemonConfig::default();
        assert_eq!(daemon.poll_interval_secs, 300);
        assert_eq!(daemon.trigger_label, "aidev");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::parse(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("AIDEV_POLL_INTERVAL", "30"),
            ("AIDEV_MAX_CONCURRENT_RUNS", "5"),
            ("AIDEV_MAX_WORKERS", "12"),
            ("AIDEV_STATE_DIR", "/var/lib/aidev"),
            ("GITHUB_TOKEN", "ghs_test"),
        ]);
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.daemon.poll_interval_secs, 30);
        assert_eq!(config.daemon.max_concurrent_runs, 5);
        assert_eq!(config.daemon.max_workers, 12);
        assert_eq!(config.daemon.state_dir, PathBuf::from("/var/lib/aidev"));
        assert_eq!(config.github_token.as_deref(), Some("ghs_test"));
    }

    #[test]
    fn test_validation_rejects_unknown_binding() {
        let raw = SAMPLE.replace(
            r#"providers = ["openrouter:meta/llama-3.3-70b"]"#,
            r#"providers = ["ghost:model"]"#,
        );
        let config = Config::parse(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_planner_and_coder() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.roles.remove("planner");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.daemon.max_concurrent_runs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::parse(SAMPLE).unwrap();
        config.daemon.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::parse(SAMPLE).unwrap();
        config.providers[0].max_requests = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_role_name() {
        let raw = format!("{}\n[roles.janitor]\nproviders = [\"openrouter:meta/llama-3.3-70b\"]\n", SAMPLE);
        let config = Config::parse(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_language_pair_must_be_complete() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.projects[0].language_version = None;
        assert!(config.validate().is_err());
    }
}
