//! Project configuration read from `.promote/promote.toml`.
//!
//! Every field is optional; a missing file is equivalent to an empty one.
//! Settings are layered file → environment → CLI (the last two applied by
//! [`crate::config::Config`]). Credentials never live in this file.
//!
//! # Configuration File Format
//!
//! ```toml
//! [lane]
//! name = "myapp"
//!
//! [revision]
//! abbrev_len = 7
//!
//! [registry]
//! repository = "registry.example.com/team/myapp"
//! insecure = false
//! alias = "latest"
//!
//! [build]
//! command = "docker buildx build --platform {platform} --output type=oci,dest={output} {context}"
//! work_dir = ".promote/build"
//! platforms = ["linux/amd64", "linux/arm64"]
//!
//! [state_store]
//! repository = "acme/deploy"
//! base_branch = "main"
//! document = "apps/myapp/deployment.yaml"
//! branch_prefix = "update-"
//!
//! [retry]
//! max_attempts = 4
//! initial_backoff_ms = 500
//! max_backoff_ms = 8000
//!
//! [timeouts]
//! call_secs = 60
//! build_secs = 1800
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::publish::Platform;
use crate::publish::registry::split_repository;
use crate::retry::RetryPolicy;
use crate::submit::DEFAULT_BRANCH_PREFIX;
use crate::submit::github::{DEFAULT_API_URL, parse_owner_repo};

/// File name inside the `.promote/` directory.
pub const CONFIG_FILE: &str = "promote.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneSection {
    /// Logical track revisions are promoted along (usually the app name).
    #[serde(default = "default_lane")]
    pub name: String,
}

fn default_lane() -> String {
    "default".to_string()
}

impl Default for LaneSection {
    fn default() -> Self {
        Self {
            name: default_lane(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionSection {
    /// Length commit ids are abbreviated to.
    #[serde(default = "default_abbrev_len")]
    pub abbrev_len: usize,
}

fn default_abbrev_len() -> usize {
    7
}

impl Default for RevisionSection {
    fn default() -> Self {
        Self {
            abbrev_len: default_abbrev_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySection {
    /// `host[:port]/path/to/name`
    #[serde(default)]
    pub repository: String,
    /// Talk plain HTTP (local test registries).
    #[serde(default)]
    pub insecure: bool,
    /// Floating tag moved after each publish. Empty disables it.
    #[serde(default = "default_alias")]
    pub alias: Option<String>,
}

fn default_alias() -> Option<String> {
    Some("latest".to_string())
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            repository: String::new(),
            insecure: false,
            alias: default_alias(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildSection {
    /// Command template run once per platform through `sh -c`.
    #[serde(default = "default_build_command")]
    pub command: String,
    /// Scratch directory for build outputs, relative to the project.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    /// Target platforms, `os/arch[/variant]`.
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,
}

fn default_build_command() -> String {
    "docker buildx build --platform {platform} --output type=oci,dest={output} {context}".to_string()
}

fn default_work_dir() -> String {
    ".promote/build".to_string()
}

fn default_platforms() -> Vec<String> {
    vec!["linux/amd64".to_string()]
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            command: default_build_command(),
            work_dir: default_work_dir(),
            platforms: default_platforms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateStoreSection {
    /// `owner/repo` or a GitHub URL.
    #[serde(default)]
    pub repository: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Path of the desired-state document inside the repository.
    #[serde(default = "default_document")]
    pub document: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_document() -> String {
    "deployment.yaml".to_string()
}

fn default_branch_prefix() -> String {
    DEFAULT_BRANCH_PREFIX.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for StateStoreSection {
    fn default() -> Self {
        Self {
            repository: String::new(),
            base_branch: default_base_branch(),
            document: default_document(),
            branch_prefix: default_branch_prefix(),
            api_url: default_api_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutsSection {
    /// Deadline for each registry or state-store call.
    #[serde(default = "default_call_secs")]
    pub call_secs: u64,
    /// Deadline for one platform build.
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,
}

fn default_call_secs() -> u64 {
    60
}

fn default_build_secs() -> u64 {
    1800
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            call_secs: default_call_secs(),
            build_secs: default_build_secs(),
        }
    }
}

/// Contents of `promote.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromoteToml {
    #[serde(default)]
    pub lane: LaneSection,
    #[serde(default)]
    pub revision: RevisionSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub state_store: StateStoreSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

impl PromoteToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse promote.toml")
    }

    /// Load `promote.toml` from `promote_dir`, or defaults when it is absent.
    pub fn load_or_default(promote_dir: &Path) -> Result<Self> {
        let config_path = promote_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize promote.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            call_timeout: self.call_timeout(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.call_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.build_secs)
    }

    /// Parsed target platforms. Fails on the first malformed entry.
    pub fn platforms(&self) -> Result<Vec<Platform>> {
        self.build
            .platforms
            .iter()
            .map(|p| {
                p.parse::<Platform>()
                    .map_err(|e| anyhow::anyhow!("Invalid platform '{}': {}", p, e))
            })
            .collect()
    }

    /// Lane name, if it is usable in proposal titles and markers.
    pub fn lane(&self) -> Result<&str> {
        let name = self.lane.name.as_str();
        if !is_valid_lane_name(name) {
            anyhow::bail!(
                "Invalid lane name '{}': use letters, digits, '-', '_', '.' or '/'",
                name
            );
        }
        Ok(name)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.lane.name.trim().is_empty() {
            warnings.push("lane.name is empty".to_string());
        } else if !is_valid_lane_name(&self.lane.name) {
            warnings.push(format!(
                "Invalid lane.name '{}': use letters, digits, '-', '_', '.' or '/'",
                self.lane.name
            ));
        }

        if self.registry.repository.is_empty() {
            warnings.push("registry.repository is not set".to_string());
        } else if split_repository(&self.registry.repository).is_none() {
            warnings.push(format!(
                "Invalid registry.repository '{}': expected host/name, e.g. registry.example.com/team/app",
                self.registry.repository
            ));
        }

        if self.state_store.repository.is_empty() {
            warnings.push("state_store.repository is not set".to_string());
        } else if parse_owner_repo(&self.state_store.repository).is_none() {
            warnings.push(format!(
                "Invalid state_store.repository '{}': expected owner/repo or a github.com URL",
                self.state_store.repository
            ));
        }

        if self.state_store.document.trim().is_empty() {
            warnings.push("state_store.document is empty".to_string());
        }
        if self.state_store.branch_prefix.is_empty() {
            warnings.push(
                "state_store.branch_prefix is empty; proposal branches would be bare revision ids"
                    .to_string(),
            );
        }

        if self.build.platforms.is_empty() {
            warnings.push("build.platforms is empty".to_string());
        }
        for platform in &self.build.platforms {
            if let Err(e) = platform.parse::<Platform>() {
                warnings.push(format!("Invalid platform '{}': {}", platform, e));
            }
        }
        if !self.build.command.contains("{output}") {
            warnings.push(
                "build.command has no {output} placeholder; the tool must write to $PROMOTE_OUTPUT"
                    .to_string(),
            );
        }

        if self.revision.abbrev_len < 4 || self.revision.abbrev_len > 40 {
            warnings.push(format!(
                "revision.abbrev_len {} is outside 4..=40 and will be clamped",
                self.revision.abbrev_len
            ));
        }
        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; calls are attempted once".to_string());
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            warnings.push(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            ));
        }
        if self.timeouts.call_secs == 0 {
            warnings.push("timeouts.call_secs is 0; every remote call would time out".to_string());
        }
        if self.timeouts.build_secs == 0 {
            warnings.push("timeouts.build_secs is 0; every build would time out".to_string());
        }

        warnings
    }
}

pub fn is_valid_lane_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}
