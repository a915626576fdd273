use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::promote_config::{CONFIG_FILE, PromoteToml};
use crate::publish::RegistryCredentials;

/// Environment variables that override file settings.
pub const ENV_LANE: &str = "PROMOTE_LANE";
pub const ENV_REGISTRY_REPOSITORY: &str = "PROMOTE_REGISTRY_REPOSITORY";
pub const ENV_STATE_STORE_REPOSITORY: &str = "PROMOTE_STATE_STORE_REPOSITORY";
pub const ENV_DOCUMENT: &str = "PROMOTE_DOCUMENT";

/// Credential variables. These are never read from `promote.toml`.
pub const ENV_REGISTRY_USERNAME: &str = "PROMOTE_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "PROMOTE_REGISTRY_PASSWORD";
pub const ENV_STATE_STORE_TOKEN: &str = "PROMOTE_STATE_STORE_TOKEN";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

/// Secrets for the two remote scopes.
#[derive(Clone, Default)]
pub struct Credentials {
    pub registry: Option<RegistryCredentials>,
    pub state_store_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("registry", &self.registry.as_ref().map(|c| &c.username))
            .field("state_store_token", &self.state_store_token.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve credentials through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let registry = match (get(ENV_REGISTRY_USERNAME), get(ENV_REGISTRY_PASSWORD)) {
            (Some(username), Some(password)) => Some(RegistryCredentials { username, password }),
            _ => None,
        };
        let state_store_token = get(ENV_STATE_STORE_TOKEN).or_else(|| get(ENV_GITHUB_TOKEN));

        Self {
            registry,
            state_store_token,
        }
    }
}

/// Runtime configuration.
///
/// Merges `promote.toml`, environment overrides and CLI flags, and knows
/// where everything under `.promote/` lives.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub promote_dir: PathBuf,
    pub toml: PromoteToml,
    pub credentials: Credentials,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for `project_dir`, applying environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let promote_dir = project_dir.join(".promote");
        let mut toml = PromoteToml::load_or_default(&promote_dir)?;
        apply_env(&mut toml, |key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            promote_dir,
            toml,
            credentials: Credentials::from_env(),
            verbose: false,
        })
    }

    /// Create Config with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.promote_dir.join(CONFIG_FILE)
    }

    /// Run reports, one JSON file per revision.
    pub fn runs_dir(&self) -> PathBuf {
        self.promote_dir.join("runs")
    }

    /// Scratch directory for build outputs.
    pub fn build_dir(&self) -> PathBuf {
        self.resolve(Path::new(&self.toml.build.work_dir))
    }

    /// Interpret `path` relative to the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.runs_dir()).context("Failed to create runs directory")?;
        Ok(())
    }

    /// File warnings plus missing credentials.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if self.credentials.registry.is_none() {
            warnings.push(format!(
                "No registry credentials; set {} and {} unless the registry allows anonymous pushes",
                ENV_REGISTRY_USERNAME, ENV_REGISTRY_PASSWORD
            ));
        }
        match &self.credentials.state_store_token {
            None => warnings.push(format!(
                "No state store token; set {} or {}",
                ENV_STATE_STORE_TOKEN, ENV_GITHUB_TOKEN
            )),
            Some(token) if !crate::submit::github::is_valid_github_token(token) => {
                warnings.push(
                    "State store token does not look like a GitHub token (expected ghp_, gho_, ghs_ or github_pat_ prefix)"
                        .to_string(),
                )
            }
            Some(_) => {}
        }
        warnings
    }
}

/// Environment overrides on top of the file.
pub fn apply_env(toml: &mut PromoteToml, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(lane) = get(ENV_LANE) {
        toml.lane.name = lane;
    }
    if let Some(repository) = get(ENV_REGISTRY_REPOSITORY) {
        toml.registry.repository = repository;
    }
    if let Some(repository) = get(ENV_STATE_STORE_REPOSITORY) {
        toml.state_store.repository = repository;
    }
    if let Some(document) = get(ENV_DOCUMENT) {
        toml.state_store.document = document;
    }
}
