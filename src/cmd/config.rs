//! Configuration view and validation commands — `promote config`.

use anyhow::Result;
use std::path::Path;

use promote::config::Config;
use promote::errors::EXIT_OK;
use promote::promote_config::PromoteToml;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<i32> {
    let config = Config::new(project_dir.to_path_buf())?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Promote Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No promote.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let toml = &config.toml;
            println!("[lane]");
            println!("  name = \"{}\"", toml.lane.name);
            println!();
            println!("[revision]");
            println!("  abbrev_len = {}", toml.revision.abbrev_len);
            println!();
            println!("[registry]");
            println!("  repository = \"{}\"", toml.registry.repository);
            println!("  insecure = {}", toml.registry.insecure);
            println!(
                "  alias = \"{}\"",
                toml.registry.alias.as_deref().unwrap_or_default()
            );
            println!();
            println!("[build]");
            println!("  command = \"{}\"", toml.build.command);
            println!("  work_dir = \"{}\"", toml.build.work_dir);
            println!("  platforms = {:?}", toml.build.platforms);
            println!();
            println!("[state_store]");
            println!("  repository = \"{}\"", toml.state_store.repository);
            println!("  base_branch = \"{}\"", toml.state_store.base_branch);
            println!("  document = \"{}\"", toml.state_store.document);
            println!("  branch_prefix = \"{}\"", toml.state_store.branch_prefix);
            println!("  api_url = \"{}\"", toml.state_store.api_url);
            println!();
            println!("[retry]");
            println!("  max_attempts = {}", toml.retry.max_attempts);
            println!("  initial_backoff_ms = {}", toml.retry.initial_backoff_ms);
            println!("  max_backoff_ms = {}", toml.retry.max_backoff_ms);
            println!();
            println!("[timeouts]");
            println!("  call_secs = {}", toml.timeouts.call_secs);
            println!("  build_secs = {}", toml.timeouts.build_secs);
            println!();

            println!("Credentials (from environment):");
            println!(
                "  registry = {}",
                match &config.credentials.registry {
                    Some(creds) => format!("user '{}'", creds.username),
                    None => "anonymous".to_string(),
                }
            );
            println!(
                "  state_store_token = {}",
                if config.credentials.state_store_token.is_some() {
                    "set"
                } else {
                    "missing"
                }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("promote.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(EXIT_OK);
            }

            std::fs::create_dir_all(&config.promote_dir)?;
            PromoteToml::default().save(&config_path)?;

            println!("Created promote.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [registry] repository to publish to");
            println!("  - [state_store] repository and document to propose changes to");
            println!("  - [build] command and platforms");
            println!();
        }
    }

    Ok(EXIT_OK)
}
