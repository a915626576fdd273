//! Pipeline execution — `promote run`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use promote::config::Config;
use promote::coordinator::{Coordinator, PipelineSettings, RunEvent, Stage};
use promote::publish::{CommandBuilder, HttpRegistry, Publisher};
use promote::revision::{RevisionIdentifier, Trigger};
use promote::submit::{GitHubStateStore, Submitter};

use super::super::{Cli, RunArgs};

/// Wire the HTTP collaborators described by `config` into a coordinator.
pub fn build_coordinator(config: &Config) -> Result<Coordinator> {
    let toml = &config.toml;
    let retry = toml.retry_policy();
    let platforms = toml.platforms()?;

    let registry = HttpRegistry::new(
        &toml.registry.repository,
        config.credentials.registry.clone(),
        toml.registry.insecure,
    )
    .context("Failed to configure registry client")?;
    let builder = CommandBuilder::new(&toml.build.command, config.build_dir(), toml.build_timeout());
    let publisher = Publisher::new(Arc::new(builder), Arc::new(registry), retry)
        .with_alias(toml.registry.alias.clone());

    let token = config
        .credentials
        .state_store_token
        .clone()
        .unwrap_or_default();
    let store = GitHubStateStore::with_api_url(
        &toml.state_store.repository,
        &toml.state_store.base_branch,
        &token,
        &toml.state_store.api_url,
    )
    .context("Failed to configure state store client")?;
    let submitter =
        Submitter::new(Arc::new(store), retry).with_branch_prefix(toml.state_store.branch_prefix.clone());

    Ok(Coordinator::new(
        RevisionIdentifier::new(toml.revision.abbrev_len),
        publisher,
        submitter,
        PipelineSettings {
            document_path: toml.state_store.document.clone(),
            platforms,
        },
    ))
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, args: &RunArgs) -> Result<i32> {
    let mut config = Config::with_cli_args(project_dir, cli.verbose)?;
    if let Some(lane) = &args.lane {
        config.toml.lane.name = lane.clone();
    }
    if !args.platforms.is_empty() {
        config.toml.build.platforms = args.platforms.clone();
    }
    if let Some(document) = &args.document {
        config.toml.state_store.document = document.clone();
    }
    config.ensure_directories()?;

    let context = config.resolve(&args.context);
    let trigger = Trigger::new(args.revision.as_deref(), context, config.toml.lane()?);
    let coordinator = build_coordinator(&config)?;

    if args.dry_run {
        return dry_run(&coordinator, &trigger).await;
    }

    let mut events = coordinator.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RunEvent::StageEntered {
                    stage, revision, ..
                }) if stage != Stage::Started => {
                    eprintln!(
                        "  {} {} {}",
                        style("→").dim(),
                        style(stage).cyan(),
                        style(revision.unwrap_or_default()).dim()
                    );
                }
                Ok(RunEvent::CancelRequested { reason, .. }) => {
                    eprintln!("  {} {}", style("cancelling:").yellow(), reason);
                }
                Ok(RunEvent::RunFinished { .. }) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    });

    let handle = coordinator.trigger(trigger);
    let run_id = handle.run_id;
    let canceller = coordinator.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel(run_id, "interrupted");
        }
    });

    let report = handle.wait().await.context("Pipeline task panicked")?;
    interrupt.abort();
    let _ = progress.await;

    print!("{}", report.summary());
    let path = report.save(&config.runs_dir())?;
    eprintln!("{}", style(format!("report: {}", path.display())).dim());

    Ok(report.exit_code())
}

async fn dry_run(coordinator: &Coordinator, trigger: &Trigger) -> Result<i32> {
    match coordinator.preview(trigger).await {
        Ok(preview) => {
            println!("revision  {}", preview.revision);
            println!("artifact  {}", preview.artifact.reference());
            if preview.diff.is_empty() {
                println!("document  already current, nothing to propose");
            } else {
                println!();
                print!("{}", preview.diff.render());
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            Ok(e.kind.exit_code())
        }
    }
}
