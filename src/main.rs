use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

use promote::errors::exit_code_for;

mod cmd;

#[derive(Parser)]
#[command(name = "promote")]
#[command(
    version,
    about = "Publish an artifact per revision and propose the desired-state change"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline for one revision
    Run(RunArgs),
    /// Print the identifier a revision would be published under
    Identify {
        /// Commit id, tag or branch name (defaults to the context's git HEAD)
        #[arg(short, long)]
        revision: Option<String>,

        /// Build context used to resolve HEAD
        #[arg(short, long, default_value = ".")]
        context: PathBuf,
    },
    /// Preview the change an artifact would make to a local document
    Compose {
        /// Desired-state document on disk
        #[arg(short, long)]
        document: PathBuf,

        /// Artifact reference, `repository:tag`
        #[arg(short, long)]
        artifact: String,
    },
    /// Show saved run reports
    Report {
        /// Revision to show in full (lists all reports when omitted)
        revision: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(clap::Args, Clone)]
pub struct RunArgs {
    /// Commit id, tag or branch name (defaults to the context's git HEAD)
    #[arg(short, long)]
    pub revision: Option<String>,

    /// Build context directory
    #[arg(short, long, default_value = ".")]
    pub context: PathBuf,

    /// Lane to promote along (overrides promote.toml)
    #[arg(short, long)]
    pub lane: Option<String>,

    /// Target platform, repeatable (overrides promote.toml)
    #[arg(short, long = "platform")]
    pub platforms: Vec<String>,

    /// Document path inside the state store (overrides promote.toml)
    #[arg(short, long)]
    pub document: Option<String>,

    /// Identify and compose only; nothing is built, published or submitted
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default promote.toml file
    Init,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    promote::logging::init(cli.verbose, cli.log_json);

    match dispatch(&cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::from(exit_code_for(&e) as u8)
        }
    }
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(cli, project_dir, args).await,
        Commands::Identify { revision, context } => {
            cmd::cmd_identify(&project_dir, revision.as_deref(), context)
        }
        Commands::Compose { document, artifact } => cmd::cmd_compose(document, artifact),
        Commands::Report { revision } => cmd::cmd_report(&project_dir, revision.as_deref()),
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
    }
}
