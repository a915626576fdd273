//! Pipeline run state: stages, outcomes and the persisted report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compose::DocumentDiff;
use crate::errors::{EXIT_OK, EXIT_SUPERSEDED, PipelineError};
use crate::publish::ArtifactRef;
use crate::revision::Revision;
use crate::submit::ProposalRef;

/// Forward-only stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Started,
    Identified,
    Published,
    Proposed,
    Completed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::Identified => "Identified",
            Self::Published => "Published",
            Self::Proposed => "Proposed",
            Self::Completed => "Completed",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Started => Some(Self::Identified),
            Self::Identified => Some(Self::Published),
            Self::Published => Some(Self::Proposed),
            Self::Proposed => Some(Self::Completed),
            Self::Completed => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Only single steps forward are valid; nothing leaves `Completed`.
pub fn is_valid_transition(from: Stage, to: Stage) -> bool {
    from.next() == Some(to)
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { error: PipelineError },
    /// A newer revision of the lane was already proposed; this run's proposal was suppressed.
    Superseded { by_revision: Option<String> },
    Cancelled { reason: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => EXIT_OK,
            Self::Failed { error } => error.kind.exit_code(),
            Self::Superseded { .. } | Self::Cancelled { .. } => EXIT_SUPERSEDED,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "Completed"),
            Self::Failed { error } => write!(f, "Failed({}, {})", error.stage, error.kind),
            Self::Superseded { by_revision: Some(rev) } => write!(f, "Superseded by {}", rev),
            Self::Superseded { by_revision: None } => write!(f, "Superseded"),
            Self::Cancelled { .. } => write!(f, "Cancelled"),
        }
    }
}

/// Everything an operator needs to see (or resume from) after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub lane: String,
    pub sequence: u64,
    /// Reference as given by the trigger, before identification.
    pub requested: Option<String>,
    pub revision: Option<Revision>,
    /// Last stage whose side effect was committed.
    pub stage: Stage,
    pub artifact: Option<ArtifactRef>,
    pub diff: Option<DocumentDiff>,
    pub proposal: Option<ProposalRef>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    /// Human-readable summary for the terminal.
    pub fn summary(&self) -> String {
        let revision = self
            .revision
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.requested.clone())
            .unwrap_or_else(|| "HEAD".to_string());
        let mut out = format!("{} {} @ {}: {}\n", self.lane, revision, self.stage, self.outcome);

        if let Some(artifact) = &self.artifact {
            out.push_str(&format!("  artifact  {}\n", artifact));
        }
        match (&self.proposal, &self.diff) {
            (Some(proposal), _) => out.push_str(&format!("  proposal  {}\n", proposal)),
            (None, Some(diff)) if diff.is_empty() => {
                out.push_str("  proposal  none (document already current)\n")
            }
            _ => {}
        }
        match &self.outcome {
            RunOutcome::Failed { error } => {
                out.push_str(&format!("  error     {}\n", error.message));
                if self.artifact.is_some() {
                    out.push_str("  resume    the artifact is published; re-running this revision reuses it\n");
                }
            }
            RunOutcome::Cancelled { reason } => out.push_str(&format!("  reason    {}\n", reason)),
            _ => {}
        }
        out.push_str(&format!(
            "  run       {} ({} ms)\n",
            self.run_id,
            (self.finished_at - self.started_at).num_milliseconds()
        ));
        out
    }

    /// Write the report as `<dir>/<revision>.json` (run id when no revision
    /// was identified). Returns the written path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let name = match &self.revision {
            Some(rev) => format!("{}.json", rev),
            None => format!("{}.json", self.run_id),
        };
        let path = dir.join(name);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write run report {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run report {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run report {}", path.display()))
    }
}
