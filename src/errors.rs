//! Typed error hierarchy for the promotion pipeline.
//!
//! Every component owns one error enum and classifies it into an [`ErrorKind`]:
//! - `RevisionError` — revision identification failures
//! - `PublishError` — build and registry failures
//! - `ComposeError` — desired-state document failures
//! - `SubmitError` — state-store failures
//!
//! The coordinator wraps whichever one ended a run in a [`PipelineError`],
//! which names the stage that was being entered.

use std::time::Duration;

use thiserror::Error;

use crate::coordinator::Stage;

/// Exit code for a run that reached `Completed`.
pub const EXIT_OK: i32 = 0;
/// Exit code for failures outside the pipeline taxonomy (config, I/O).
pub const EXIT_OTHER: i32 = 1;
/// Exit code for a run that was superseded by a newer revision or cancelled.
pub const EXIT_SUPERSEDED: i32 = 11;

/// Error taxonomy shared by every pipeline component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRevision,
    BuildFailure,
    AuthFailure,
    TransientPublishFailure,
    TransientNetworkFailure,
    RemoteRejected,
    UnparseableDocument,
    /// The tag already holds an artifact that cannot be reconciled with this build.
    ArtifactConflict,
    /// A proposal for this revision exists but is no longer open.
    ProposalClosed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRevision => "InvalidRevision",
            Self::BuildFailure => "BuildFailure",
            Self::AuthFailure => "AuthFailure",
            Self::TransientPublishFailure => "TransientPublishFailure",
            Self::TransientNetworkFailure => "TransientNetworkFailure",
            Self::RemoteRejected => "RemoteRejected",
            Self::UnparseableDocument => "UnparseableDocument",
            Self::ArtifactConflict => "ArtifactConflict",
            Self::ProposalClosed => "ProposalClosed",
        }
    }

    /// Whether the owning component may retry the call with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientPublishFailure | Self::TransientNetworkFailure
        )
    }

    /// Stable process exit code for a run that failed with this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidRevision => 2,
            Self::BuildFailure => 3,
            Self::AuthFailure => 4,
            Self::TransientPublishFailure => 5,
            Self::TransientNetworkFailure => 6,
            Self::RemoteRejected => 7,
            Self::UnparseableDocument => 8,
            Self::ArtifactConflict => 9,
            Self::ProposalClosed => 10,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every component error so the retry helper and the
/// coordinator can reason about it without knowing the concrete type.
pub trait Classify: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

/// Errors of components that make network calls through the retry helper.
pub trait Retryable: Classify + Sized {
    /// Error to report when a network call exceeded its deadline.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

/// Errors from the revision identifier.
#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("trigger carries no resolvable source reference")]
    Missing,

    #[error("revision '{value}' contains no characters usable in a tag or branch name")]
    Unusable { value: String },

    #[error("failed to resolve HEAD of {path}: {message}")]
    Unresolvable {
        path: std::path::PathBuf,
        message: String,
    },
}

impl Classify for RevisionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRevision
    }
}

/// Errors from the build step and the registry.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("build failed for {platform}: {message}")]
    Build { platform: String, message: String },

    #[error("registry rejected credentials: {0}")]
    Auth(String),

    #[error("registry unavailable: {0}")]
    Transient(String),

    #[error("registry refused artifact ({status}): {message}")]
    Refused { status: u16, message: String },

    #[error("tag {tag} already holds a different artifact: {message}")]
    Conflict { tag: String, message: String },
}

impl Classify for PublishError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Build { .. } | Self::Refused { .. } => ErrorKind::BuildFailure,
            Self::Auth(_) => ErrorKind::AuthFailure,
            Self::Transient(_) => ErrorKind::TransientPublishFailure,
            Self::Conflict { .. } => ErrorKind::ArtifactConflict,
        }
    }
}

impl Retryable for PublishError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Transient(format!("{} timed out after {:?}", operation, after))
    }
}

/// Errors from the proposal composer.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("document is not valid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("document has no image reference for repository '{repository}'")]
    NoImage { repository: String },

    #[error("unrecognized document shape: {0}")]
    Shape(String),
}

impl Classify for ComposeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::UnparseableDocument
    }
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("state store rejected credentials: {0}")]
    Auth(String),

    #[error("state store refused the write: {0}")]
    Rejected(String),

    #[error("state store unavailable: {0}")]
    Transient(String),

    #[error("proposal {url} for revision {revision} is already {state}; refusing to recreate it")]
    ProposalClosed {
        revision: String,
        url: String,
        state: String,
    },
}

impl Classify for SubmitError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::AuthFailure,
            Self::Rejected(_) => ErrorKind::RemoteRejected,
            Self::Transient(_) => ErrorKind::TransientNetworkFailure,
            Self::ProposalClosed { .. } => ErrorKind::ProposalClosed,
        }
    }
}

impl Retryable for SubmitError {
    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Transient(format!("{} timed out after {:?}", operation, after))
    }
}

/// Terminal failure of a pipeline run: `Failed(stage, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("failed entering {stage}: {kind}: {message}")]
pub struct PipelineError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn new<E: Classify>(stage: Stage, err: &E) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Exit code for an error that escaped the pipeline, such as a client that
/// could not be constructed. Missing or rejected credentials keep their own
/// code; everything else is a configuration or I/O problem.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    let kind = err
        .downcast_ref::<SubmitError>()
        .map(Classify::kind)
        .or_else(|| err.downcast_ref::<PublishError>().map(Classify::kind));
    match kind {
        Some(ErrorKind::AuthFailure) => ErrorKind::AuthFailure.exit_code(),
        _ => EXIT_OTHER,
    }
}
