//! State-store collaborator interface and the proposal types it deals in.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::SubmitError;

static MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<!--\s*promote:lane=("(?:[^"\\]|\\.)*")\s+revision=(\S+)\s+sequence=(\d+)\s*-->"#).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalState {
    Open,
    Closed,
    Merged,
}

impl std::fmt::Display for ProposalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// A review request against the desired-state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRef {
    pub number: u64,
    pub url: String,
    pub branch: String,
    pub title: String,
    pub state: ProposalState,
    #[serde(default)]
    pub body: String,
}

impl ProposalRef {
    pub fn is_open(&self) -> bool {
        self.state == ProposalState::Open
    }

    /// Lane bookkeeping embedded in the body, if this proposal was opened by us.
    pub fn marker(&self) -> Option<ProposalMarker> {
        ProposalMarker::parse(&self.body)
    }
}

impl std::fmt::Display for ProposalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.url)
    }
}

/// Hidden comment identifying the lane, revision and recency of a proposal,
/// so siblings can be found and ordered across processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalMarker {
    pub lane: String,
    pub revision: String,
    pub sequence: u64,
}

impl ProposalMarker {
    /// The lane is written as a JSON string so any name survives the round trip.
    pub fn render(&self) -> String {
        format!(
            "<!-- promote:lane={} revision={} sequence={} -->",
            serde_json::Value::String(self.lane.clone()),
            self.revision,
            self.sequence
        )
    }

    pub fn parse(body: &str) -> Option<Self> {
        let caps = MARKER_REGEX.captures(body)?;
        Some(Self {
            lane: serde_json::from_str(&caps[1]).ok()?,
            revision: caps[2].to_string(),
            sequence: caps[3].parse().ok()?,
        })
    }
}

/// Reviewable store holding the desired-state document.
///
/// Writes only ever go to disposable proposal branches; the base branch is
/// changed by humans merging proposals.
#[async_trait]
pub trait StateStoreClient: Send + Sync {
    /// Document content on the base branch.
    async fn read_document(&self, path: &str) -> Result<String, SubmitError>;

    /// Point `branch` at the base branch plus one commit writing `content` to `path`.
    async fn create_or_update_branch(
        &self,
        branch: &str,
        path: &str,
        content: &str,
        message: &str,
    ) -> Result<(), SubmitError>;

    async fn open_or_update_proposal(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<ProposalRef, SubmitError>;

    async fn close_proposal(&self, proposal: &ProposalRef) -> Result<(), SubmitError>;

    /// Most recent proposal from `branch`, in any state.
    async fn find_proposal(&self, branch: &str) -> Result<Option<ProposalRef>, SubmitError>;

    /// Every open proposal against the base branch.
    async fn list_open_proposals(&self) -> Result<Vec<ProposalRef>, SubmitError>;

    /// Proposals against the base branch created at or after `since`, in
    /// any state.
    async fn list_proposals_since(&self, since: DateTime<Utc>) -> Result<Vec<ProposalRef>, SubmitError>;

    async fn delete_branch(&self, branch: &str) -> Result<(), SubmitError>;
}
