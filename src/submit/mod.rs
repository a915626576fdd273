//! Proposal submission.
//!
//! ## Dedup and supersession
//!
//! A proposal is keyed by its revision through the branch name
//! (`update-<revision>`): an open proposal from that branch is updated in
//! place, a merged or closed one is reported as [`SubmitError::ProposalClosed`].
//!
//! Proposals of the same lane are ordered by the sequence number in their
//! [`ProposalMarker`]. A submission never goes ahead once a newer sibling
//! exists in any state: an open one will win, and a merged one already moved
//! the document past this revision. After its own proposal is open it closes
//! every older open sibling. The newer-sibling check is repeated after opening
//! so two processes racing on the same lane still end with only the newest
//! proposal open.

pub mod github;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compose::DocumentDiff;
use crate::errors::SubmitError;
use crate::publish::ArtifactRef;
use crate::retry::{RetryPolicy, with_retry};
use crate::revision::Revision;

pub use github::GitHubStateStore;
pub use store::{ProposalMarker, ProposalRef, ProposalState, StateStoreClient};

pub const DEFAULT_BRANCH_PREFIX: &str = "update-";

/// Sequences are wall-clock milliseconds from whichever process accepted the
/// trigger; newer siblings are searched this far before our own.
const CLOCK_SKEW_MINUTES: i64 = 10;

/// Everything needed to propose one revision.
#[derive(Debug, Clone)]
pub struct Submission {
    pub revision: Revision,
    pub lane: String,
    /// Recency of the triggering event within the lane.
    pub sequence: u64,
    pub artifact: ArtifactRef,
    pub diff: DocumentDiff,
    /// Full document content with `diff` applied.
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// The proposal for this revision is open.
    Submitted { proposal: ProposalRef },
    /// A newer revision of the lane already has a proposal, open or merged.
    Superseded { by: ProposalRef },
    /// The diff was empty; the base branch already references the artifact.
    NothingToPropose,
}

pub struct Submitter {
    store: Arc<dyn StateStoreClient>,
    retry: RetryPolicy,
    branch_prefix: String,
}

impl Submitter {
    pub fn new(store: Arc<dyn StateStoreClient>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }

    pub fn with_branch_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.branch_prefix = prefix.into();
        self
    }

    pub fn branch_for(&self, revision: &Revision) -> String {
        revision.branch_name(&self.branch_prefix)
    }

    /// Read the base document through the same retry policy.
    pub async fn read_document(&self, path: &str) -> Result<String, SubmitError> {
        let store = &self.store;
        with_retry(&self.retry, "read document", |_| store.read_document(path)).await
    }

    pub async fn submit(&self, submission: &Submission) -> Result<SubmitOutcome, SubmitError> {
        if submission.diff.is_empty() {
            tracing::info!(revision = %submission.revision, "document already current, nothing to propose");
            return Ok(SubmitOutcome::NothingToPropose);
        }

        let store = &self.store;
        let branch = self.branch_for(&submission.revision);
        let revision = submission.revision.as_str();

        let existing = with_retry(&self.retry, "find proposal", |_| store.find_proposal(&branch)).await?;
        if let Some(existing) = existing.as_ref().filter(|p| !p.is_open()) {
            return Err(SubmitError::ProposalClosed {
                revision: revision.to_string(),
                url: existing.url.clone(),
                state: existing.state.to_string(),
            });
        }

        if let Some((newer, marker)) = self.newer_sibling(submission).await? {
            tracing::info!(
                revision,
                lane = %submission.lane,
                newer = %marker.revision,
                state = %newer.state,
                "newer revision already proposed, not submitting"
            );
            return Ok(SubmitOutcome::Superseded { by: newer });
        }

        let message = format!("Promote {} to {}", submission.lane, submission.artifact.reference());
        with_retry(&self.retry, "write branch", |_| {
            store.create_or_update_branch(&branch, &submission.diff.path, &submission.content, &message)
        })
        .await?;

        let title = format!("Promote {} to {}", submission.lane, revision);
        let body = proposal_body(submission);
        let proposal = with_retry(&self.retry, "open proposal", |_| {
            store.open_or_update_proposal(&branch, &title, &body)
        })
        .await?;
        match existing {
            Some(_) => tracing::info!(revision, proposal = %proposal, "proposal updated in place"),
            None => tracing::info!(revision, proposal = %proposal, "proposal opened"),
        }

        // Check again: a concurrent submitter may have proposed meanwhile.
        if let Some((newer, marker)) = self.newer_sibling(submission).await? {
            tracing::warn!(
                revision,
                newer = %marker.revision,
                "newer revision proposed concurrently, withdrawing this proposal"
            );
            self.retire(&proposal).await?;
            return Ok(SubmitOutcome::Superseded { by: newer });
        }
        let siblings = self.open_lane_siblings(submission).await?;
        for (older, marker) in siblings.iter().filter(|(_, m)| m.sequence < submission.sequence) {
            tracing::info!(
                proposal = %older,
                revision = %marker.revision,
                superseded_by = revision,
                "closing superseded proposal"
            );
            self.retire(older).await?;
        }

        Ok(SubmitOutcome::Submitted { proposal })
    }

    /// Newest proposal of the same lane, in any state, triggered after this one.
    async fn newer_sibling(&self, submission: &Submission) -> Result<Option<(ProposalRef, ProposalMarker)>, SubmitError> {
        let triggered_at = DateTime::<Utc>::from_timestamp_millis(submission.sequence as i64).unwrap_or_default();
        let since = triggered_at - chrono::Duration::minutes(CLOCK_SKEW_MINUTES);
        let store = &self.store;
        let recent = with_retry(&self.retry, "list recent proposals", |_| store.list_proposals_since(since)).await?;
        Ok(recent
            .into_iter()
            .filter_map(|p| p.marker().map(|m| (p, m)))
            .filter(|(_, m)| is_sibling(m, submission) && m.sequence > submission.sequence)
            .max_by_key(|(_, m)| m.sequence))
    }

    /// Open proposals of the same lane for other revisions.
    async fn open_lane_siblings(&self, submission: &Submission) -> Result<Vec<(ProposalRef, ProposalMarker)>, SubmitError> {
        let store = &self.store;
        let open = with_retry(&self.retry, "list proposals", |_| store.list_open_proposals()).await?;
        Ok(open
            .into_iter()
            .filter_map(|p| p.marker().map(|m| (p, m)))
            .filter(|(_, m)| is_sibling(m, submission))
            .collect())
    }

    /// Close a proposal, then delete its branch (best effort).
    async fn retire(&self, proposal: &ProposalRef) -> Result<(), SubmitError> {
        let store = &self.store;
        with_retry(&self.retry, "close proposal", |_| store.close_proposal(proposal)).await?;
        let once = RetryPolicy::once(self.retry.call_timeout);
        if let Err(e) = with_retry(&once, "delete branch", |_| store.delete_branch(&proposal.branch)).await {
            tracing::warn!(branch = %proposal.branch, error = %e, "failed to delete proposal branch");
        }
        Ok(())
    }
}

fn is_sibling(marker: &ProposalMarker, submission: &Submission) -> bool {
    marker.lane == submission.lane && marker.revision != submission.revision.as_str()
}

fn proposal_body(submission: &Submission) -> String {
    let marker = ProposalMarker {
        lane: submission.lane.clone(),
        revision: submission.revision.to_string(),
        sequence: submission.sequence,
    };
    let platforms: Vec<String> = submission
        .artifact
        .platforms
        .iter()
        .map(ToString::to_string)
        .collect();
    format!(
        "{marker}\n\
         Promotes lane `{lane}` to revision `{revision}`.\n\n\
         | | |\n|---|---|\n\
         | Artifact | `{reference}` |\n\
         | Digest | `{digest}` |\n\
         | Platforms | {platforms} |\n\
         | Document | `{path}` |\n\n\
         ```diff\n{diff}```\n\n\
         Older open proposals for this lane are closed automatically.\n",
        marker = marker.render(),
        lane = submission.lane,
        revision = submission.revision,
        reference = submission.artifact.reference(),
        digest = submission.artifact.digest,
        platforms = platforms.join(", "),
        path = submission.diff.path,
        diff = submission.diff.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::LineEdit;
    use crate::errors::{Classify, ErrorKind};
    use crate::testing::{MemoryStateStore, StoreFault, fast_retry};
    use std::collections::BTreeSet;

    const DOC: &str = "deploy/app.yaml";

    fn submission(revision: &str, sequence: u64) -> Submission {
        Submission {
            revision: Revision::parse(revision).unwrap(),
            lane: "myapp".into(),
            sequence,
            artifact: ArtifactRef {
                repository: "myapp".into(),
                tag: revision.into(),
                platforms: BTreeSet::from(["linux/amd64".parse().unwrap()]),
                digest: "sha256:aa".into(),
            },
            diff: DocumentDiff {
                path: DOC.into(),
                edits: vec![LineEdit {
                    line: 1,
                    old: "image: myapp:initial".into(),
                    new: format!("image: myapp:{}", revision),
                }],
            },
            content: format!("image: myapp:{}\n", revision),
        }
    }

    fn submitter(store: &Arc<MemoryStateStore>) -> Submitter {
        Submitter::new(store.clone(), fast_retry())
    }

    fn submitted(outcome: SubmitOutcome) -> ProposalRef {
        match outcome {
            SubmitOutcome::Submitted { proposal } => proposal,
            other => panic!("expected Submitted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_proposal_on_revision_branch() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let proposal = submitted(submitter(&store).submit(&submission("abc1234", 1)).await.unwrap());
        assert_eq!(proposal.branch, "update-abc1234");
        assert!(proposal.is_open());
        assert_eq!(
            proposal.marker().unwrap(),
            ProposalMarker {
                lane: "myapp".into(),
                revision: "abc1234".into(),
                sequence: 1
            }
        );
        assert_eq!(
            store.branch_content("update-abc1234", DOC).as_deref(),
            Some("image: myapp:abc1234\n")
        );
        assert!(proposal.body.contains("+image: myapp:abc1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmission_updates_in_place() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        let first = submitted(submitter.submit(&submission("abc1234", 1)).await.unwrap());
        let second = submitted(submitter.submit(&submission("abc1234", 1)).await.unwrap());
        assert_eq!(first.number, second.number);
        assert_eq!(store.open_proposals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merged_proposal_is_reported_not_recreated() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        let first = submitted(submitter.submit(&submission("abc1234", 1)).await.unwrap());
        store.merge(first.number);

        let err = submitter.submit(&submission("abc1234", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProposalClosed);
        assert_eq!(store.proposal_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_submission_closes_older_sibling() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        let old = submitted(submitter.submit(&submission("abc1234", 1)).await.unwrap());
        let new = submitted(submitter.submit(&submission("def5678", 2)).await.unwrap());

        let open = store.open_proposals();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].number, new.number);
        assert!(!store.branch_exists(&old.branch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_submission_is_superseded_by_open_newer() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        let new = submitted(submitter.submit(&submission("def5678", 2)).await.unwrap());
        let outcome = submitter.submit(&submission("abc1234", 1)).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Superseded { by: new.clone() });
        assert_eq!(store.open_proposals().len(), 1);
        assert!(!store.branch_exists("update-abc1234"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_submission_is_superseded_by_merged_newer() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        let new = submitted(submitter.submit(&submission("def5678", 2)).await.unwrap());
        store.merge(new.number);

        let outcome = submitter.submit(&submission("abc1234", 1)).await.unwrap();
        match outcome {
            SubmitOutcome::Superseded { by } => {
                assert_eq!(by.number, new.number);
                assert_eq!(by.state, ProposalState::Merged);
            }
            other => panic!("expected Superseded, got {other:?}"),
        }
        assert!(store.open_proposals().is_empty());
        assert!(!store.branch_exists("update-abc1234"));
        assert_eq!(store.document(DOC).as_deref(), Some("image: myapp:def5678\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lane_with_whitespace_still_closes_older_sibling() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        let mut old = submission("abc1234", 1);
        old.lane = "my app".into();
        let mut new = submission("def5678", 2);
        new.lane = "my app".into();

        submitted(submitter.submit(&old).await.unwrap());
        let newest = submitted(submitter.submit(&new).await.unwrap());

        let open = store.open_proposals();
        assert_eq!(open.len(), 1, "open proposals: {:?}", open);
        assert_eq!(open[0].number, newest.number);
        assert_eq!(newest.marker().unwrap().lane, "my app");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_lanes_and_foreign_proposals_are_untouched() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        store.insert_foreign_proposal("renovate/deps", "Bump deps");
        let submitter = submitter(&store);
        let mut other_lane = submission("abc1234", 1);
        other_lane.lane = "worker".into();
        submitted(submitter.submit(&other_lane).await.unwrap());
        submitted(submitter.submit(&submission("def5678", 2)).await.unwrap());
        assert_eq!(store.open_proposals().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_diff_submits_nothing() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:abc1234\n"));
        let mut current = submission("abc1234", 1);
        current.diff.edits.clear();
        let outcome = submitter(&store).submit(&current).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::NothingToPropose);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_write_is_fatal_and_not_retried() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        store.fail_writes(StoreFault::Rejected, 10);
        let err = submitter(&store).submit(&submission("abc1234", 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteRejected);
        assert_eq!(store.write_calls(), 1);
        assert!(store.open_proposals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_write_is_retried() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        store.fail_writes(StoreFault::Transient, 2);
        let proposal = submitted(submitter(&store).submit(&submission("abc1234", 1)).await.unwrap());
        assert!(proposal.is_open());
        assert_eq!(store.write_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_branch_deletion_failure_does_not_fail_submit() {
        let store = Arc::new(MemoryStateStore::with_document(DOC, "image: myapp:initial\n"));
        let submitter = submitter(&store);
        submitted(submitter.submit(&submission("abc1234", 1)).await.unwrap());
        store.fail_branch_deletes(true);
        submitted(submitter.submit(&submission("def5678", 2)).await.unwrap());
        assert_eq!(store.open_proposals().len(), 1);
    }

    #[test]
    fn test_custom_branch_prefix() {
        let store = Arc::new(MemoryStateStore::default());
        let submitter = Submitter::new(store, fast_retry()).with_branch_prefix("promote/");
        assert_eq!(
            submitter.branch_for(&Revision::parse("abc1234").unwrap()),
            "promote/abc1234"
        );
    }
}
