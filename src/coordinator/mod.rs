//! Pipeline coordination.
//!
//! ## Run lifecycle
//!
//! ```text
//!   Started ─► Identified ─► Published ─► Proposed ─► Completed
//!      │            │             │            │
//!      └────────────┴─────────────┴────────────┴──► Failed(stage, kind)
//! ```
//!
//! Each run executes its stages strictly in order; runs for different
//! revisions execute concurrently as independent tasks. Cancellation is
//! cooperative and only checked between stages, never during a network call.
//!
//! ## Supersession
//!
//! Every trigger gets a lane sequence number. Publishing is never
//! suppressed (artifacts are immutable and harmless), but a run refuses to
//! submit its proposal once a newer run of the same lane has reached
//! `Proposed`. The check and the submission happen under the lane's submit
//! lock so two in-process runs cannot interleave them. Across processes the
//! submitter's own sibling check takes over.

mod events;
mod lanes;
mod run;

pub use events::{RunEvent, broadcast_event};
pub use lanes::LaneTracker;
pub use run::{RunOutcome, RunReport, Stage, is_valid_transition};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::compose::{Document, DocumentDiff, compose};
use crate::errors::PipelineError;
use crate::publish::{ArtifactRef, Platform, Publisher};
use crate::revision::{Revision, RevisionIdentifier, Trigger};
use crate::submit::{SubmitOutcome, Submission, Submitter};

const EVENT_CAPACITY: usize = 256;

/// Per-deployment settings the coordinator passes to every run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Path of the desired-state document inside the state store.
    pub document_path: String,
    pub platforms: Vec<Platform>,
}

/// Result of a dry run: what would be proposed, without side effects.
#[derive(Debug, Clone)]
pub struct Preview {
    pub revision: Revision,
    pub artifact: ArtifactRef,
    pub diff: DocumentDiff,
}

struct RunControl {
    lane: String,
    sequence: u64,
    cancel: Option<String>,
}

struct Inner {
    identifier: RevisionIdentifier,
    publisher: Publisher,
    submitter: Submitter,
    settings: PipelineSettings,
    lanes: LaneTracker,
    runs: Mutex<HashMap<Uuid, RunControl>>,
    events: broadcast::Sender<RunEvent>,
}

/// Handle to a spawned run.
pub struct RunHandle {
    pub run_id: Uuid,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub async fn wait(self) -> Result<RunReport, tokio::task::JoinError> {
        self.join.await
    }
}

/// Sequences identifier, publisher, composer and submitter for every run.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        identifier: RevisionIdentifier,
        publisher: Publisher,
        submitter: Submitter,
        settings: PipelineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                identifier,
                publisher,
                submitter,
                settings,
                lanes: LaneTracker::new(),
                runs: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Accept a trigger and run it as an independent task.
    pub fn trigger(&self, trigger: Trigger) -> RunHandle {
        let (run_id, sequence) = self.inner.accept(&trigger);
        let inner = Arc::clone(&self.inner);
        let join = tokio::spawn(async move { inner.execute(run_id, sequence, trigger).await });
        RunHandle { run_id, join }
    }

    /// Accept a trigger and run it to completion on the current task.
    pub async fn run(&self, trigger: Trigger) -> RunReport {
        let (run_id, sequence) = self.inner.accept(&trigger);
        self.inner.execute(run_id, sequence, trigger).await
    }

    /// Request cooperative cancellation. The run stops at its next stage
    /// boundary and reports `Cancelled`. Returns false for unknown or
    /// already finished runs.
    pub fn cancel(&self, run_id: Uuid, reason: &str) -> bool {
        {
            let mut runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
            let Some(control) = runs.get_mut(&run_id) else {
                return false;
            };
            control.cancel = Some(reason.to_string());
        }
        tracing::info!(%run_id, reason, "cancellation requested");
        broadcast_event(
            &self.inner.events,
            RunEvent::CancelRequested {
                run_id,
                reason: reason.to_string(),
            },
        );
        true
    }

    /// Identify and compose without building, publishing or submitting.
    pub async fn preview(&self, trigger: &Trigger) -> Result<Preview, PipelineError> {
        let inner = &self.inner;
        let revision = inner
            .identifier
            .identify(trigger)
            .map_err(|e| PipelineError::new(Stage::Identified, &e))?;
        let artifact = inner.publisher.planned(&revision, &inner.settings.platforms);
        let (diff, _) = inner.compose(&artifact).await?;
        Ok(Preview {
            revision,
            artifact,
            diff,
        })
    }
}

impl Inner {
    fn accept(&self, trigger: &Trigger) -> (Uuid, u64) {
        let run_id = Uuid::new_v4();
        let sequence = self.lanes.next_sequence();

        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let older = runs
            .values()
            .filter(|c| c.lane == trigger.lane && c.sequence < sequence)
            .count();
        if older > 0 {
            tracing::info!(
                lane = %trigger.lane,
                older,
                "older runs in flight; their proposals are suppressed once this run proposes"
            );
        }
        runs.insert(
            run_id,
            RunControl {
                lane: trigger.lane.clone(),
                sequence,
                cancel: None,
            },
        );
        (run_id, sequence)
    }

    fn cancellation(&self, run_id: Uuid) -> Option<String> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(&run_id).and_then(|c| c.cancel.clone())
    }

    async fn execute(&self, run_id: Uuid, sequence: u64, trigger: Trigger) -> RunReport {
        let started_at = Utc::now();
        let mut report = RunReport {
            run_id,
            lane: trigger.lane.clone(),
            sequence,
            requested: trigger.revision.clone(),
            revision: None,
            stage: Stage::Started,
            artifact: None,
            diff: None,
            proposal: None,
            outcome: RunOutcome::Completed,
            started_at,
            finished_at: started_at,
        };
        tracing::info!(%run_id, lane = %report.lane, requested = ?report.requested, "run started");
        self.emit_stage(&report);

        report.outcome = self.drive(&trigger, &mut report).await;
        report.finished_at = Utc::now();

        {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.remove(&run_id);
        }
        match &report.outcome {
            RunOutcome::Failed { error } => tracing::error!(
                %run_id,
                lane = %report.lane,
                stage = %error.stage,
                kind = %error.kind,
                error = %error.message,
                "run failed"
            ),
            outcome => tracing::info!(%run_id, lane = %report.lane, outcome = %outcome, "run finished"),
        }
        broadcast_event(
            &self.events,
            RunEvent::RunFinished {
                report: Box::new(report.clone()),
            },
        );
        report
    }

    async fn drive(&self, trigger: &Trigger, report: &mut RunReport) -> RunOutcome {
        let run_id = report.run_id;

        if let Some(reason) = self.cancellation(run_id) {
            return RunOutcome::Cancelled { reason };
        }
        let revision = match self.identifier.identify(trigger) {
            Ok(revision) => revision,
            Err(e) => return failed(Stage::Identified, &e),
        };
        report.revision = Some(revision.clone());
        self.advance(report, Stage::Identified);

        if let Some(reason) = self.cancellation(run_id) {
            return RunOutcome::Cancelled { reason };
        }
        let artifact = match self
            .publisher
            .publish(&revision, &trigger.context, &self.settings.platforms)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => return failed(Stage::Published, &e),
        };
        report.artifact = Some(artifact.clone());
        self.advance(report, Stage::Published);

        if let Some(reason) = self.cancellation(run_id) {
            return RunOutcome::Cancelled { reason };
        }
        match self.propose(report, &revision, &artifact).await {
            Ok(None) => {}
            Ok(Some(outcome)) => return outcome,
            Err(error) => return RunOutcome::Failed { error },
        }
        self.advance(report, Stage::Proposed);

        self.advance(report, Stage::Completed);
        RunOutcome::Completed
    }

    /// Read, compose and submit. `Ok(Some(_))` ends the run early without failure.
    async fn propose(
        &self,
        report: &mut RunReport,
        revision: &Revision,
        artifact: &ArtifactRef,
    ) -> Result<Option<RunOutcome>, PipelineError> {
        let (diff, content) = self.compose(artifact).await?;
        tracing::debug!(edits = diff.edits.len(), "document diff composed");
        report.diff = Some(diff.clone());

        let lane = report.lane.clone();
        let lock = self.lanes.submit_lock(&lane);
        let _guard = lock.lock().await;

        if let Some(newer) = self.lanes.newer_proposed(&lane, report.sequence) {
            tracing::info!(%revision, lane = %lane, newer = %newer, "newer revision already proposed, suppressing");
            return Ok(Some(RunOutcome::Superseded {
                by_revision: Some(newer),
            }));
        }
        if let Some(reason) = self.cancellation(report.run_id) {
            return Ok(Some(RunOutcome::Cancelled { reason }));
        }

        let submission = Submission {
            revision: revision.clone(),
            lane: lane.clone(),
            sequence: report.sequence,
            artifact: artifact.clone(),
            diff,
            content,
        };
        let outcome = self
            .submitter
            .submit(&submission)
            .await
            .map_err(|e| PipelineError::new(Stage::Proposed, &e))?;

        match outcome {
            SubmitOutcome::Submitted { proposal } => {
                report.proposal = Some(proposal);
                self.lanes.mark_proposed(&lane, report.sequence, revision.as_str());
                Ok(None)
            }
            SubmitOutcome::NothingToPropose => {
                self.lanes.mark_proposed(&lane, report.sequence, revision.as_str());
                Ok(None)
            }
            SubmitOutcome::Superseded { by } => Ok(Some(RunOutcome::Superseded {
                by_revision: by.marker().map(|m| m.revision),
            })),
        }
    }

    /// Current document and the diff (plus patched content) for `artifact`.
    async fn compose(&self, artifact: &ArtifactRef) -> Result<(DocumentDiff, String), PipelineError> {
        let path = &self.settings.document_path;
        let current = self
            .submitter
            .read_document(path)
            .await
            .map_err(|e| PipelineError::new(Stage::Proposed, &e))?;
        let document = Document::new(path.clone(), current);
        let diff = compose(&document, artifact).map_err(|e| PipelineError::new(Stage::Proposed, &e))?;
        let content = diff
            .apply(&document.content)
            .map_err(|e| PipelineError::new(Stage::Proposed, &e))?;
        Ok((diff, content))
    }

    fn advance(&self, report: &mut RunReport, stage: Stage) {
        debug_assert!(
            is_valid_transition(report.stage, stage),
            "invalid transition {} -> {}",
            report.stage,
            stage
        );
        report.stage = stage;
        tracing::info!(run_id = %report.run_id, lane = %report.lane, stage = %stage, "stage reached");
        self.emit_stage(report);
    }

    fn emit_stage(&self, report: &RunReport) {
        broadcast_event(
            &self.events,
            RunEvent::StageEntered {
                run_id: report.run_id,
                lane: report.lane.clone(),
                stage: report.stage,
                revision: report.revision.as_ref().map(ToString::to_string),
            },
        );
    }
}

fn failed<E: crate::errors::Classify>(stage: Stage, err: &E) -> RunOutcome {
    RunOutcome::Failed {
        error: PipelineError::new(stage, err),
    }
}
