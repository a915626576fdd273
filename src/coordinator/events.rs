//! Run events for observers (CLI progress, tests).

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::run::{RunReport, Stage};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StageEntered {
        run_id: Uuid,
        lane: String,
        stage: Stage,
        revision: Option<String>,
    },
    CancelRequested {
        run_id: Uuid,
        reason: String,
    },
    RunFinished {
        report: Box<RunReport>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::StageEntered { run_id, .. } | Self::CancelRequested { run_id, .. } => *run_id,
            Self::RunFinished { report } => report.run_id,
        }
    }
}

/// Send to every subscriber; silently dropped when nobody listens.
pub fn broadcast_event(tx: &broadcast::Sender<RunEvent>, event: RunEvent) {
    let _ = tx.send(event);
}
