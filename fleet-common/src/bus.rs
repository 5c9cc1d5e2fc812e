use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{InstanceStatus, LifecycleOperation, SnapshotStatus};

// -----------------------------------------------------------------------------
// Lifecycle events (EVT:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    TimedOut,
    Rejected,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Succeeded => "succeeded",
            OutcomeKind::TimedOut => "timed_out",
            OutcomeKind::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum LifecycleEventKind {
    #[serde(rename = "EVT:STATUS_CHANGED")]
    StatusChanged {
        from: Option<InstanceStatus>,
        to: InstanceStatus,
    },
    #[serde(rename = "EVT:SNAPSHOT_STATUS_CHANGED")]
    SnapshotStatusChanged {
        from: Option<SnapshotStatus>,
        to: SnapshotStatus,
    },
    #[serde(rename = "EVT:POLLED")]
    Polled {
        operation: LifecycleOperation,
        poll: u32,
        elapsed_ms: u64,
        converged: bool,
    },
    #[serde(rename = "EVT:OPERATION_FINISHED")]
    OperationFinished {
        operation: LifecycleOperation,
        outcome: OutcomeKind,
        duration_ms: u64,
        detail: Option<String>,
    },
}

impl LifecycleEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEventKind::StatusChanged { .. } => "EVT:STATUS_CHANGED",
            LifecycleEventKind::SnapshotStatusChanged { .. } => "EVT:SNAPSHOT_STATUS_CHANGED",
            LifecycleEventKind::Polled { .. } => "EVT:POLLED",
            LifecycleEventKind::OperationFinished { .. } => "EVT:OPERATION_FINISHED",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub event_id: Uuid,
    pub resource_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LifecycleEventKind,
}

impl LifecycleEvent {
    pub fn new(resource_id: &str, kind: LifecycleEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            occurred_at: Utc::now(),
            kind,
        }
    }
}
