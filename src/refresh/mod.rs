//! Scatter/gather refresh of dynamic safety sources.

mod operation;
mod orchestrator;

pub use operation::{OperationId, RefreshPhase};
pub use orchestrator::RefreshOrchestrator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::registry::BroadcastTarget;
use crate::types::{ProfileGroup, SourceId, UserId};

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    PageOpen,
    ButtonClick,
    Reboot,
    LocaleChange,
    SafetyCenterEnabled,
    Other,
}

/// One refresh request, addressed to one source for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub operation_id: OperationId,
    /// `None` for additional targets outside the registry.
    pub source_id: Option<SourceId>,
    pub target: BroadcastTarget,
    pub reason: RefreshReason,
    pub user_id: UserId,
}

/// Transport for refresh requests. Fire-and-forget: sources answer by
/// pushing data or errors back into the hub.
pub trait RefreshDispatcher: Send + Sync {
    fn send_refresh_request(&self, request: &RefreshRequest) -> Result<(), DispatchError>;
}

/// What `start_refresh` hands back once requests are out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTicket {
    pub operation_id: OperationId,
    pub phase: RefreshPhase,
    pub expected: usize,
    pub dispatched: usize,
}

/// Terminal result of an operation that was not superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub operation_id: OperationId,
    pub profile_group: ProfileGroup,
    pub reason: RefreshReason,
    pub phase: RefreshPhase,
    pub responded: usize,
    /// Pairs that never answered; empty unless timed out.
    pub still_pending: Vec<(SourceId, UserId)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Snapshot of a group's refresh bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub phase: RefreshPhase,
    pub operation_id: Option<OperationId>,
    pub reason: Option<RefreshReason>,
    pub pending: usize,
    pub responded: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RefreshStatus {
    pub fn idle() -> Self {
        RefreshStatus {
            phase: RefreshPhase::Idle,
            operation_id: None,
            reason: None,
            pending: 0,
            responded: 0,
            started_at: None,
            deadline: None,
            finished_at: None,
        }
    }
}
