use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{RefreshOutcome, RefreshReason, RefreshStatus};
use crate::types::{ProfileGroup, SourceId, UserId};

pub type OperationId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Idle,
    InProgress,
    Completed,
    TimedOut,
}

impl RefreshPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RefreshPhase::Completed | RefreshPhase::TimedOut)
    }
}

type Pair = (SourceId, UserId);

/// One in-flight (or finished, not yet acknowledged) refresh.
#[derive(Debug)]
pub struct RefreshOperation {
    pub id: OperationId,
    pub profile_group: ProfileGroup,
    pub reason: RefreshReason,
    pub phase: RefreshPhase,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pending: HashSet<Pair>,
    responded: HashSet<Pair>,
    // reports with a submission token at or below this predate the operation
    started_after: u64,
    generation: u64,
    timer: CancellationToken,
    started: Instant,
}

impl RefreshOperation {
    pub(crate) fn new(
        profile_group: ProfileGroup,
        reason: RefreshReason,
        expected: HashSet<Pair>,
        started_after: u64,
        generation: u64,
        timeout: Duration,
    ) -> Self {
        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .unwrap_or(started_at);
        RefreshOperation {
            id: uuid::Uuid::new_v4().to_string(),
            profile_group,
            reason,
            phase: RefreshPhase::InProgress,
            started_at,
            deadline,
            finished_at: None,
            pending: expected,
            responded: HashSet::new(),
            started_after,
            generation,
            timer: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn timer(&self) -> CancellationToken {
        self.timer.clone()
    }

    /// Drops a pair that cannot answer (its request never left).
    pub(crate) fn forget(&mut self, pair: &Pair) {
        self.pending.remove(pair);
    }

    /// Marks a response. Returns `true` if it counted toward this operation.
    pub(crate) fn mark_responded(&mut self, pair: Pair, submission: u64) -> bool {
        if self.phase != RefreshPhase::InProgress || submission <= self.started_after {
            return false;
        }
        if !self.pending.remove(&pair) {
            return false;
        }
        self.responded.insert(pair);
        true
    }

    /// Moves to a terminal phase and stops the deadline timer.
    pub(crate) fn finish(&mut self, phase: RefreshPhase) -> RefreshOutcome {
        self.phase = phase;
        self.timer.cancel();
        let finished_at = Utc::now();
        self.finished_at = Some(finished_at);
        let still_pending: BTreeSet<Pair> = self.pending.iter().cloned().collect();
        RefreshOutcome {
            operation_id: self.id.clone(),
            profile_group: self.profile_group.clone(),
            reason: self.reason,
            phase,
            responded: self.responded.len(),
            still_pending: still_pending.into_iter().collect(),
            started_at: self.started_at,
            finished_at,
            elapsed_ms: self.started.elapsed().as_millis().min(u64::MAX as u128) as u64,
        }
    }

    /// Discards the operation without an outcome.
    pub(crate) fn supersede(&mut self) {
        self.timer.cancel();
    }

    pub fn status(&self) -> RefreshStatus {
        RefreshStatus {
            phase: self.phase,
            operation_id: Some(self.id.clone()),
            reason: Some(self.reason),
            pending: self.pending.len(),
            responded: self.responded.len(),
            started_at: Some(self.started_at),
            deadline: Some(self.deadline),
            finished_at: self.finished_at,
        }
    }
}
