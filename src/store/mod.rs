//! Per-(source, user) snapshot storage and aggregate computation.
//!
//! `DataStore` is not synchronized on its own; the hub keeps it behind its
//! state lock.

mod aggregate;

pub use aggregate::{AggregateEntry, AggregateGroup, AggregateIssue, AggregateView, EntryRef, EntryState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HubError, Result};
use crate::registry::SourceRegistry;
use crate::types::{ProfileGroup, SafetySourceData, SourceId, UserId};

/// Monotonic counter handing out submission tokens.
///
/// Shared with the refresh orchestrator so it can tell whether a report
/// was submitted before or after a refresh started.
#[derive(Debug, Clone, Default)]
pub struct SubmissionClock(Arc<AtomicU64>);

impl SubmissionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last token handed out, or 0.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Last-known report for one (source, user) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub data: Option<SafetySourceData>,
    pub package: String,
    pub submission: u64,
    pub errored: bool,
    pub received_at: DateTime<Utc>,
}

impl SourceSnapshot {
    fn entry_state(&self) -> EntryState {
        match (&self.data, self.errored) {
            (_, true) => EntryState::Error,
            (Some(data), false) => EntryState::Data(data.clone()),
            (None, false) => EntryState::Unknown,
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUpdate {
    /// Whether the group's aggregate differs from before the write.
    pub changed: bool,
    pub submission: u64,
}

pub struct DataStore {
    registry: Arc<dyn SourceRegistry>,
    snapshots: HashMap<(SourceId, UserId), SourceSnapshot>,
    clock: SubmissionClock,
}

impl DataStore {
    pub fn new(registry: Arc<dyn SourceRegistry>, clock: SubmissionClock) -> Self {
        DataStore {
            registry,
            snapshots: HashMap::new(),
            clock,
        }
    }

    /// Stores `data` as the latest report of `source_id` for `user_id`,
    /// clearing any error flag.
    pub fn set_data(
        &mut self,
        source_id: &SourceId,
        data: SafetySourceData,
        package: &str,
        group: &ProfileGroup,
        user_id: UserId,
    ) -> Result<StoreUpdate> {
        self.validate(source_id, group, user_id)?;
        let submission = self.clock.next();
        let snapshot = SourceSnapshot {
            data: Some(data),
            package: package.to_string(),
            submission,
            errored: false,
            received_at: Utc::now(),
        };
        Ok(self.replace(source_id, user_id, snapshot))
    }

    /// Flags the pair as errored, keeping whatever payload it had. A kept
    /// payload stays owned by the package that submitted it.
    pub fn report_error(
        &mut self,
        source_id: &SourceId,
        package: &str,
        group: &ProfileGroup,
        user_id: UserId,
    ) -> Result<StoreUpdate> {
        self.validate(source_id, group, user_id)?;
        let submission = self.clock.next();
        let (data, owner) = match self.snapshots.get(&(source_id.clone(), user_id)) {
            Some(SourceSnapshot {
                data: Some(data),
                package: owner,
                ..
            }) => (Some(data.clone()), owner.clone()),
            _ => (None, package.to_string()),
        };
        let snapshot = SourceSnapshot {
            data,
            package: owner,
            submission,
            errored: true,
            received_at: Utc::now(),
        };
        Ok(self.replace(source_id, user_id, snapshot))
    }

    /// Returns the last payload for the pair, provided `package` is the one
    /// that submitted it. An errored pair still returns the payload it kept.
    pub fn get_data(
        &self,
        source_id: &SourceId,
        package: &str,
        user_id: UserId,
    ) -> Result<Option<SafetySourceData>> {
        if !self.registry.contains(source_id) {
            return Err(HubError::UnknownSource(source_id.clone()));
        }
        let Some(snapshot) = self.snapshots.get(&(source_id.clone(), user_id)) else {
            return Ok(None);
        };
        if snapshot.package != package {
            log::warn!(
                "package {} asked for data of {} submitted by another package",
                package,
                source_id
            );
            return Ok(None);
        }
        Ok(snapshot.data.clone())
    }

    pub fn snapshot(&self, source_id: &SourceId, user_id: UserId) -> Option<SourceSnapshot> {
        self.snapshots.get(&(source_id.clone(), user_id)).cloned()
    }

    /// Recomputes the aggregate for `group` from the stored snapshots.
    pub fn aggregate(&self, group: &ProfileGroup) -> AggregateView {
        aggregate::compute(&self.registry.groups(), group, |source_id, user_id| {
            self.entry_state(source_id, user_id)
        })
    }

    /// The aggregate with every entry unknown, served while the hub is
    /// disabled.
    pub fn baseline(&self, group: &ProfileGroup) -> AggregateView {
        aggregate::compute(&self.registry.groups(), group, |_, _| EntryState::Unknown)
    }

    pub fn clear_all(&mut self) {
        let dropped = self.snapshots.len();
        self.snapshots.clear();
        log::debug!("cleared {} safety source snapshots", dropped);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn validate(&self, source_id: &SourceId, group: &ProfileGroup, user_id: UserId) -> Result<()> {
        if !self.registry.contains(source_id) {
            return Err(HubError::UnknownSource(source_id.clone()));
        }
        if !group.contains(user_id) {
            return Err(HubError::UnknownUser(user_id));
        }
        Ok(())
    }

    fn entry_state(&self, source_id: &SourceId, user_id: UserId) -> EntryState {
        self.snapshots
            .get(&(source_id.clone(), user_id))
            .map(SourceSnapshot::entry_state)
            .unwrap_or(EntryState::Unknown)
    }

    // Every registered (source, member) pair maps to exactly one entry of the
    // group's aggregate, and the derived fields are functions of the entries,
    // so the aggregate changes exactly when this pair's entry state does.
    fn replace(&mut self, source_id: &SourceId, user_id: UserId, snapshot: SourceSnapshot) -> StoreUpdate {
        let submission = snapshot.submission;
        let after = snapshot.entry_state();
        let before = self
            .snapshots
            .insert((source_id.clone(), user_id), snapshot)
            .map(|previous| previous.entry_state())
            .unwrap_or(EntryState::Unknown);
        StoreUpdate {
            changed: before != after,
            submission,
        }
    }
}
