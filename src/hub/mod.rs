//! The safety hub: entry points for sources, managers and listeners.
//!
//! Two locks, never nested. The state lock (a `std::sync::Mutex`) guards the
//! snapshot store and listener sets and is held only for in-memory work.
//! The refresh lock lives inside the [`RefreshOrchestrator`] and may be held
//! across a slow dispatch. Responses reach the orchestrator as events, and
//! listener delivery happens after the state lock is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast;

use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::listeners::{self, DeliveryReport, ListenerHandle, ListenerKey, ListenerRegistry, Registration};
use crate::profiles::{ProfileTopology, UserProfileResolver};
use crate::refresh::{
    RefreshDispatcher, RefreshOrchestrator, RefreshOutcome, RefreshPhase, RefreshReason, RefreshStatus,
    RefreshTicket,
};
use crate::registry::{BroadcastTarget, SourceRegistry};
use crate::store::{AggregateView, DataStore, SourceSnapshot, SubmissionClock};
use crate::telemetry::{HubTelemetry, TelemetrySnapshot};
use crate::types::{ProfileGroup, SafetySourceData, SourceId, UserId};

struct HubState {
    store: DataStore,
    listeners: ListenerRegistry,
    // stamps every view handed to listeners
    version: u64,
}

impl HubState {
    fn prepare(&mut self, group: &ProfileGroup, registrations: Vec<Arc<Registration>>) -> PendingDelivery {
        self.version += 1;
        PendingDelivery {
            version: self.version,
            view: Arc::new(self.store.aggregate(group)),
            registrations,
        }
    }

    fn prepare_group(&mut self, group: &ProfileGroup) -> Option<PendingDelivery> {
        let registrations = self.listeners.listeners_for(group);
        if registrations.is_empty() {
            return None;
        }
        Some(self.prepare(group, registrations))
    }
}

/// A view captured under the state lock, to be pushed after release.
struct PendingDelivery {
    version: u64,
    view: Arc<AggregateView>,
    registrations: Vec<Arc<Registration>>,
}

/// Point-in-time summary of the hub for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubDump {
    pub enabled: bool,
    pub refresh_timeout_ms: u64,
    pub stored_snapshots: usize,
    pub listeners: Vec<(UserId, usize)>,
    pub telemetry: TelemetrySnapshot,
}

pub struct SafetyHub {
    enabled: AtomicBool,
    resolver: UserProfileResolver,
    state: Mutex<HubState>,
    orchestrator: RefreshOrchestrator,
    telemetry: Arc<HubTelemetry>,
}

impl SafetyHub {
    pub fn new(
        config: &HubConfig,
        registry: Arc<dyn SourceRegistry>,
        topology: Arc<dyn ProfileTopology>,
        dispatcher: Arc<dyn RefreshDispatcher>,
    ) -> Result<Arc<Self>> {
        let clock = SubmissionClock::new();
        let telemetry = Arc::new(HubTelemetry::new());
        let orchestrator = RefreshOrchestrator::new(
            Arc::clone(&registry),
            dispatcher,
            clock.clone(),
            Arc::clone(&telemetry),
            config.refresh_timeout(),
        )?;
        let hub = Arc::new(SafetyHub {
            enabled: AtomicBool::new(config.enabled),
            resolver: UserProfileResolver::new(topology),
            state: Mutex::new(HubState {
                store: DataStore::new(registry, clock),
                listeners: ListenerRegistry::new(),
                version: 0,
            }),
            orchestrator,
            telemetry,
        });
        let outcomes = hub.orchestrator.subscribe_outcomes();
        hub.orchestrator
            .runtime()
            .spawn(Self::watch_outcomes(Arc::downgrade(&hub), outcomes));
        Ok(hub)
    }

    /// Builds the registry from `config.groups`.
    pub fn from_config(
        config: &HubConfig,
        topology: Arc<dyn ProfileTopology>,
        dispatcher: Arc<dyn RefreshDispatcher>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(config.registry()?);
        Self::new(config, registry, topology, dispatcher)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        log::info!("safety hub {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Stores a source report. Returns whether the aggregate of the user's
    /// profile group changed; listeners are only notified when it did.
    pub fn set_data(
        &self,
        source_id: &SourceId,
        data: SafetySourceData,
        package: &str,
        user_id: UserId,
    ) -> Result<bool> {
        self.ensure_enabled()?;
        let group = self.resolver.resolve(user_id)?;
        let (update, pending) = {
            let mut state = self.lock_state();
            let update = state.store.set_data(source_id, data, package, &group, user_id)?;
            let pending = if update.changed {
                state.prepare_group(&group)
            } else {
                None
            };
            (update, pending)
        };
        self.telemetry.track_update();
        self.orchestrator
            .notify_response(&group, source_id, user_id, update.submission);
        if let Some(pending) = pending {
            self.dispatch(pending);
        }
        Ok(update.changed)
    }

    /// Records that a source failed to produce data.
    pub fn report_error(&self, source_id: &SourceId, package: &str, user_id: UserId) -> Result<()> {
        self.ensure_enabled()?;
        let group = self.resolver.resolve(user_id)?;
        let (update, pending) = {
            let mut state = self.lock_state();
            let update = state.store.report_error(source_id, package, &group, user_id)?;
            let pending = if update.changed {
                state.prepare_group(&group)
            } else {
                None
            };
            (update, pending)
        };
        log::debug!("safety source {} reported an error for user {}", source_id, user_id);
        self.telemetry.track_error_report();
        self.orchestrator
            .notify_response(&group, source_id, user_id, update.submission);
        if let Some(pending) = pending {
            self.dispatch(pending);
        }
        Ok(())
    }

    /// Last payload `package` submitted for the source and user. Nothing is
    /// returned while the hub is disabled.
    pub fn get_data(
        &self,
        source_id: &SourceId,
        package: &str,
        user_id: UserId,
    ) -> Result<Option<SafetySourceData>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        self.resolver.resolve(user_id)?;
        self.lock_state().store.get_data(source_id, package, user_id)
    }

    /// Current aggregate for the user's profile group.
    pub fn get_aggregate(&self, user_id: UserId) -> Result<AggregateView> {
        let group = self.resolver.resolve(user_id)?;
        Ok(self.aggregate_for(&group))
    }

    pub fn aggregate_for(&self, group: &ProfileGroup) -> AggregateView {
        let state = self.lock_state();
        if self.is_enabled() {
            state.store.aggregate(group)
        } else {
            state.store.baseline(group)
        }
    }

    /// Drops every stored report and tells current listeners.
    pub fn clear_all(&self) -> Result<()> {
        self.ensure_enabled()?;
        let users = {
            let mut state = self.lock_state();
            state.store.clear_all();
            state.listeners.users()
        };
        let mut groups: Vec<ProfileGroup> = Vec::new();
        for user in users {
            match self.resolver.resolve(user) {
                Ok(group) if !groups.contains(&group) => groups.push(group),
                Ok(_) => {}
                Err(err) => log::debug!("skipping listeners of user {}: {}", user, err),
            }
        }
        for group in &groups {
            self.notify_group(group);
        }
        Ok(())
    }

    /// Starts a refresh for the user's profile group. Returns once requests
    /// have been handed to the dispatcher; completion is reported through
    /// [`SafetyHub::subscribe_refresh_outcomes`].
    pub async fn request_refresh(&self, reason: RefreshReason, user_id: UserId) -> Result<RefreshTicket> {
        self.ensure_enabled()?;
        let group = self.resolver.resolve(user_id)?;
        let ticket = self.orchestrator.start_refresh(reason, &group).await;
        if ticket.phase == RefreshPhase::Completed {
            self.notify_group(&group);
        }
        Ok(ticket)
    }

    pub async fn refresh_status(&self, user_id: UserId) -> Result<RefreshStatus> {
        let group = self.resolver.resolve(user_id)?;
        Ok(self.orchestrator.status(&group).await)
    }

    pub async fn acknowledge_refresh(&self, user_id: UserId) -> Result<bool> {
        let group = self.resolver.resolve(user_id)?;
        Ok(self.orchestrator.acknowledge(&group).await)
    }

    pub fn subscribe_refresh_outcomes(&self) -> broadcast::Receiver<RefreshOutcome> {
        self.orchestrator.subscribe_outcomes()
    }

    /// Resolves once every report made before the call has been counted by
    /// the refresh orchestrator.
    pub async fn settle(&self) {
        self.orchestrator.settle().await;
    }

    /// Extra refresh target outside the registry; asked on every refresh,
    /// never waited for.
    pub async fn add_additional_source(&self, target: BroadcastTarget) -> Result<()> {
        self.ensure_enabled()?;
        self.orchestrator.add_additional_target(target).await;
        Ok(())
    }

    pub async fn clear_additional_sources(&self) {
        self.orchestrator.clear_additional_targets().await;
    }

    /// Registers `handle` for `user_id` and sends it the current aggregate.
    /// Returns `true` if it was already registered (nothing is sent then).
    pub fn subscribe(&self, handle: ListenerHandle, user_id: UserId) -> Result<bool> {
        self.ensure_enabled()?;
        let group = self.resolver.resolve(user_id)?;
        let key = ListenerKey::of(&handle);
        let pending = {
            let mut state = self.lock_state();
            if state.listeners.add_listener(handle, user_id) {
                return Ok(true);
            }
            let registrations: Vec<_> = state.listeners.registration(key, user_id).into_iter().collect();
            state.prepare(&group, registrations)
        };
        self.dispatch(pending);
        Ok(false)
    }

    /// Unregisters `handle`. Once this returns the handle receives nothing
    /// more for `user_id`, including views computed before the call.
    pub fn unsubscribe(&self, handle: &ListenerHandle, user_id: UserId) {
        let removed = self.lock_state().listeners.remove_listener(handle, user_id);
        if let Some(registration) = removed {
            registration.close();
        }
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.get_snapshot()
    }

    /// Stored record for one pair, including who submitted it and when.
    pub fn source_snapshot(&self, source_id: &SourceId, user_id: UserId) -> Option<SourceSnapshot> {
        self.lock_state().store.snapshot(source_id, user_id)
    }

    pub fn dump(&self) -> HubDump {
        let (stored_snapshots, listeners) = {
            let state = self.lock_state();
            (state.store.len(), state.listeners.counts())
        };
        HubDump {
            enabled: self.is_enabled(),
            refresh_timeout_ms: self.orchestrator.timeout().as_millis().min(u64::MAX as u128) as u64,
            stored_snapshots,
            listeners,
            telemetry: self.telemetry.get_snapshot(),
        }
    }

    /// Pushes the group's current aggregate to listeners that have not seen
    /// it yet. Safe to call when nothing changed.
    pub fn notify_group(&self, group: &ProfileGroup) {
        let pending = self.lock_state().prepare_group(group);
        if let Some(pending) = pending {
            self.dispatch(pending);
        }
    }

    fn dispatch(&self, pending: PendingDelivery) {
        let DeliveryReport {
            delivered, failures, ..
        } = listeners::deliver(&pending.registrations, pending.version, &pending.view);
        self.telemetry.track_delivery(delivered, failures.len());
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(HubError::Disabled)
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn watch_outcomes(hub: Weak<SafetyHub>, mut outcomes: broadcast::Receiver<RefreshOutcome>) {
        loop {
            let outcome = match outcomes.recv().await {
                Ok(outcome) => outcome,
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("missed {} refresh outcomes", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(hub) = hub.upgrade() else {
                break;
            };
            log::info!(
                "refresh {} finished as {:?}: {} responded, {} silent",
                outcome.operation_id,
                outcome.phase,
                outcome.responded,
                outcome.still_pending.len()
            );
            hub.notify_group(&outcome.profile_group);
        }
    }
}
