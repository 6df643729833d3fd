use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::operation::{RefreshOperation, RefreshPhase};
use super::{RefreshDispatcher, RefreshOutcome, RefreshReason, RefreshRequest, RefreshStatus, RefreshTicket};
use crate::error::{HubError, Result};
use crate::registry::{BroadcastTarget, SourceRegistry};
use crate::store::SubmissionClock;
use crate::telemetry::HubTelemetry;
use crate::types::{ProfileGroup, SourceId, UserId};

const OUTCOME_CAPACITY: usize = 64;

enum PumpEvent {
    Responded {
        profile_group: ProfileGroup,
        source_id: SourceId,
        user_id: UserId,
        submission: u64,
    },
    Settle(oneshot::Sender<()>),
}

#[derive(Default)]
struct RefreshBook {
    operations: HashMap<ProfileGroup, RefreshOperation>,
    additional_targets: Vec<BroadcastTarget>,
}

struct OrchestratorInner {
    registry: Arc<dyn SourceRegistry>,
    dispatcher: Arc<dyn RefreshDispatcher>,
    clock: SubmissionClock,
    telemetry: Arc<HubTelemetry>,
    timeout: Duration,
    // the refresh lock; held across dispatch
    book: Mutex<RefreshBook>,
    events: mpsc::UnboundedSender<PumpEvent>,
    outcomes: broadcast::Sender<RefreshOutcome>,
    generations: AtomicU64,
    shutdown: CancellationToken,
}

/// Issues refresh requests per profile group and tracks who answered.
///
/// Responses arrive as events on a channel drained by a background task,
/// so the data path never waits on the refresh lock.
pub struct RefreshOrchestrator {
    inner: Arc<OrchestratorInner>,
    runtime: Handle,
    // set when no ambient runtime existed at construction
    owned_runtime: Option<Arc<Runtime>>,
}

impl RefreshOrchestrator {
    pub fn new(
        registry: Arc<dyn SourceRegistry>,
        dispatcher: Arc<dyn RefreshDispatcher>,
        clock: SubmissionClock,
        telemetry: Arc<HubTelemetry>,
        timeout: Duration,
    ) -> Result<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let inner = Arc::new(OrchestratorInner {
            registry,
            dispatcher,
            clock,
            telemetry,
            timeout,
            book: Mutex::new(RefreshBook::default()),
            events,
            outcomes,
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let (runtime, runtime_guard) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .map_err(HubError::Runtime)?;
                (runtime.handle().clone(), Some(Arc::new(runtime)))
            }
        };
        runtime.spawn(OrchestratorInner::pump(Arc::clone(&inner), receiver));

        Ok(RefreshOrchestrator {
            inner,
            runtime,
            owned_runtime: runtime_guard,
        })
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Sends refresh requests to every dynamic source applicable to
    /// `reason`, for every member of `group`, superseding any refresh
    /// already running for the group.
    pub async fn start_refresh(&self, reason: RefreshReason, group: &ProfileGroup) -> RefreshTicket {
        let inner = &self.inner;
        let mut book = inner.book.lock().await;
        let started_after = inner.clock.current();
        let generation = inner.generations.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(previous) = book.operations.get_mut(group) {
            if previous.phase == RefreshPhase::InProgress {
                previous.supersede();
                inner.telemetry.track_refresh_superseded();
                log::debug!(
                    "refresh {} for user {} superseded",
                    previous.id,
                    group.primary()
                );
            }
        }

        let mut expected = HashSet::new();
        let mut targets = Vec::new();
        for source_group in inner.registry.groups() {
            for source in &source_group.sources {
                let Some(target) = source.refresh_target(reason) else {
                    continue;
                };
                for user_id in group.members() {
                    expected.insert((source.id.clone(), user_id));
                    targets.push((source.id.clone(), target.clone(), user_id));
                }
            }
        }

        let mut operation = RefreshOperation::new(
            group.clone(),
            reason,
            expected,
            started_after,
            generation,
            inner.timeout,
        );
        let expected = operation.pending();
        let mut dispatched = 0;

        for (source_id, target, user_id) in targets {
            let request = RefreshRequest {
                operation_id: operation.id.clone(),
                source_id: Some(source_id.clone()),
                target,
                reason,
                user_id,
            };
            match inner.dispatcher.send_refresh_request(&request) {
                Ok(()) => dispatched += 1,
                Err(err) => {
                    log::warn!(
                        "refresh request to {} for user {} not sent: {}",
                        source_id,
                        user_id,
                        err
                    );
                    inner.telemetry.track_dispatch_failure();
                    operation.forget(&(source_id, user_id));
                }
            }
        }

        for target in &book.additional_targets {
            for user_id in group.members() {
                let request = RefreshRequest {
                    operation_id: operation.id.clone(),
                    source_id: None,
                    target: target.clone(),
                    reason,
                    user_id,
                };
                if let Err(err) = inner.dispatcher.send_refresh_request(&request) {
                    log::warn!(
                        "refresh request to additional target {} not sent: {}",
                        target.package,
                        err
                    );
                    inner.telemetry.track_dispatch_failure();
                }
            }
        }

        inner.telemetry.track_refresh_started();
        log::debug!(
            "refresh {} ({:?}) for user {}: {} expected, {} dispatched",
            operation.id,
            reason,
            group.primary(),
            expected,
            dispatched
        );

        let outcome = if operation.pending() == 0 {
            inner.telemetry.track_refresh_completed();
            Some(operation.finish(RefreshPhase::Completed))
        } else {
            self.spawn_deadline(group.clone(), generation, operation.timer());
            None
        };

        let ticket = RefreshTicket {
            operation_id: operation.id.clone(),
            phase: operation.phase,
            expected,
            dispatched,
        };
        book.operations.insert(group.clone(), operation);
        drop(book);

        if let Some(outcome) = outcome {
            inner.publish(outcome);
        }
        ticket
    }

    /// Records that `source_id` reported for `user_id`. Never blocks.
    pub fn notify_response(&self, group: &ProfileGroup, source_id: &SourceId, user_id: UserId, submission: u64) {
        let event = PumpEvent::Responded {
            profile_group: group.clone(),
            source_id: source_id.clone(),
            user_id,
            submission,
        };
        if self.inner.events.send(event).is_err() {
            log::debug!("refresh pump stopped; dropping response from {}", source_id);
        }
    }

    /// Resolves once every response submitted before this call is applied.
    pub async fn settle(&self) {
        let (done, wait) = oneshot::channel();
        if self.inner.events.send(PumpEvent::Settle(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn status(&self, group: &ProfileGroup) -> RefreshStatus {
        let book = self.inner.book.lock().await;
        book.operations
            .get(group)
            .map(RefreshOperation::status)
            .unwrap_or_else(RefreshStatus::idle)
    }

    /// Returns a finished refresh to `Idle`. `false` if none was finished.
    pub async fn acknowledge(&self, group: &ProfileGroup) -> bool {
        let mut book = self.inner.book.lock().await;
        let finished = book
            .operations
            .get(group)
            .map(|operation| operation.phase.is_terminal())
            .unwrap_or(false);
        if finished {
            book.operations.remove(group);
        }
        finished
    }

    pub async fn add_additional_target(&self, target: BroadcastTarget) {
        let mut book = self.inner.book.lock().await;
        if !book.additional_targets.contains(&target) {
            book.additional_targets.push(target);
        }
    }

    pub async fn clear_additional_targets(&self) {
        self.inner.book.lock().await.additional_targets.clear();
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<RefreshOutcome> {
        self.inner.outcomes.subscribe()
    }

    fn spawn_deadline(&self, group: ProfileGroup, generation: u64, timer: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let timeout = inner.timeout;
        self.runtime.spawn(async move {
            select! {
                _ = timer.cancelled() => {}
                _ = inner.shutdown.cancelled() => {}
                _ = sleep(timeout) => inner.on_deadline(&group, generation).await,
            }
        });
    }
}

impl OrchestratorInner {
    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PumpEvent>) {
        loop {
            let event = select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                PumpEvent::Responded {
                    profile_group,
                    source_id,
                    user_id,
                    submission,
                } => {
                    self.apply_response(&profile_group, source_id, user_id, submission)
                        .await
                }
                PumpEvent::Settle(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    async fn apply_response(&self, group: &ProfileGroup, source_id: SourceId, user_id: UserId, submission: u64) {
        let mut book = self.book.lock().await;
        let Some(operation) = book.operations.get_mut(group) else {
            return;
        };
        if !operation.mark_responded((source_id, user_id), submission) {
            return;
        }
        if operation.pending() > 0 {
            return;
        }
        let outcome = operation.finish(RefreshPhase::Completed);
        self.telemetry.track_refresh_completed();
        log::debug!(
            "refresh {} completed after {} ms",
            outcome.operation_id,
            outcome.elapsed_ms
        );
        drop(book);
        self.publish(outcome);
    }

    async fn on_deadline(&self, group: &ProfileGroup, generation: u64) {
        let mut book = self.book.lock().await;
        let Some(operation) = book.operations.get_mut(group) else {
            return;
        };
        if operation.generation() != generation || operation.phase != RefreshPhase::InProgress {
            return;
        }
        let outcome = operation.finish(RefreshPhase::TimedOut);
        self.telemetry.track_refresh_timed_out();
        log::warn!(
            "refresh {} for user {} timed out with {} source(s) silent",
            outcome.operation_id,
            group.primary(),
            outcome.still_pending.len()
        );
        drop(book);
        self.publish(outcome);
    }

    fn publish(&self, outcome: RefreshOutcome) {
        // no receivers is fine
        let _ = self.outcomes.send(outcome);
    }
}

impl Drop for RefreshOrchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        // may run on one of the runtime's own workers, where a blocking drop panics
        if let Some(runtime) = self.owned_runtime.take().and_then(|rt| Arc::try_unwrap(rt).ok()) {
            runtime.shutdown_background();
        }
    }
}
