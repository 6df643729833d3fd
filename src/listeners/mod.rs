//! Per-user listener sets and best-effort delivery of aggregate views.
//!
//! Registration bookkeeping lives behind the hub's state lock. Delivery runs
//! after that lock is released. Each handle has a gate that remembers the
//! newest view accepted per profile group and lets one thread push at a
//! time, so a handle never sees a group's view older than one it already
//! received for that group and never hears from a registration that has
//! been closed. No lock is held while a listener runs, so a listener may
//! call back into the hub.


use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::DeliveryError;
use crate::store::AggregateView;
use crate::types::{ProfileGroup, UserId};

/// Receives aggregate updates.
pub trait DataChangedListener: Send + Sync {
    fn on_data_changed(&self, view: &AggregateView) -> Result<(), DeliveryError>;
}

pub type ListenerHandle = Arc<dyn DataChangedListener>;

/// Identity of a handle: the allocation it points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(usize);

impl ListenerKey {
    pub fn of(handle: &ListenerHandle) -> Self {
        ListenerKey(Arc::as_ptr(handle) as *const () as usize)
    }
}

type Versioned = (u64, Arc<AggregateView>);

struct Queued {
    group: UserId,
    view: Arc<AggregateView>,
    target: Arc<Registration>,
}

#[derive(Default)]
struct GateState {
    // newest view accepted per profile group (keyed by primary user),
    // pushed or about to be
    last: HashMap<UserId, Versioned>,
    // at most one entry per group, in arrival order
    pending: VecDeque<Queued>,
    // thread currently pushing to the handle
    drainer: Option<ThreadId>,
}

impl GateState {
    fn enqueue(&mut self, queued: Queued) {
        match self.pending.iter_mut().find(|q| q.group == queued.group) {
            Some(slot) => *slot = queued,
            None => self.pending.push_back(queued),
        }
    }
}

/// Per-handle outbox. Exactly one thread pushes at a time; others leave
/// their view in the group's pending slot and the pushing thread drains
/// the slots in order.
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One (user, handle) registration.
pub struct Registration {
    user: UserId,
    key: ListenerKey,
    handle: ListenerHandle,
    gate: Arc<Gate>,
    open: AtomicBool,
}

impl Registration {
    pub fn key(&self) -> ListenerKey {
        self.key
    }

    /// Stops all further deliveries through this registration. If another
    /// thread is pushing to the same handle, waits for it to finish; a
    /// listener closing itself from inside its callback does not wait.
    pub fn close(&self) {
        let mut state = self.gate.lock();
        self.open.store(false, Ordering::SeqCst);
        state
            .pending
            .retain(|queued| !std::ptr::eq(queued.target.as_ref(), self));
        let me = thread::current().id();
        while state.drainer.is_some() && state.drainer != Some(me) {
            state = self
                .gate
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failures: Vec<(ListenerKey, DeliveryError)>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    by_user: HashMap<UserId, Vec<Arc<Registration>>>,
    // gate shared by every registration of one handle, with a use count
    gates: HashMap<ListenerKey, (usize, Arc<Gate>)>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `user`. Returns `true` if it already was.
    pub fn add_listener(&mut self, handle: ListenerHandle, user: UserId) -> bool {
        let key = ListenerKey::of(&handle);
        if self.registration(key, user).is_some() {
            return true;
        }
        let (count, gate) = self
            .gates
            .entry(key)
            .or_insert_with(|| (0, Arc::new(Gate::default())));
        *count += 1;
        let registration = Arc::new(Registration {
            user,
            key,
            handle,
            gate: Arc::clone(gate),
            open: AtomicBool::new(true),
        });
        self.by_user.entry(user).or_default().push(registration);
        false
    }

    /// Unregisters `handle` for `user` and hands back the registration so
    /// the caller can close it once the state lock is released.
    pub fn remove_listener(&mut self, handle: &ListenerHandle, user: UserId) -> Option<Arc<Registration>> {
        let key = ListenerKey::of(handle);
        let registrations = self.by_user.get_mut(&user)?;
        let position = registrations.iter().position(|r| r.key == key)?;
        let removed = registrations.remove(position);
        if registrations.is_empty() {
            self.by_user.remove(&user);
        }
        if let Some((count, _)) = self.gates.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.gates.remove(&key);
            }
        }
        Some(removed)
    }

    pub fn registration(&self, key: ListenerKey, user: UserId) -> Option<Arc<Registration>> {
        self.by_user
            .get(&user)?
            .iter()
            .find(|r| r.key == key)
            .cloned()
    }

    /// Registrations of every member of `group`, one per handle, primary
    /// user's first.
    pub fn listeners_for(&self, group: &ProfileGroup) -> Vec<Arc<Registration>> {
        let mut seen = HashSet::new();
        let mut listeners = Vec::new();
        for user in group.members() {
            let Some(registrations) = self.by_user.get(&user) else {
                continue;
            };
            for registration in registrations {
                if seen.insert(registration.key) {
                    listeners.push(Arc::clone(registration));
                }
            }
        }
        listeners
    }

    /// Users with at least one registration.
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.by_user.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Registration count per user, for diagnostics.
    pub fn counts(&self) -> Vec<(UserId, usize)> {
        self.users()
            .into_iter()
            .map(|user| (user, self.count_for(user)))
            .collect()
    }

    pub fn count_for(&self, user: UserId) -> usize {
        self.by_user.get(&user).map(Vec::len).unwrap_or(0)
    }
}

/// Pushes `view` (stamped `version`) to each registration. Versions are
/// compared only against earlier views of the same profile group. A failure
/// on one handle is recorded and the loop moves on. When another thread is
/// already pushing to a handle, the view is left for that thread and
/// counted as delivered here.
pub fn deliver(
    registrations: &[Arc<Registration>],
    version: u64,
    view: &Arc<AggregateView>,
) -> DeliveryReport {
    let group = view.profile_group.primary();
    let mut report = DeliveryReport::default();
    for registration in registrations {
        let gate = &registration.gate;
        let mut state = gate.lock();
        if !registration.is_open() {
            report.skipped += 1;
            continue;
        }
        let (stale, unchanged) = match state.last.get(&group) {
            Some((last_version, last_view)) => (*last_version >= version, **last_view == **view),
            None => (false, false),
        };
        if stale {
            report.skipped += 1;
            continue;
        }
        state.last.insert(group, (version, Arc::clone(view)));
        if unchanged {
            report.skipped += 1;
            continue;
        }
        state.enqueue(Queued {
            group,
            view: Arc::clone(view),
            target: Arc::clone(registration),
        });
        if state.drainer.is_some() {
            report.delivered += 1;
            continue;
        }

        state.drainer = Some(thread::current().id());
        while let Some(Queued { view: next, target, .. }) = state.pending.pop_front() {
            if !target.is_open() {
                continue;
            }
            drop(state);
            match target.handle.on_data_changed(&next) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    log::warn!(
                        "failed to deliver safety data to listener of user {}: {}",
                        target.user,
                        err
                    );
                    report.failures.push((target.key, err));
                }
            }
            state = gate.lock();
        }
        state.drainer = None;
        drop(state);
        gate.idle.notify_all();
    }
    report
}
