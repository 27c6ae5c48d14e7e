//! Observer queue — insertion-ordered observer registrations
//!
//! The queue is the only structure shared between triggering callers and
//! registering callers. Every mutation and every snapshot takes the same
//! lock, so a [`DispatchPlan`] reflects exactly one point in the queue's
//! history and later mutations never reach a dispatch already in progress.
//!
//! Fire-once observers are claimed when they enter a plan, which keeps them
//! out of any concurrent snapshot. Once invoked they are evicted; a plan
//! dropped before invoking them releases the claim.

use crate::observer::ObserverRef;
use crate::types::EventTypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Identifier assigned to a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

struct Entry {
    id: ObserverId,
    observer: ObserverRef,
    claimed: bool,
}

/// Registrations plus an identity index keyed by observer data address
///
/// A registered observer is kept alive by its entry, so its address cannot
/// be reused while the index refers to it.
#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    index: HashMap<usize, ObserverId>,
}

impl QueueState {
    fn push(&mut self, id: ObserverId, observer: ObserverRef) {
        self.index.insert(address(&observer), id);
        self.entries.push(Entry {
            id,
            observer,
            claimed: false,
        });
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&Entry) -> bool) -> bool {
        let before = self.entries.len();
        let index = &mut self.index;
        self.entries.retain(|e| {
            if pred(e) {
                index.remove(&address(&e.observer));
                false
            } else {
                true
            }
        });
        self.entries.len() != before
    }
}

fn address(observer: &ObserverRef) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

struct QueueInner {
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> ObserverId {
        ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn settle_fire_once(&self, id: ObserverId, invoked: bool) {
        let mut state = self.state();
        if invoked {
            state.remove_where(|e| e.id == id);
            tracing::debug!(observer_id = %id, "Fire-once observer evicted");
        } else if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
            entry.claimed = false;
        }
    }
}

/// Mutable, insertion-ordered set of observers
///
/// Cloning shares the underlying queue.
#[derive(Clone)]
pub struct ObserverQueue {
    inner: Arc<QueueInner>,
}

impl ObserverQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an observer; registering the same instance again is a no-op
    ///
    /// Returns the id of the (possibly pre-existing) registration.
    pub fn register(&self, observer: ObserverRef) -> ObserverId {
        let mut state = self.inner.state();
        if let Some(existing) = state.index.get(&address(&observer)) {
            return *existing;
        }

        let id = self.inner.next_id();
        state.push(id, observer);
        id
    }

    /// Remove an observer by identity
    pub fn unregister(&self, observer: &ObserverRef) -> bool {
        let mut state = self.inner.state();
        let registered = state.index.get(&address(observer)).copied();
        match registered {
            Some(id) => state.remove_where(|e| e.id == id),
            None => false,
        }
    }

    /// Remove an observer by registration id
    pub fn unregister_id(&self, id: ObserverId) -> bool {
        self.inner.state().remove_where(|e| e.id == id)
    }

    /// Make `observer` the only registration (unicast slot semantics)
    pub fn replace(&self, observer: ObserverRef) -> ObserverId {
        let mut state = self.inner.state();
        let kept = state.index.get(&address(&observer)).copied();
        state.remove_where(|e| Some(e.id) != kept);
        if let Some(id) = kept {
            return id;
        }

        let id = self.inner.next_id();
        state.push(id, observer);
        id
    }

    /// Remove every registration
    pub fn clear(&self) {
        let mut state = self.inner.state();
        state.entries.clear();
        state.index.clear();
    }

    /// Number of registrations, including fire-once observers awaiting eviction
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    /// Whether the queue has no registrations
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this observer instance is registered
    pub fn contains(&self, observer: &ObserverRef) -> bool {
        self.inner.state().index.contains_key(&address(observer))
    }

    /// Snapshot the observers matching `event_type`, in insertion order
    ///
    /// Matching fire-once observers are claimed by the returned plan.
    ///
    /// Observer predicates are all evaluated before anything is claimed, so
    /// a panicking predicate leaves the queue unchanged and unlocked.
    pub fn snapshot_matching(&self, event_type: &EventTypeId) -> DispatchPlan {
        let mut state = self.inner.state();

        let selected: Vec<(usize, bool, bool)> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.claimed && entry.observer.matches(event_type))
            .map(|(pos, entry)| {
                (
                    pos,
                    entry.observer.wants_result(),
                    entry.observer.is_fire_once(),
                )
            })
            .collect();

        let mut picked = Vec::with_capacity(selected.len());
        for (pos, wants_result, fire_once) in selected {
            let entry = &mut state.entries[pos];
            if fire_once {
                entry.claimed = true;
            }
            picked.push((entry.id, Arc::clone(&entry.observer), wants_result, fire_once));
        }
        drop(state);

        let wanting_result = picked.iter().filter(|(_, _, wants, _)| *wants).count();
        let observers = picked
            .into_iter()
            .map(|(id, observer, wants_result, fire_once)| PlannedObserver {
                id: Some(id),
                observer,
                wants_result,
                eviction: fire_once.then(|| Eviction {
                    queue: Arc::downgrade(&self.inner),
                    id,
                    invoked: false,
                }),
            })
            .collect();

        DispatchPlan {
            wanting_result,
            observers,
        }
    }
}

impl Default for ObserverQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObserverQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverQueue").field("len", &self.len()).finish()
    }
}

/// Claim on a fire-once registration, settled when the planned observer drops
struct Eviction {
    queue: Weak<QueueInner>,
    id: ObserverId,
    invoked: bool,
}

impl Drop for Eviction {
    fn drop(&mut self) {
        if let Some(inner) = self.queue.upgrade() {
            inner.settle_fire_once(self.id, self.invoked);
        }
    }
}

/// One observer selected for a dispatch
pub struct PlannedObserver {
    id: Option<ObserverId>,
    observer: ObserverRef,
    wants_result: bool,
    eviction: Option<Eviction>,
}

impl PlannedObserver {
    /// Registration id, if the plan came from a queue
    pub fn id(&self) -> Option<ObserverId> {
        self.id
    }

    /// The observer to invoke
    pub fn observer(&self) -> &ObserverRef {
        &self.observer
    }

    /// Whether the observer wanted a result at snapshot time
    pub fn wants_result(&self) -> bool {
        self.wants_result
    }

    /// Record that the observer has been invoked; a fire-once registration
    /// is evicted when this planned observer drops
    pub(crate) fn mark_invoked(&mut self) {
        if let Some(eviction) = self.eviction.as_mut() {
            eviction.invoked = true;
        }
    }
}

impl fmt::Debug for PlannedObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedObserver")
            .field("id", &self.id)
            .field("observer", &self.observer.name())
            .field("wants_result", &self.wants_result)
            .field("fire_once", &self.eviction.is_some())
            .finish()
    }
}

/// Observers selected for one trigger, in snapshot order
#[derive(Debug)]
pub struct DispatchPlan {
    wanting_result: usize,
    observers: Vec<PlannedObserver>,
}

impl DispatchPlan {
    /// Build a plan directly from observers, bypassing a queue
    ///
    /// Fire-once observers in such a plan are not tracked by any queue.
    pub fn from_observers(observers: impl IntoIterator<Item = ObserverRef>) -> Self {
        let observers: Vec<PlannedObserver> = observers
            .into_iter()
            .map(|observer| PlannedObserver {
                id: None,
                wants_result: observer.wants_result(),
                observer,
                eviction: None,
            })
            .collect();
        let wanting_result = observers.iter().filter(|p| p.wants_result).count();
        Self {
            wanting_result,
            observers,
        }
    }

    /// Number of planned observers wanting a result
    pub fn wanting_result(&self) -> usize {
        self.wanting_result
    }

    /// Number of planned observers
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer matched
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// The planned observers, in order
    pub fn observers(&self) -> &[PlannedObserver] {
        &self.observers
    }

    /// Consume the plan into its observers
    pub fn into_observers(self) -> Vec<PlannedObserver> {
        self.observers
    }
}
