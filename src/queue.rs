//! Bounded multi-class update queue with aging and per-document coalescing.
//!
//! Four FIFO lanes, one per [`PriorityClass`], each ordered by detection
//! sequence. `dequeue` always serves the highest non-empty lane. Before
//! every dispatch, events that waited in their lane longer than the lane's
//! latency bound are promoted one class up (keeping their sequence, so a
//! promoted event lands in detection order among its new neighbours).
//!
//! Per-document serialization:
//!
//! - a document is either absent, *pending* (one event in some lane),
//!   *in flight* (handed to a worker), or in flight with one *deferred*
//!   successor;
//! - a new event for a pending document is merged into the pending one
//!   ([`ChangeEvent::superseded_by`]), keeping its place in line;
//! - a new event for an in-flight document is parked as the deferred
//!   successor and released by [`UpdateQueue::complete`].
//!
//! So no two events for one document are ever dispatched concurrently.
//!
//! Capacity counts pending plus deferred events. When full, `enqueue`
//! blocks or rejects per [`FullPolicy`]. Under `reject` a higher-class
//! event first tries to make room by displacing the newest event of a
//! strictly lower class; the displaced event is handed back to the caller,
//! which owns re-admitting it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{FullPolicy, SchedulerConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::{ChangeEvent, DocumentId, PriorityClass};

/// What happened to an enqueued event.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued,
    /// Merged into the document's pending event.
    Coalesced,
    /// Document is in flight; parked until it completes.
    Deferred,
    /// Queued, and this lower-class event was pushed out to make room.
    /// Only under [`FullPolicy::Reject`].
    Displaced(Box<ChangeEvent>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepth {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub in_flight: usize,
    pub deferred: usize,
}

#[derive(Debug)]
struct Entry {
    event: ChangeEvent,
    /// When the event entered its current lane.
    since: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    lanes: [VecDeque<Entry>; 4],
    /// Lane of each pending document.
    pending: HashMap<DocumentId, PriorityClass>,
    in_flight: HashSet<DocumentId>,
    deferred: HashMap<DocumentId, ChangeEvent>,
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.pending.len() + self.deferred.len()
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.deferred.is_empty()
    }

    /// Insert keeping the lane sorted by sequence.
    fn insert(&mut self, event: ChangeEvent, since: Instant) {
        let class = event.priority;
        let lane = &mut self.lanes[class.index()];
        let at = lane.partition_point(|e| e.event.sequence < event.sequence);
        self.pending.insert(event.document_id.clone(), class);
        lane.insert(at, Entry { event, since });
    }

    fn take_pending(&mut self, id: &DocumentId) -> Option<Entry> {
        let class = self.pending.remove(id)?;
        let lane = &mut self.lanes[class.index()];
        let pos = lane.iter().position(|e| &e.event.document_id == id)?;
        lane.remove(pos)
    }

    /// Promote every event that outlived its lane's latency bound.
    fn age(&mut self, now: Instant, bounds: &[Duration; 4]) -> usize {
        let mut promoted = 0;
        for class in [PriorityClass::Low, PriorityClass::Medium, PriorityClass::High] {
            let bound = bounds[class.index()];
            let lane = &mut self.lanes[class.index()];
            let mut kept = VecDeque::with_capacity(lane.len());
            let mut overdue = Vec::new();
            for entry in lane.drain(..) {
                if now.duration_since(entry.since) > bound {
                    overdue.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *lane = kept;
            for entry in overdue {
                let event = entry.event.with_priority(class.promoted());
                promoted += 1;
                self.insert(event, now);
            }
        }
        promoted
    }

    fn pop_highest(&mut self) -> Option<ChangeEvent> {
        for class in PriorityClass::DESCENDING {
            if let Some(entry) = self.lanes[class.index()].pop_front() {
                self.pending.remove(&entry.event.document_id);
                return Some(entry.event);
            }
        }
        None
    }

    /// Make room for an event of `class` by dropping the newest event of
    /// the lowest strictly-lower class.
    fn displace_below(&mut self, class: PriorityClass) -> Option<ChangeEvent> {
        for victim in [PriorityClass::Low, PriorityClass::Medium, PriorityClass::High] {
            if victim >= class {
                break;
            }
            if let Some(entry) = self.lanes[victim.index()].pop_back() {
                self.pending.remove(&entry.event.document_id);
                return Some(entry.event);
            }
        }
        None
    }
}

pub struct UpdateQueue {
    capacity: usize,
    policy: FullPolicy,
    bounds: [Duration; 4],
    state: Mutex<QueueState>,
    sequence: AtomicU64,
    items: Notify,
    space: Notify,
    idle: Notify,
}

impl UpdateQueue {
    pub fn new(config: &SchedulerConfig) -> Self {
        let mut bounds = [Duration::ZERO; 4];
        for class in PriorityClass::DESCENDING {
            bounds[class.index()] = config.latency_bound(class);
        }
        Self {
            capacity: config.capacity,
            policy: config.full_policy,
            bounds,
            state: Mutex::new(QueueState::default()),
            sequence: AtomicU64::new(0),
            items: Notify::new(),
            space: Notify::new(),
            idle: Notify::new(),
        }
    }

    /// Next detection sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn enqueue(&self, event: ChangeEvent) -> SyncResult<EnqueueOutcome> {
        loop {
            let space = self.space.notified();
            match self.try_enqueue(event.clone(), false)? {
                Some(outcome) => return Ok(outcome),
                None if self.policy == FullPolicy::Reject => {
                    return Err(SyncError::QueueFull {
                        capacity: self.capacity,
                    })
                }
                None => {
                    debug!(document_id = %event.document_id, "update queue full, waiting");
                    space.await;
                }
            }
        }
    }

    /// Put work back without capacity checks. Used by workers for
    /// re-queues after rollbacks and version conflicts, which must never
    /// wait on the queue they are draining.
    pub fn requeue(&self, event: ChangeEvent) -> SyncResult<EnqueueOutcome> {
        match self.try_enqueue(event, true)? {
            Some(outcome) => Ok(outcome),
            None => Err(SyncError::QueueFull {
                capacity: self.capacity,
            }),
        }
    }

    /// `Ok(None)` means full.
    fn try_enqueue(&self, event: ChangeEvent, force: bool) -> SyncResult<Option<EnqueueOutcome>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SyncError::QueueClosed);
        }
        let id = event.document_id.clone();

        if state.in_flight.contains(&id) {
            if let Some(prev) = state.deferred.get(&id) {
                let merged = prev.superseded_by(&event);
                state.deferred.insert(id, merged);
                return Ok(Some(EnqueueOutcome::Coalesced));
            }
            if !force && state.len() >= self.capacity {
                return Ok(None);
            }
            state.deferred.insert(id, event);
            return Ok(Some(EnqueueOutcome::Deferred));
        }

        if let Some(entry) = state.take_pending(&id) {
            let merged = entry.event.superseded_by(&event);
            // A merged event only moves if its class went up.
            let since = if merged.priority == entry.event.priority {
                entry.since
            } else {
                Instant::now()
            };
            state.insert(merged, since);
            return Ok(Some(EnqueueOutcome::Coalesced));
        }

        let mut outcome = EnqueueOutcome::Queued;
        if !force && state.len() >= self.capacity {
            let victim = match self.policy {
                FullPolicy::Reject => state.displace_below(event.priority),
                FullPolicy::Block => None,
            };
            match victim {
                Some(victim) => {
                    info!(
                        document_id = %victim.document_id,
                        priority = %victim.priority,
                        "displaced by higher-priority work"
                    );
                    outcome = EnqueueOutcome::Displaced(Box::new(victim));
                }
                None => return Ok(None),
            }
        }
        state.insert(event, Instant::now());
        drop(state);
        self.items.notify_one();
        Ok(Some(outcome))
    }

    /// Wait for the next event. `None` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<ChangeEvent> {
        loop {
            let items = self.items.notified();
            match self.try_dequeue() {
                Ok(Some(event)) => return Some(event),
                Ok(None) => items.await,
                Err(_) => return None,
            }
        }
    }

    /// Next event if one is ready. `Err` once closed and drained.
    pub fn try_dequeue(&self) -> SyncResult<Option<ChangeEvent>> {
        let mut state = self.state.lock().unwrap();
        let promoted = state.age(Instant::now(), &self.bounds);
        if promoted > 0 {
            debug!(promoted, "aged events promoted");
        }
        match state.pop_highest() {
            Some(event) => {
                state.in_flight.insert(event.document_id.clone());
                let more = !state.pending.is_empty();
                drop(state);
                self.space.notify_one();
                if more {
                    self.items.notify_one();
                }
                Ok(Some(event))
            }
            None if state.closed => Err(SyncError::QueueClosed),
            None => Ok(None),
        }
    }

    /// Mark a document's in-flight event done. Releases its deferred
    /// successor, if any, into the lanes. Returns whether one was released.
    pub fn complete(&self, id: &DocumentId) -> bool {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(id);
        let released = match state.deferred.remove(id) {
            Some(next) => {
                state.insert(next, Instant::now());
                true
            }
            None => false,
        };
        let idle = state.is_idle();
        drop(state);
        if released {
            self.items.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
        released
    }

    /// Whether a newer event for this in-flight document is waiting.
    pub fn is_superseded(&self, id: &DocumentId) -> bool {
        self.state.lock().unwrap().deferred.contains_key(id)
    }

    /// Move a pending (or deferred) document to another class.
    pub fn override_priority(&self, id: &DocumentId, class: PriorityClass) -> bool {
        self.reclass(id, |_| class)
    }

    /// Raise a pending (or deferred) document to at least `class`. A
    /// document already at or above it keeps its class and its place.
    pub fn raise_priority(&self, id: &DocumentId, class: PriorityClass) -> bool {
        self.reclass(id, |current| current.max(class))
    }

    fn reclass(&self, id: &DocumentId, to: impl Fn(PriorityClass) -> PriorityClass) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(deferred) = state.deferred.get_mut(id) {
            deferred.priority = to(deferred.priority);
            return true;
        }
        match state.take_pending(id) {
            Some(entry) => {
                let class = to(entry.event.priority);
                if class == entry.event.priority {
                    state.insert(entry.event, entry.since);
                } else {
                    state.insert(entry.event.with_priority(class), Instant::now());
                }
                drop(state);
                self.items.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stop accepting events and wake every waiter. Pending events can
    /// still be dequeued.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.items.notify_waiters();
        self.space.notify_waiters();
        self.idle.notify_waiters();
    }

    /// Resolve once nothing is pending, in flight or deferred.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.state.lock().unwrap().is_idle() {
                return;
            }
            idle.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth(&self) -> QueueDepth {
        let state = self.state.lock().unwrap();
        QueueDepth {
            critical: state.lanes[PriorityClass::Critical.index()].len(),
            high: state.lanes[PriorityClass::High.index()].len(),
            medium: state.lanes[PriorityClass::Medium.index()].len(),
            low: state.lanes[PriorityClass::Low.index()].len(),
            in_flight: state.in_flight.len(),
            deferred: state.deferred.len(),
        }
    }

    /// Pending events, highest class first, in dispatch order.
    pub fn pending(&self) -> Vec<ChangeEvent> {
        let state = self.state.lock().unwrap();
        PriorityClass::DESCENDING
            .iter()
            .flat_map(|c| state.lanes[c.index()].iter().map(|e| e.event.clone()))
            .collect()
    }
}
