//! Deduplicating work queue keyed by [`ObjectId`].
//!
//! Pending entries live in a map with a separate FIFO order, so re-adding an
//! id replaces its body without moving it. An id handed out by [`ObjectQueue::next`]
//! is in flight until [`ObjectQueue::done`]; adds that arrive meanwhile are
//! parked and re-queued on `done`, so one id is never worked on twice at once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use converge_core::ObjectId;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// First retry delay; doubles per consecutive failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self { Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000) } }
}

/// Last observed state of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: ObjectId,
    /// Last observed body, if any.
    pub object: Option<Json>,
    /// The object was observed deleted.
    pub deleted: bool,
    pub retries: u32,
}

impl QueueEntry {
    pub fn observed(id: ObjectId, object: Json) -> Self { Self { id, object: Some(object), deleted: false, retries: 0 } }

    pub fn tombstone(id: ObjectId, last_known: Option<Json>) -> Self { Self { id, object: last_known, deleted: true, retries: 0 } }
}

#[derive(Default)]
struct State {
    pending: FxHashMap<ObjectId, QueueEntry>,
    order: VecDeque<ObjectId>,
    processing: FxHashSet<ObjectId>,
    dirty: FxHashMap<ObjectId, QueueEntry>,
    // bumped on every add; a delayed retry only lands if it still matches
    generation: FxHashMap<ObjectId, u64>,
    // backoff timers not yet fired, per id
    timers: FxHashMap<ObjectId, u32>,
    failures: FxHashMap<ObjectId, u32>,
}

impl State {
    fn enqueue(&mut self, entry: QueueEntry) {
        if self.processing.contains(&entry.id) {
            self.dirty.insert(entry.id.clone(), entry);
            return;
        }
        if !self.pending.contains_key(&entry.id) {
            self.order.push_back(entry.id.clone());
        }
        self.pending.insert(entry.id.clone(), entry);
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        while let Some(id) = self.order.pop_front() {
            if let Some(entry) = self.pending.remove(&id) {
                self.processing.insert(id);
                return Some(entry);
            }
        }
        None
    }

    /// Drop the generation of an id nothing refers to any more.
    fn prune(&mut self, id: &ObjectId) {
        let idle = !self.pending.contains_key(id)
            && !self.dirty.contains_key(id)
            && !self.processing.contains(id)
            && !self.timers.contains_key(id);
        if idle {
            self.generation.remove(id);
        }
    }
}

#[derive(Default)]
pub struct ObjectQueue {
    state: Mutex<State>,
    notify: Notify,
    config: QueueConfig,
}

impl ObjectQueue {
    pub fn new(config: QueueConfig) -> Self { Self { state: Mutex::default(), notify: Notify::new(), config } }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Insert or replace the pending entry for `entry.id`.
    pub fn add(&self, entry: QueueEntry) {
        {
            let mut st = self.lock();
            *st.generation.entry(entry.id.clone()).or_insert(0) += 1;
            trace!(id = %entry.id, deleted = entry.deleted, "queued");
            st.enqueue(entry);
        }
        self.notify.notify_one();
    }

    /// Re-queue `entry` after an exponential backoff. Dropped when a newer
    /// add for the same id arrives first.
    pub fn retry(self: &Arc<Self>, mut entry: QueueEntry) {
        let (delay, generation) = {
            let mut st = self.lock();
            let failures = st.failures.entry(entry.id.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            entry.retries = *failures;
            *st.timers.entry(entry.id.clone()).or_insert(0) += 1;
            let generation = st.generation.get(&entry.id).copied().unwrap_or(0);
            (self.backoff(entry.retries), generation)
        };
        debug!(id = %entry.id, retries = entry.retries, delay_ms = delay.as_millis() as u64, "retry scheduled");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.requeue(entry, generation);
        });
    }

    fn requeue(&self, entry: QueueEntry, generation: u64) {
        {
            let mut st = self.lock();
            if let Some(n) = st.timers.get_mut(&entry.id) {
                *n -= 1;
                if *n == 0 {
                    st.timers.remove(&entry.id);
                }
            }
            if st.generation.get(&entry.id).copied().unwrap_or(0) != generation {
                trace!(id = %entry.id, "retry superseded");
                st.prune(&entry.id);
                return;
            }
            st.enqueue(entry);
        }
        self.notify.notify_one();
    }

    fn backoff(&self, retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(31);
        self.config.base_delay.saturating_mul(1u32 << exp).min(self.config.max_delay)
    }

    /// Clear retry bookkeeping for `id`.
    pub fn forget(&self, id: &ObjectId) {
        let mut st = self.lock();
        st.failures.remove(id);
        st.prune(id);
    }

    /// Consecutive failures recorded for `id`.
    pub fn failures(&self, id: &ObjectId) -> u32 { self.lock().failures.get(id).copied().unwrap_or(0) }

    /// Wait for the next entry. Cancel-safe: an entry is only taken when
    /// the future completes.
    pub async fn next(&self) -> QueueEntry {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(entry) = st.pop() {
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return entry;
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker for `id`.
    pub fn done(&self, id: &ObjectId) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(id);
            let requeued = match st.dirty.remove(id) {
                Some(entry) => {
                    st.enqueue(entry);
                    true
                }
                None => false,
            };
            st.prune(id);
            requeued
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Hand back an entry taken with [`ObjectQueue::next`] but not worked on.
    /// A newer parked add for the same id wins over it.
    pub fn release(&self, entry: QueueEntry) {
        {
            let mut st = self.lock();
            st.processing.remove(&entry.id);
            let entry = st.dirty.remove(&entry.id).unwrap_or(entry);
            st.enqueue(entry);
        }
        self.notify.notify_one();
    }

    /// Entries waiting to be handed out, parked ones included.
    pub fn len(&self) -> usize {
        let st = self.lock();
        st.pending.len() + st.dirty.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Pending entry for `id`, if queued.
    pub fn pending(&self, id: &ObjectId) -> Option<QueueEntry> {
        let st = self.lock();
        st.pending.get(id).or_else(|| st.dirty.get(id)).cloned()
    }
}
