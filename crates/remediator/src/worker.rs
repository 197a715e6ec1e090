//! Drift-correcting worker: one queue entry at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_core::manifest::ownership;
use converge_core::{diff::drifted, ClientError, ClusterClient, Metrics, ObjectId, OwnershipStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::declared::DeclaredLookup;
use crate::queue::{ObjectQueue, QueueEntry};

/// What a remediation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    /// Declared and live state already agree.
    Unchanged,
    /// Not ours to touch.
    Ignored,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Created => "create",
            Action::Updated => "update",
            Action::Deleted => "delete",
            Action::Unchanged => "none",
            Action::Ignored => "ignore",
        }
    }
}

pub struct Worker<C: ?Sized> {
    client: Arc<C>,
    queue: Arc<ObjectQueue>,
    declared: Arc<dyn DeclaredLookup>,
    inventory: ObjectId,
    metrics: Arc<Metrics>,
    api_timeout: Duration,
    paused: watch::Receiver<bool>,
}

impl<C: ClusterClient + ?Sized> Worker<C> {
    pub fn new(
        client: Arc<C>,
        queue: Arc<ObjectQueue>,
        declared: Arc<dyn DeclaredLookup>,
        inventory: ObjectId,
        metrics: Arc<Metrics>,
        api_timeout: Duration,
        paused: watch::Receiver<bool>,
    ) -> Self {
        Self { client, queue, declared, inventory, metrics, api_timeout, paused }
    }

    /// Process entries until cancelled. An entry already being processed is
    /// finished first; one taken but not started goes back to the queue.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if !self.wait_unpaused(&cancel).await {
                return;
            }
            let entry = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                entry = self.queue.next() => entry,
            };
            self.metrics.set_queue_depth(self.queue.len());
            // paused while waiting for the entry: hold it until resumed
            if !self.wait_unpaused(&cancel).await {
                self.queue.release(entry);
                return;
            }
            self.process(entry).await;
        }
    }

    async fn wait_unpaused(&self, cancel: &CancellationToken) -> bool {
        let mut paused = self.paused.clone();
        loop {
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = paused.changed() => if changed.is_err() { return true; },
            }
        }
    }

    pub async fn process(&self, entry: QueueEntry) {
        let id = entry.id.clone();
        let started = Instant::now();
        match self.remediate(&entry).await {
            Ok(action) => {
                self.queue.forget(&id);
                match action {
                    Action::Created | Action::Updated | Action::Deleted => {
                        debug!(%id, action = action.as_str(), "remediated");
                        self.metrics.record_remediation(action.as_str());
                    }
                    Action::Unchanged | Action::Ignored => {}
                }
            }
            Err(e) if e.is_conflict() => {
                debug!(%id, error = %e, "stale view; refreshing");
                self.metrics.record_resource_conflict(&id.kind);
                if let Err(e) = self.refresh(&entry).await {
                    warn!(%id, error = %e, "refresh failed; will retry");
                    self.metrics.record_retry();
                    self.queue.retry(entry);
                }
            }
            Err(e) => {
                warn!(%id, error = %e, "remediation failed; will retry");
                self.metrics.record_retry();
                self.queue.retry(entry);
            }
        }
        self.queue.done(&id);
        self.metrics.observe_remediate_duration(started.elapsed().as_secs_f64() * 1000.0);
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T, ClientError>>) -> Result<T, ClientError> {
        tokio::time::timeout(self.api_timeout, fut).await.map_err(|_| ClientError::Timeout(self.api_timeout))?
    }

    /// Converge one object onto its declared state.
    pub async fn remediate(&self, entry: &QueueEntry) -> Result<Action, ClientError> {
        let id = &entry.id;
        let Some(declared) = self.declared.get(id) else {
            // Undeclared: delete it only if this inventory owns it.
            let Some(live) = entry.object.as_ref().filter(|_| !entry.deleted) else { return Ok(Action::Unchanged) };
            if ownership(live, &self.inventory) != OwnershipStatus::Match {
                return Ok(Action::Ignored);
            }
            self.call(self.client.delete(id)).await?;
            return Ok(Action::Deleted);
        };
        if declared.management_disabled() {
            return Ok(Action::Ignored);
        }
        let want = declared.owned_by(&self.inventory);
        if entry.deleted {
            self.call(self.client.create(&want)).await?;
            return Ok(Action::Created);
        }
        let Some(live) = entry.object.as_ref() else { return Ok(Action::Unchanged) };
        if ownership(live, &self.inventory) == OwnershipStatus::NoMatch {
            debug!(%id, "owned by another inventory; leaving it alone");
            return Ok(Action::Ignored);
        }
        if !drifted(want.raw(), live) {
            return Ok(Action::Unchanged);
        }
        self.call(self.client.update(&want)).await?;
        Ok(Action::Updated)
    }

    /// Re-read `entry` from the cluster and queue what was found: the live
    /// body, or a tombstone when it is gone.
    pub async fn refresh(&self, entry: &QueueEntry) -> Result<(), ClientError> {
        match self.call(self.client.get(&entry.id)).await? {
            Some(live) => self.queue.add(QueueEntry::observed(entry.id.clone(), live)),
            None => self.queue.add(QueueEntry::tombstone(entry.id.clone(), entry.object.clone())),
        }
        Ok(())
    }
}
