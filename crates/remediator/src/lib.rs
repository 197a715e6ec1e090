//! converge remediator: keeps live objects on their declared state between
//! sync cycles. Watches feed an [`ObjectQueue`]; a pool of [`Worker`]s drains it.

#![forbid(unsafe_code)]

pub mod declared;
pub mod queue;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use converge_core::{ClusterClient, Metrics, ObjectId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use declared::{DeclaredLookup, DeclaredSet};
pub use queue::{ObjectQueue, QueueConfig, QueueEntry};
pub use worker::{Action, Worker};

#[derive(Debug, Clone)]
pub struct RemediatorConfig {
    pub workers: usize,
    /// Bound on every outbound client call.
    pub api_timeout: Duration,
    pub queue: QueueConfig,
}

impl Default for RemediatorConfig {
    fn default() -> Self {
        let workers = std::env::var("CONVERGE_REMEDIATOR_WORKERS").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(4);
        let api_timeout = std::env::var("CONVERGE_API_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));
        Self { workers: workers.max(1), api_timeout, queue: QueueConfig::default() }
    }
}

pub struct Remediator<C: ?Sized> {
    client: Arc<C>,
    queue: Arc<ObjectQueue>,
    declared: Arc<DeclaredSet>,
    inventory: ObjectId,
    metrics: Arc<Metrics>,
    config: RemediatorConfig,
    paused: watch::Sender<bool>,
}

impl<C: ClusterClient + ?Sized + 'static> Remediator<C> {
    pub fn new(client: Arc<C>, inventory: ObjectId, declared: Arc<DeclaredSet>, config: RemediatorConfig, metrics: Arc<Metrics>) -> Self {
        let queue = Arc::new(ObjectQueue::new(config.queue.clone()));
        let (paused, _) = watch::channel(false);
        Self { client, queue, declared, inventory, metrics, config, paused }
    }

    /// Where watches deliver observed objects.
    pub fn queue(&self) -> &Arc<ObjectQueue> { &self.queue }
    pub fn declared(&self) -> &Arc<DeclaredSet> { &self.declared }
    pub fn inventory(&self) -> &ObjectId { &self.inventory }

    /// Stop taking new entries; in-flight ones finish.
    pub fn pause(&self) { self.paused.send_replace(true); }
    pub fn resume(&self) { self.paused.send_replace(false); }
    pub fn is_paused(&self) -> bool { *self.paused.borrow() }

    pub fn worker(&self) -> Worker<C> {
        Worker::new(
            self.client.clone(),
            self.queue.clone(),
            self.declared.clone(),
            self.inventory.clone(),
            self.metrics.clone(),
            self.config.api_timeout,
            self.paused.subscribe(),
        )
    }

    /// Run the worker pool until `cancel` fires. Workers finish the entry in
    /// hand; pending entries stay queued for the next run.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers {
            let worker = self.worker();
            let cancel = cancel.clone();
            workers.spawn(async move { worker.run(cancel).await });
        }
        info!(workers = self.config.workers, inventory = %self.inventory, "remediator started");
        cancel.cancelled().await;
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "remediator worker ended abnormally");
            }
        }
        info!(pending = self.queue.len(), "remediator stopped");
    }
}
