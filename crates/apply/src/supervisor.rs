//! One apply-or-destroy cycle: compute the prune set, run the engine, drain its
//! events through the processor and fold the outcome into the inventory.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use converge_core::{Gvk, InventoryPolicy, Manifest, Metrics, MultiError, ObjectId, ObjectStatusMap, Strategy, SyncError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::{ApplyEngine, RunOptions};
use crate::event::Event;
use crate::inventory::Inventory;
use crate::processor::{EventProcessor, Flow, Processed};
use crate::stats::SyncStats;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub reconcile_timeout: Duration,
    pub policy: InventoryPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let reconcile_timeout = std::env::var("CONVERGE_RECONCILE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        Self { reconcile_timeout, policy: InventoryPolicy::default() }
    }
}

pub struct Supervisor {
    engine: Arc<dyn ApplyEngine>,
    inventory: Inventory,
    config: SupervisorConfig,
    metrics: Arc<Metrics>,
    last_statuses: ObjectStatusMap,
    last_stats: SyncStats,
    last_sync: Option<DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(engine: Arc<dyn ApplyEngine>, inventory: Inventory, config: SupervisorConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            engine,
            inventory,
            config,
            metrics,
            last_statuses: ObjectStatusMap::new(),
            last_stats: SyncStats::new(),
            last_sync: None,
        }
    }

    pub fn inventory(&self) -> &Inventory { &self.inventory }
    pub fn config(&self) -> &SupervisorConfig { &self.config }
    /// Statuses recorded by the most recent cycle, complete or not.
    pub fn last_statuses(&self) -> &ObjectStatusMap { &self.last_statuses }
    pub fn last_stats(&self) -> &SyncStats { &self.last_stats }
    /// When the most recent cycle finished.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> { self.last_sync }

    /// Apply `declared` and prune inventory members that are no longer declared.
    ///
    /// Returns the kinds of the applied objects, for watching, and every error
    /// observed. Per-object failures never stop the cycle; a stream error or
    /// cancellation does, keeping the statuses recorded so far.
    pub async fn apply(&mut self, cancel: &CancellationToken, declared: Vec<Manifest>) -> (BTreeSet<Gvk>, MultiError) {
        let span = info_span!("apply", cycle = %Uuid::new_v4(), inventory = %self.inventory.id());
        self.apply_cycle(cancel, declared).instrument(span).await
    }

    async fn apply_cycle(&mut self, cancel: &CancellationToken, declared: Vec<Manifest>) -> (BTreeSet<Gvk>, MultiError) {
        let started = Instant::now();
        self.last_stats = SyncStats::new();

        let declared_ids: BTreeSet<ObjectId> = declared.iter().map(|m| m.id().clone()).collect();
        let (managed, disabled): (Vec<Manifest>, Vec<Manifest>) = declared.into_iter().partition(|m| !m.management_disabled());
        for m in &disabled {
            if self.inventory.abandon(m.id()) {
                info!(id = %m.id(), "management disabled; abandoning");
            }
        }

        let prune = self.inventory.diff(&declared_ids);
        let managed_ids: Vec<ObjectId> = managed.iter().map(|m| m.id().clone()).collect();
        let declared_kinds: Vec<(ObjectId, Gvk)> = managed.iter().map(|m| (m.id().clone(), m.gvk().clone())).collect();
        info!(objects = managed.len(), prune = prune.len(), "starting apply");

        let options = RunOptions::apply(self.inventory.members().clone(), prune)
            .with_policy(self.config.policy)
            .with_reconcile_timeout(self.config.reconcile_timeout);
        let rx = self.engine.run(cancel.clone(), self.inventory.id(), managed, options);

        let mut processor = EventProcessor::new(self.inventory.id().clone(), self.metrics.clone());
        if drain(cancel, rx, &mut processor, Strategy::Apply).await {
            processor.settle_unreported(&managed_ids, Strategy::Apply);
        }
        let out = processor.finish();

        // A kind is dropped only when every object of that kind hit UnknownType.
        let mut kinds: BTreeSet<Gvk> =
            declared_kinds.into_iter().filter(|(id, _)| !out.unknown_types.contains(id)).map(|(_, gvk)| gvk).collect();
        kinds.extend(out.observed_kinds.iter().cloned());

        let errors = self.finish_cycle(out, started);
        (kinds, errors)
    }

    /// Delete every inventory member.
    pub async fn destroy(&mut self, cancel: &CancellationToken) -> MultiError {
        let span = info_span!("destroy", cycle = %Uuid::new_v4(), inventory = %self.inventory.id());
        self.destroy_cycle(cancel).instrument(span).await
    }

    async fn destroy_cycle(&mut self, cancel: &CancellationToken) -> MultiError {
        let started = Instant::now();
        self.last_stats = SyncStats::new();

        let members = self.inventory.members().clone();
        info!(objects = members.len(), "starting destroy");
        let options = RunOptions::destroy(members.clone())
            .with_policy(self.config.policy)
            .with_reconcile_timeout(self.config.reconcile_timeout);
        let rx = self.engine.run(cancel.clone(), self.inventory.id(), Vec::new(), options);

        let mut processor = EventProcessor::new(self.inventory.id().clone(), self.metrics.clone());
        if drain(cancel, rx, &mut processor, Strategy::Delete).await {
            processor.settle_unreported(&members, Strategy::Delete);
        }
        let out = processor.finish();
        self.finish_cycle(out, started)
    }

    fn finish_cycle(&mut self, out: Processed, started: Instant) -> MultiError {
        for (id, status) in &out.statuses {
            self.inventory.record(id, status);
        }
        for id in &out.abandoned {
            self.inventory.abandon(id);
        }
        let elapsed = started.elapsed();
        self.metrics.observe_apply_duration(elapsed.as_secs_f64() * 1000.0);
        self.last_sync = Some(Utc::now());
        if out.errors.is_empty() {
            info!(stats = %out.stats, elapsed_ms = elapsed.as_millis() as u64, "cycle finished");
        } else {
            warn!(stats = %out.stats, errors = out.errors.len(), elapsed_ms = elapsed.as_millis() as u64, "cycle finished with errors");
        }
        self.last_statuses = out.statuses;
        self.last_stats = out.stats;
        out.errors
    }
}

/// Feed events to `processor` until the channel closes (`true`), a stream
/// error, or cancellation (`false`).
async fn drain(cancel: &CancellationToken, mut rx: mpsc::Receiver<Event>, processor: &mut EventProcessor, operation: Strategy) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(%operation, "cancelled; returning partial status");
                processor.record_error(SyncError::Cancelled { operation });
                return false;
            }
            ev = rx.recv() => match ev {
                Some(ev) => {
                    if processor.process(ev) == Flow::Stop {
                        return false;
                    }
                }
                None => return true,
            }
        }
    }
}
