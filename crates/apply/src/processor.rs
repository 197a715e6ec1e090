//! Turns the engine's event stream into object statuses, stats and typed errors.
//!
//! One processor handles one cycle and is driven by a single task, in arrival
//! order; it is the only writer of the cycle's status map and stats.

use std::collections::BTreeSet;
use std::sync::Arc;

use converge_core::{
    ActuationError, ActuationStatus, Gvk, Metrics, MultiError, ObjectId, ObjectStatus, ObjectStatusMap, ReconcileStatus,
    Strategy, SyncError,
};
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::classify::{classify, Phase};
use crate::event::{ActuationEvent, Event, OpStatus, Operation, WaitEvent, WaitStatus};
use crate::stats::SyncStats;

/// Whether the caller should keep draining the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Everything a cycle learned from its stream.
#[derive(Debug, Clone, Default)]
pub struct Processed {
    pub statuses: ObjectStatusMap,
    pub stats: SyncStats,
    pub errors: MultiError,
    /// Objects whose apply failed because the server does not serve the kind.
    pub unknown_types: BTreeSet<ObjectId>,
    /// Objects released from the inventory without being deleted.
    pub abandoned: BTreeSet<ObjectId>,
    /// Kinds carried by successful apply events.
    pub observed_kinds: BTreeSet<Gvk>,
}

pub struct EventProcessor {
    inventory: ObjectId,
    metrics: Arc<Metrics>,
    out: Processed,
}

fn gvk_of(obj: &Json) -> Option<Gvk> {
    let api_version = obj.get("apiVersion")?.as_str()?;
    let kind = obj.get("kind")?.as_str()?;
    Some(Gvk::from_api_version(api_version, kind))
}

impl EventProcessor {
    pub fn new(inventory: ObjectId, metrics: Arc<Metrics>) -> Self {
        Self { inventory, metrics, out: Processed::default() }
    }

    pub fn statuses(&self) -> &ObjectStatusMap { &self.out.statuses }
    pub fn stats(&self) -> &SyncStats { &self.out.stats }
    pub fn errors(&self) -> &MultiError { &self.out.errors }

    pub fn process(&mut self, event: Event) -> Flow {
        match event {
            Event::Apply(ev) => self.actuation(Operation::Apply, ev),
            Event::Prune(ev) => self.actuation(Operation::Prune, ev),
            Event::Delete(ev) => self.actuation(Operation::Delete, ev),
            Event::Wait(ev) => self.wait(ev),
            Event::Error(ev) => {
                self.out.stats.add_error();
                warn!(inventory = %self.inventory, error = %ev.error, "engine reported a stream error");
                let inventory = self.inventory.clone();
                self.push(classify(Some(ev.error), &inventory, Phase::Stream));
                Flow::Stop
            }
        }
    }

    /// Record an error observed outside of the stream (e.g. cancellation).
    pub fn record_error(&mut self, e: SyncError) { self.push(Some(e)); }

    /// Mark every id the stream left without a terminal actuation as Skipped.
    pub fn settle_unreported<'a>(&mut self, ids: impl IntoIterator<Item = &'a ObjectId>, strategy: Strategy) {
        for id in ids {
            if self.out.statuses.get(id).is_some_and(|s| s.actuation.is_terminal()) { continue; }
            warn!(%id, %strategy, "stream ended without a terminal status; marking skipped");
            self.out.statuses.insert(id.clone(), ObjectStatus::new(strategy, ActuationStatus::Skipped));
        }
    }

    pub fn finish(self) -> Processed { self.out }

    fn push(&mut self, e: Option<SyncError>) {
        let Some(e) = e else { return };
        self.metrics.record_sync_error(e.kind());
        debug!(error = %e, "classified");
        self.out.errors.push(e);
    }

    fn set_actuation(&mut self, op: Operation, id: &ObjectId, actuation: ActuationStatus) {
        let entry = self.out.statuses.entry(id.clone()).or_insert_with(|| ObjectStatus::new(op.strategy(), actuation));
        if actuation == ActuationStatus::Pending && entry.actuation.is_terminal() && entry.strategy == op.strategy() {
            return;
        }
        *entry = ObjectStatus::new(op.strategy(), actuation);
    }

    fn actuation(&mut self, op: Operation, ev: ActuationEvent) -> Flow {
        self.out.stats.add_actuation(op, ev.status);
        let Some(id) = ev.id else {
            // progress marker
            return Flow::Continue;
        };
        self.metrics.record_operation(&op.to_string(), &ev.status.to_string());
        match ev.status {
            OpStatus::Pending => self.set_actuation(op, &id, ActuationStatus::Pending),
            OpStatus::Successful => {
                self.set_actuation(op, &id, ActuationStatus::Succeeded);
                if op == Operation::Apply {
                    if let Some(gvk) = ev.object.as_ref().and_then(gvk_of) {
                        self.out.observed_kinds.insert(gvk);
                    }
                }
            }
            OpStatus::Failed => {
                self.set_actuation(op, &id, ActuationStatus::Failed);
                if op == Operation::Apply && matches!(ev.error, Some(ActuationError::UnknownType(_))) {
                    self.out.unknown_types.insert(id.clone());
                }
                warn!(%id, operation = %op, error = ?ev.error.as_ref().map(|e| e.to_string()), "actuation failed");
                self.push(classify(ev.error, &id, Phase::Failed(op)));
            }
            OpStatus::Skipped => {
                self.set_actuation(op, &id, ActuationStatus::Skipped);
                if op != Operation::Apply && matches!(ev.error, Some(ActuationError::PolicyPrevented(_))) {
                    debug!(%id, operation = %op, "object owned elsewhere; abandoning");
                    self.out.abandoned.insert(id.clone());
                }
                self.push(classify(ev.error, &id, Phase::Skipped(op)));
            }
        }
        Flow::Continue
    }

    fn wait(&mut self, ev: WaitEvent) -> Flow {
        self.out.stats.add_wait(ev.status);
        self.metrics.record_wait(&ev.status.to_string());
        let Some(status) = self.out.statuses.get_mut(&ev.id) else {
            debug!(id = %ev.id, status = %ev.status, "wait event for an object that was never actuated; ignoring");
            return Flow::Continue;
        };
        let next = match ev.status {
            WaitStatus::Pending => ReconcileStatus::Pending,
            WaitStatus::Successful => ReconcileStatus::Succeeded,
            WaitStatus::Failed => ReconcileStatus::Failed,
            WaitStatus::Timeout => ReconcileStatus::Timeout,
            WaitStatus::Skipped => ReconcileStatus::Skipped,
        };
        if next == ReconcileStatus::Pending && status.reconcile.is_terminal() {
            return Flow::Continue;
        }
        status.reconcile = next;
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment_id() -> ObjectId { ObjectId::new("apps", "Deployment", "test-namespace", "random-name") }
    fn test_id() -> ObjectId { ObjectId::new("configsync.test", "Test", "test-namespace", "random-name") }

    fn processor() -> EventProcessor {
        EventProcessor::new(ObjectId::new("", "ConfigMap", "test-namespace", "rs"), Arc::new(Metrics::new()))
    }

    #[test]
    fn apply_events_update_status_and_stats() {
        let mut p = processor();
        let failed = Event::Apply(ActuationEvent::object(deployment_id(), OpStatus::Failed).with_error(ActuationError::failed("test error")));
        assert_eq!(p.process(failed), Flow::Continue);
        p.process(Event::apply(test_id(), OpStatus::Successful));
        let out = p.finish();

        let mut want_stats = SyncStats::new();
        want_stats.add_actuation(Operation::Apply, OpStatus::Failed);
        want_stats.add_actuation(Operation::Apply, OpStatus::Successful);
        assert_eq!(out.stats, want_stats);

        let want: ObjectStatusMap = [
            (deployment_id(), ObjectStatus::new(Strategy::Apply, ActuationStatus::Failed)),
            (test_id(), ObjectStatus::new(Strategy::Apply, ActuationStatus::Succeeded)),
        ]
        .into_iter()
        .collect();
        assert_eq!(out.statuses, want);
        assert_eq!(
            out.errors.errors(),
            &[SyncError::Resource { id: deployment_id(), source: ActuationError::failed("test error") }]
        );
    }

    #[test]
    fn prune_events_use_delete_strategy() {
        let mut p = processor();
        p.process(Event::Prune(ActuationEvent::object(deployment_id(), OpStatus::Failed).with_error(ActuationError::failed("test error"))));
        p.process(Event::prune(test_id(), OpStatus::Successful));
        let out = p.finish();
        assert_eq!(out.statuses[&deployment_id()], ObjectStatus::new(Strategy::Delete, ActuationStatus::Failed));
        assert_eq!(out.statuses[&test_id()], ObjectStatus::new(Strategy::Delete, ActuationStatus::Succeeded));
        assert!(matches!(out.errors.errors(), [SyncError::Prune { .. }]));
        assert_eq!(out.stats.actuation(Operation::Prune, OpStatus::Successful), 1);
    }

    #[test]
    fn wait_events_only_touch_actuated_objects() {
        let mut p = processor();
        p.process(Event::apply(test_id(), OpStatus::Successful));
        p.process(Event::wait(test_id(), WaitStatus::Successful));
        p.process(Event::wait(deployment_id(), WaitStatus::Failed));
        let out = p.finish();
        assert_eq!(out.statuses.len(), 1);
        assert_eq!(out.statuses[&test_id()].reconcile, ReconcileStatus::Succeeded);
        assert_eq!(out.stats.wait.values().sum::<u64>(), 2);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn progress_markers_only_count() {
        let mut p = processor();
        p.process(Event::Apply(ActuationEvent::progress(OpStatus::Pending)));
        p.process(Event::Prune(ActuationEvent::progress(OpStatus::Successful)));
        let out = p.finish();
        assert!(out.statuses.is_empty());
        assert_eq!(out.stats.actuation(Operation::Apply, OpStatus::Pending), 1);
    }

    #[test]
    fn skip_is_never_a_failure() {
        let mut p = processor();
        p.process(Event::apply(test_id(), OpStatus::Skipped));
        let out = p.finish();
        assert_eq!(out.statuses[&test_id()].actuation, ActuationStatus::Skipped);
        assert!(out.errors.is_empty());
        assert_eq!(out.stats.actuation(Operation::Apply, OpStatus::Failed), 0);
    }

    #[test]
    fn stream_error_stops_processing() {
        let mut p = processor();
        assert_eq!(p.process(Event::error(ActuationError::failed("etcdserver: request is too large"))), Flow::Stop);
        let out = p.finish();
        assert!(matches!(out.errors.errors(), [SyncError::LargeInventory { .. }]));
        assert_eq!(out.stats.errors, 1);
    }

    #[test]
    fn unknown_types_are_tracked() {
        let mut p = processor();
        p.process(Event::Apply(ActuationEvent::object(test_id(), OpStatus::Failed).with_error(ActuationError::UnknownType("unknown type".into()))));
        let out = p.finish();
        assert!(out.unknown_types.contains(&test_id()));
    }
}
