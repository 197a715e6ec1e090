//! Reference [`ApplyEngine`] driving any [`ClusterClient`].
//!
//! Objects are applied in dependency waves (depends-on annotation plus an
//! implicit edge from every namespaced object to its declared Namespace) and
//! deleted in the reverse order. After each wave the engine polls the applied
//! or deleted objects until they reconcile or the reconcile timeout expires.
//! The inventory object is written last; a failed write is reported as a
//! stream error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use converge_core::manifest::{annotation, ownership};
use converge_core::{
    diff::drifted, ActuationError, ActuationStatus, ClientError, ClusterClient, DependencyPrevented, Manifest, ObjectId,
    ObjectStatus, ObjectStatusMap, PolicyPrevented, ReconcileStatus, RelationPhase, Relationship, Strategy,
    DEPENDS_ON_ANNOTATION,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ApplyEngine, RunMode, RunOptions};
use crate::event::{ActuationEvent, Event, OpStatus, Operation, WaitStatus};
use crate::inventory::Inventory;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between reconcile polls.
    pub poll_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let poll_ms = std::env::var("CONVERGE_RECONCILE_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(2000);
        Self { poll_interval: Duration::from_millis(poll_ms), channel_capacity: 128 }
    }
}

pub struct ClientEngine<C: ?Sized> {
    client: Arc<C>,
    config: EngineConfig,
}

impl<C: ClusterClient + ?Sized + 'static> ClientEngine<C> {
    pub fn new(client: Arc<C>) -> Self { Self { client, config: EngineConfig::default() } }
    pub fn with_config(client: Arc<C>, config: EngineConfig) -> Self { Self { client, config } }
    pub fn client(&self) -> &Arc<C> { &self.client }
}

impl<C: ClusterClient + ?Sized + 'static> ApplyEngine for ClientEngine<C> {
    fn run(&self, cancel: CancellationToken, inventory: &ObjectId, objects: Vec<Manifest>, options: RunOptions) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let run = Run {
            client: self.client.clone(),
            poll_interval: self.config.poll_interval,
            inventory: inventory.clone(),
            options,
            tx,
            cancel,
            statuses: ObjectStatusMap::new(),
            abandoned: BTreeSet::new(),
        };
        tokio::spawn(run.execute(objects));
        rx
    }
}

/// The receiver went away or the run was cancelled.
struct Closed;

enum Outcome {
    Done(Json),
    Skipped(ActuationError),
    Failed(ActuationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Current,
    InProgress,
    Failed,
}

type Graph = BTreeMap<ObjectId, BTreeSet<ObjectId>>;

struct Run<C: ?Sized> {
    client: Arc<C>,
    poll_interval: Duration,
    inventory: ObjectId,
    options: RunOptions,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    statuses: ObjectStatusMap,
    abandoned: BTreeSet<ObjectId>,
}

impl<C: ClusterClient + ?Sized> Run<C> {
    async fn execute(mut self, objects: Vec<Manifest>) {
        let result = match self.options.mode {
            RunMode::Apply => {
                let namespaces: BTreeSet<String> = objects.iter().map(|m| m.id().namespace.clone()).filter(|ns| !ns.is_empty()).collect();
                match self.apply_all(objects).await {
                    Ok(()) => self.delete_all(Operation::Prune, &namespaces).await,
                    Err(closed) => Err(closed),
                }
            }
            RunMode::Destroy => self.delete_all(Operation::Delete, &BTreeSet::new()).await,
        };
        if result.is_err() {
            debug!(inventory = %self.inventory, "run stopped before completion");
            return;
        }
        if let Err(e) = self.persist().await {
            warn!(inventory = %self.inventory, error = %e, "failed to write inventory object");
            let _ = self.emit(Event::error(ActuationError::from(e))).await;
        }
    }

    async fn emit(&self, ev: Event) -> Result<(), Closed> {
        if self.cancel.is_cancelled() {
            return Err(Closed);
        }
        self.tx.send(ev).await.map_err(|_| Closed)
    }

    async fn report(&mut self, op: Operation, id: &ObjectId, status: OpStatus, error: Option<ActuationError>, object: Option<Json>) -> Result<(), Closed> {
        let actuation = match status {
            OpStatus::Pending => ActuationStatus::Pending,
            OpStatus::Successful => ActuationStatus::Succeeded,
            OpStatus::Skipped => ActuationStatus::Skipped,
            OpStatus::Failed => ActuationStatus::Failed,
        };
        self.statuses.insert(id.clone(), ObjectStatus::new(op.strategy(), actuation));
        let mut ev = ActuationEvent::object(id.clone(), status);
        ev.error = error;
        ev.object = object;
        self.emit(Event::actuation(op, ev)).await
    }

    fn waiting(&self) -> bool { !self.options.reconcile_timeout.is_zero() }

    /// First relation of `id` that has not finished, if any.
    fn blocked_by(&self, id: &ObjectId, relations: &[ObjectId], strategy: Strategy, relationship: Relationship) -> Option<ActuationError> {
        for relation in relations {
            let status = self.statuses.get(relation).copied();
            let actuation = status.map(|s| s.actuation).unwrap_or_default();
            let reconcile = status.map(|s| s.reconcile).unwrap_or(ReconcileStatus::Pending);
            let phase = if actuation != ActuationStatus::Succeeded || status.map(|s| s.strategy) != Some(strategy) {
                RelationPhase::Actuation
            } else if self.waiting() && reconcile != ReconcileStatus::Succeeded {
                RelationPhase::Reconcile
            } else {
                continue;
            };
            return Some(ActuationError::DependencyPrevented(DependencyPrevented {
                object: id.clone(),
                strategy,
                relationship,
                relation: relation.clone(),
                relation_phase: phase,
                relation_actuation: actuation,
                relation_reconcile: reconcile,
            }));
        }
        None
    }

    async fn apply_all(&mut self, objects: Vec<Manifest>) -> Result<(), Closed> {
        let mut by_id = BTreeMap::new();
        let mut deps = BTreeMap::new();
        for m in objects {
            match m.depends_on() {
                Ok(d) => {
                    deps.insert(m.id().clone(), d.into_vec());
                    by_id.insert(m.id().clone(), m);
                }
                Err(e) => {
                    // Stays a graph node so its dependents are skipped.
                    let id = m.id().clone();
                    deps.insert(id.clone(), Vec::new());
                    self.report(Operation::Apply, &id, OpStatus::Failed, Some(ActuationError::failed(e.to_string())), None).await?;
                }
            }
        }
        let graph = dependency_graph(deps);
        let (waves, cyclic) = waves(&graph);
        for id in &cyclic {
            warn!(%id, "dependency cycle");
            self.report(Operation::Apply, id, OpStatus::Failed, Some(ActuationError::failed(format!("dependency cycle detected at {id}"))), None).await?;
        }

        for wave in waves {
            let mut applied = Vec::new();
            let mut unapplied = Vec::new();
            for id in wave {
                let Some(m) = by_id.get(&id) else { continue };
                let relations: Vec<ObjectId> = graph.get(&id).map(|d| d.iter().cloned().collect()).unwrap_or_default();
                if let Some(cause) = self.blocked_by(&id, &relations, Strategy::Apply, Relationship::Dependency) {
                    debug!(%id, cause = %cause, "apply skipped");
                    self.report(Operation::Apply, &id, OpStatus::Skipped, Some(cause), None).await?;
                    unapplied.push(id);
                    continue;
                }
                match self.apply_one(m).await {
                    Outcome::Done(body) => {
                        self.report(Operation::Apply, &id, OpStatus::Successful, None, Some(body)).await?;
                        applied.push(id);
                    }
                    Outcome::Skipped(cause) => {
                        self.report(Operation::Apply, &id, OpStatus::Skipped, Some(cause), None).await?;
                        unapplied.push(id);
                    }
                    Outcome::Failed(cause) => {
                        self.report(Operation::Apply, &id, OpStatus::Failed, Some(cause), None).await?;
                        unapplied.push(id);
                    }
                }
            }
            if self.waiting() {
                self.skip_waits(&unapplied).await?;
                self.await_reconcile(applied, Strategy::Apply).await?;
            }
        }
        Ok(())
    }

    async fn apply_one(&self, m: &Manifest) -> Outcome {
        let live = match self.client.get(m.id()).await {
            Ok(live) => live,
            Err(e) => return Outcome::Failed(e.into()),
        };
        let stamped = m.owned_by(&self.inventory);
        let result = match live {
            None => self.client.create(&stamped).await,
            Some(live) => {
                let status = ownership(&live, &self.inventory);
                if !self.options.policy.permits(status) {
                    return Outcome::Skipped(ActuationError::PolicyPrevented(PolicyPrevented {
                        strategy: Strategy::Apply,
                        policy: self.options.policy,
                        status,
                    }));
                }
                if !drifted(stamped.raw(), &live) {
                    debug!(id = %m.id(), "live object matches; no update");
                    return Outcome::Done(live);
                }
                self.client.update(&stamped).await
            }
        };
        match result {
            Ok(body) => Outcome::Done(body),
            Err(e) => Outcome::Failed(e.into()),
        }
    }

    async fn delete_all(&mut self, op: Operation, declared_namespaces: &BTreeSet<String>) -> Result<(), Closed> {
        let targets = self.options.prune.clone();
        let mut live = BTreeMap::new();
        let mut deps = BTreeMap::new();
        for id in &targets {
            match self.client.get(id).await {
                Ok(Some(body)) => {
                    deps.insert(id.clone(), live_dependencies(&body));
                    live.insert(id.clone(), body);
                }
                Ok(None) => { deps.insert(id.clone(), Vec::new()); }
                Err(e) => self.report(op, id, OpStatus::Failed, Some(e.into()), None).await?,
            }
        }
        let graph = dependency_graph(deps);
        let (waves, cyclic) = waves(&graph);
        for id in &cyclic {
            warn!(%id, "dependency cycle");
            self.report(op, id, OpStatus::Failed, Some(ActuationError::failed(format!("dependency cycle detected at {id}"))), None).await?;
        }
        let mut dependents: BTreeMap<ObjectId, Vec<ObjectId>> = BTreeMap::new();
        for (id, ds) in &graph {
            for d in ds {
                dependents.entry(d.clone()).or_default().push(id.clone());
            }
        }
        let retained: BTreeSet<String> =
            self.options.members.difference(&targets).map(|m| m.namespace.clone()).filter(|ns| !ns.is_empty()).collect();

        for wave in waves.into_iter().rev() {
            let mut deleted = Vec::new();
            let mut kept = Vec::new();
            for id in wave {
                if id.is_namespace() {
                    let in_use = declared_namespaces.contains(&id.name)
                        || retained.contains(&id.name)
                        || targets.iter().any(|t| {
                            t.namespace == id.name
                                && !matches!(self.statuses.get(t), Some(s) if s.strategy == Strategy::Delete && s.actuation == ActuationStatus::Succeeded)
                        });
                    if in_use {
                        info!(namespace = %id.name, "namespace still in use; not deleting");
                        let cause = ActuationError::NamespaceInUse { namespace: id.name.clone() };
                        self.report(op, &id, OpStatus::Skipped, Some(cause), None).await?;
                        kept.push(id);
                        continue;
                    }
                }
                if let Some(body) = live.get(&id) {
                    let status = ownership(body, &self.inventory);
                    if !self.options.policy.permits(status) {
                        let cause = ActuationError::PolicyPrevented(PolicyPrevented { strategy: Strategy::Delete, policy: self.options.policy, status });
                        self.abandoned.insert(id.clone());
                        self.report(op, &id, OpStatus::Skipped, Some(cause), None).await?;
                        kept.push(id);
                        continue;
                    }
                }
                let relations = dependents.get(&id).cloned().unwrap_or_default();
                if let Some(cause) = self.blocked_by(&id, &relations, Strategy::Delete, Relationship::Dependent) {
                    debug!(%id, cause = %cause, "delete skipped");
                    self.report(op, &id, OpStatus::Skipped, Some(cause), None).await?;
                    kept.push(id);
                    continue;
                }
                match self.client.delete(&id).await {
                    Ok(()) | Err(ClientError::NotFound(_)) => {
                        self.report(op, &id, OpStatus::Successful, None, None).await?;
                        deleted.push(id);
                    }
                    Err(e) => {
                        self.report(op, &id, OpStatus::Failed, Some(e.into()), None).await?;
                        kept.push(id);
                    }
                }
            }
            if self.waiting() {
                self.skip_waits(&kept).await?;
                self.await_reconcile(deleted, Strategy::Delete).await?;
            }
        }
        Ok(())
    }

    async fn skip_waits(&mut self, ids: &[ObjectId]) -> Result<(), Closed> {
        for id in ids {
            if let Some(s) = self.statuses.get_mut(id) {
                s.reconcile = ReconcileStatus::Skipped;
            }
            self.emit(Event::wait(id.clone(), WaitStatus::Skipped)).await?;
        }
        Ok(())
    }

    async fn await_reconcile(&mut self, ids: Vec<ObjectId>, strategy: Strategy) -> Result<(), Closed> {
        if ids.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.options.reconcile_timeout;
        let mut pending: BTreeSet<ObjectId> = ids.into_iter().collect();
        for id in &pending {
            self.emit(Event::wait(id.clone(), WaitStatus::Pending)).await?;
        }
        loop {
            let mut settled = Vec::new();
            for id in &pending {
                let readiness = match self.client.get(id).await {
                    Ok(live) => readiness(strategy, live.as_ref()),
                    Err(e) => {
                        debug!(%id, error = %e, "reconcile poll failed");
                        Readiness::InProgress
                    }
                };
                match readiness {
                    Readiness::Current => settled.push((id.clone(), WaitStatus::Successful, ReconcileStatus::Succeeded)),
                    Readiness::Failed => settled.push((id.clone(), WaitStatus::Failed, ReconcileStatus::Failed)),
                    Readiness::InProgress => {}
                }
            }
            for (id, wait, reconcile) in settled {
                pending.remove(&id);
                self.settle(&id, reconcile);
                self.emit(Event::wait(id, wait)).await?;
            }
            if pending.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                for id in std::mem::take(&mut pending) {
                    warn!(%id, %strategy, "reconcile timed out");
                    self.settle(&id, ReconcileStatus::Timeout);
                    self.emit(Event::wait(id, WaitStatus::Timeout)).await?;
                }
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Closed),
                _ = tokio::time::sleep(self.poll_interval.min(deadline - now)) => {}
            }
        }
    }

    fn settle(&mut self, id: &ObjectId, reconcile: ReconcileStatus) {
        if let Some(s) = self.statuses.get_mut(id) {
            s.reconcile = reconcile;
        }
    }

    async fn persist(&self) -> Result<(), ClientError> {
        let mut members = self.options.members.clone();
        for (id, status) in &self.statuses {
            match (status.strategy, status.actuation) {
                (Strategy::Apply, ActuationStatus::Succeeded) => { members.insert(id.clone()); }
                (Strategy::Delete, ActuationStatus::Succeeded) => { members.remove(id); }
                _ => {}
            }
        }
        for id in &self.abandoned {
            members.remove(id);
        }

        if self.options.mode == RunMode::Destroy && members.is_empty() {
            return match self.client.delete(&self.inventory).await {
                Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }
        let manifest = Inventory::with_members(self.inventory.clone(), members)
            .to_manifest()
            .map_err(|e| ClientError::Api(format!("{e:#}")))?;
        match self.client.get(&self.inventory).await? {
            None => { self.client.create(&manifest).await?; }
            Some(live) if drifted(manifest.raw(), &live) => { self.client.update(&manifest).await?; }
            Some(_) => {}
        }
        debug!(inventory = %self.inventory, "inventory object written");
        Ok(())
    }
}

fn readiness(strategy: Strategy, live: Option<&Json>) -> Readiness {
    match (strategy, live) {
        (Strategy::Delete, None) => Readiness::Current,
        (Strategy::Delete, Some(_)) => Readiness::InProgress,
        (Strategy::Apply, None) => Readiness::Failed,
        (Strategy::Apply, Some(obj)) => apply_readiness(obj),
    }
}

/// Objects without status are current. Otherwise the controller must have
/// observed the latest generation and no condition may report trouble.
fn apply_readiness(obj: &Json) -> Readiness {
    let Some(status) = obj.get("status") else { return Readiness::Current };
    let generation = obj.pointer("/metadata/generation").and_then(Json::as_i64);
    let observed = status.get("observedGeneration").and_then(Json::as_i64);
    if let (Some(g), Some(o)) = (generation, observed) {
        if o < g {
            return Readiness::InProgress;
        }
    }
    let conditions = status.get("conditions").and_then(Json::as_array);
    for c in conditions.into_iter().flatten() {
        let ty = c.get("type").and_then(Json::as_str);
        let st = c.get("status").and_then(Json::as_str);
        match (ty, st) {
            (Some("Stalled" | "Failed"), Some("True")) => return Readiness::Failed,
            (Some("Ready"), Some("False")) | (Some("Reconciling"), Some("True")) => return Readiness::InProgress,
            _ => {}
        }
    }
    Readiness::Current
}

fn live_dependencies(obj: &Json) -> Vec<ObjectId> {
    annotation(obj, DEPENDS_ON_ANNOTATION)
        .map(|raw| raw.split(',').filter_map(ObjectId::parse_dependency).collect())
        .unwrap_or_default()
}

/// Edges restricted to the node set, plus namespaced object -> its Namespace.
fn dependency_graph(deps: BTreeMap<ObjectId, Vec<ObjectId>>) -> Graph {
    let nodes: BTreeSet<ObjectId> = deps.keys().cloned().collect();
    deps.into_iter()
        .map(|(id, ds)| {
            let mut edges: BTreeSet<ObjectId> = ds
                .into_iter()
                .filter(|d| {
                    let inside = nodes.contains(d);
                    if !inside {
                        debug!(%id, dependency = %d, "dependency outside this set; ignoring");
                    }
                    inside && d != &id
                })
                .collect();
            if id.is_namespaced() {
                let ns = ObjectId::cluster_scoped("", "Namespace", id.namespace.clone());
                if nodes.contains(&ns) {
                    edges.insert(ns);
                }
            }
            (id, edges)
        })
        .collect()
}

/// Kahn layering. Returns the waves, leaves first, and the nodes stuck on or
/// behind a cycle.
fn waves(graph: &Graph) -> (Vec<Vec<ObjectId>>, Vec<ObjectId>) {
    let mut remaining = graph.clone();
    let mut out = Vec::new();
    loop {
        let ready: Vec<ObjectId> = remaining.iter().filter(|(_, d)| d.is_empty()).map(|(id, _)| id.clone()).collect();
        if ready.is_empty() {
            break;
        }
        for id in &ready {
            remaining.remove(id);
        }
        for d in remaining.values_mut() {
            for id in &ready {
                d.remove(id);
            }
        }
        out.push(ready);
    }
    (out, remaining.into_keys().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(kind: &str, name: &str) -> ObjectId { ObjectId::new("apps", kind, "ns", name) }

    #[test]
    fn waves_put_dependencies_first() {
        let ns = ObjectId::cluster_scoped("", "Namespace", "ns");
        let deps: BTreeMap<_, _> = [
            (id("Deployment", "a"), vec![id("ConfigMap", "b")]),
            (id("ConfigMap", "b"), vec![]),
            (ns.clone(), vec![]),
        ]
        .into_iter()
        .collect();
        let (waves, cyclic) = waves(&dependency_graph(deps));
        assert!(cyclic.is_empty());
        assert_eq!(waves, vec![vec![ns], vec![id("ConfigMap", "b")], vec![id("Deployment", "a")]]);
    }

    #[test]
    fn cycles_are_reported() {
        let deps: BTreeMap<_, _> = [
            (id("A", "a"), vec![id("B", "b")]),
            (id("B", "b"), vec![id("A", "a")]),
            (id("C", "c"), vec![]),
        ]
        .into_iter()
        .collect();
        let (waves, cyclic) = waves(&dependency_graph(deps));
        assert_eq!(waves, vec![vec![id("C", "c")]]);
        assert_eq!(cyclic, vec![id("A", "a"), id("B", "b")]);
    }

    #[test]
    fn readiness_follows_generation_and_conditions() {
        assert_eq!(apply_readiness(&json!({"metadata": {"generation": 2}})), Readiness::Current);
        let stale = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 1}});
        assert_eq!(apply_readiness(&stale), Readiness::InProgress);
        let not_ready = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 2, "conditions": [{"type": "Ready", "status": "False"}]}});
        assert_eq!(apply_readiness(&not_ready), Readiness::InProgress);
        let stalled = json!({"status": {"conditions": [{"type": "Stalled", "status": "True"}]}});
        assert_eq!(apply_readiness(&stalled), Readiness::Failed);
        assert_eq!(readiness(Strategy::Delete, None), Readiness::Current);
    }
}
