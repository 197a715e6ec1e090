#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use converge_core::memory::Verb;
use converge_core::{ClientError, ClusterClient, Manifest, MemoryClient, Metrics, ObjectId, INVENTORY_ANNOTATION};
use converge_remediator::{Action, DeclaredSet, QueueEntry, Remediator, RemediatorConfig};
use serde_json::{json, Value as Json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn inventory() -> ObjectId { ObjectId::new("", "ConfigMap", "shipping", "inventory") }

fn role(verbs: &[&str]) -> Manifest {
    Manifest::from_json(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "Role",
        "metadata": { "name": "admin", "namespace": "shipping" },
        "rules": [{ "apiGroups": [""], "resources": ["pods"], "verbs": verbs }]
    }))
    .unwrap()
}

fn cluster_role() -> Manifest {
    Manifest::from_json(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": { "name": "viewer" },
        "rules": []
    }))
    .unwrap()
}

fn cluster_role_binding() -> Manifest {
    Manifest::from_json(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": { "name": "viewer" },
        "roleRef": { "apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": "viewer" },
        "subjects": []
    }))
    .unwrap()
}

/// MemoryClient whose updates take `delay` and announce when they start.
struct SlowUpdates {
    inner: MemoryClient,
    delay: Duration,
    started: Notify,
}

#[async_trait]
impl ClusterClient for SlowUpdates {
    async fn get(&self, id: &ObjectId) -> Result<Option<Json>, ClientError> { self.inner.get(id).await }
    async fn create(&self, obj: &Manifest) -> Result<Json, ClientError> { self.inner.create(obj).await }
    async fn update(&self, obj: &Manifest) -> Result<Json, ClientError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.update(obj).await
    }
    async fn delete(&self, id: &ObjectId) -> Result<(), ClientError> { self.inner.delete(id).await }
}

struct Fixture {
    client: Arc<MemoryClient>,
    declared: Arc<DeclaredSet>,
    metrics: Arc<Metrics>,
    remediator: Remediator<MemoryClient>,
}

fn fixture(declared: Vec<Manifest>) -> Fixture {
    let client = Arc::new(MemoryClient::new());
    let set = Arc::new(DeclaredSet::new());
    set.update(declared);
    let metrics = Arc::new(Metrics::new());
    let config = RemediatorConfig { workers: 2, api_timeout: Duration::from_secs(1), ..RemediatorConfig::default() };
    let remediator = Remediator::new(client.clone(), inventory(), set.clone(), config, metrics.clone());
    Fixture { client, declared: set, metrics, remediator }
}

fn observed(client: &MemoryClient, m: &Manifest) -> QueueEntry {
    QueueEntry::observed(m.id().clone(), client.object(m.id()).unwrap())
}

#[tokio::test]
async fn updates_drifted_objects() {
    let f = fixture(vec![role(&["get", "list"])]);
    f.client.seed(&role(&["get"]).owned_by(&inventory()));
    let worker = f.remediator.worker();

    let entry = observed(&f.client, &role(&[]));
    assert_eq!(worker.remediate(&entry).await.unwrap(), Action::Updated);
    let live = f.client.object(role(&[]).id()).unwrap();
    assert_eq!(live["rules"][0]["verbs"], json!(["get", "list"]));

    // converged now
    let entry = observed(&f.client, &role(&[]));
    worker.process(entry).await;
    assert_eq!(f.client.mutations().updates, 1);
    assert_eq!(f.metrics.counter("remediations_total", &[("action", "update")]), 0);
}

#[tokio::test]
async fn deletes_undeclared_objects_this_inventory_owns() {
    let f = fixture(vec![]);
    let owned = role(&["get"]).owned_by(&inventory());
    f.client.seed(&owned);
    f.client.seed(&cluster_role());
    let worker = f.remediator.worker();

    worker.process(observed(&f.client, &owned)).await;
    worker.process(observed(&f.client, &cluster_role())).await;
    assert!(f.client.object(owned.id()).is_none());
    // never managed here
    assert!(f.client.object(cluster_role().id()).is_some());
    assert_eq!(f.metrics.counter("remediations_total", &[("action", "delete")]), 1);
}

#[tokio::test]
async fn recreates_deleted_declared_objects() {
    let f = fixture(vec![cluster_role_binding(), cluster_role()]);
    let worker = f.remediator.worker();
    for m in [cluster_role_binding(), cluster_role()] {
        worker.process(QueueEntry::tombstone(m.id().clone(), Some(m.raw().clone()))).await;
    }
    for m in [cluster_role_binding(), cluster_role()] {
        let live = f.client.object(m.id()).expect("recreated");
        assert_eq!(live["metadata"]["annotations"][INVENTORY_ANNOTATION], inventory().to_string());
    }
    assert_eq!(f.client.mutations().creates, 2);
    assert_eq!(f.metrics.counter("remediations_total", &[("action", "create")]), 2);
}

#[tokio::test]
async fn management_disabled_objects_are_left_alone() {
    let mut disabled = role(&["get"]);
    disabled.set_annotation(converge_core::MANAGED_ANNOTATION, converge_core::MANAGED_DISABLED);
    let f = fixture(vec![disabled.clone()]);
    let worker = f.remediator.worker();
    let outcome = worker.remediate(&QueueEntry::tombstone(disabled.id().clone(), None)).await.unwrap();
    assert_eq!(outcome, Action::Ignored);
    assert!(f.client.ids().is_empty());
}

#[tokio::test]
async fn run_returns_when_cancelled_with_an_empty_queue() {
    let f = fixture(vec![]);
    let cancel = CancellationToken::new();
    let worker = f.remediator.worker();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.expect("worker did not stop").unwrap();
}

#[tokio::test]
async fn run_returns_when_cancelled_with_a_busy_queue() {
    let f = fixture(vec![cluster_role_binding(), cluster_role()]);
    // creates keep failing so the queue never drains
    f.client.fail_verb(Verb::Create, ClientError::Api("injected".into()));
    let cancel = CancellationToken::new();
    let worker = f.remediator.worker();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    for m in [cluster_role_binding(), cluster_role()] {
        f.remediator.queue().add(QueueEntry::tombstone(m.id().clone(), None));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.metrics.counter("remediator_retries_total", &[]) >= 2);
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.expect("worker did not stop").unwrap();
}

#[tokio::test]
async fn refresh_not_found_queues_a_tombstone() {
    let f = fixture(vec![]);
    let worker = f.remediator.worker();
    let entry = QueueEntry::observed(role(&[]).id().clone(), role(&["get"]).into_raw());
    worker.refresh(&entry).await.unwrap();
    let queued = f.remediator.queue().pending(&entry.id).unwrap();
    assert!(queued.deleted);
    assert_eq!(queued.object, entry.object);
}

#[tokio::test]
async fn refresh_found_queues_the_live_object() {
    let f = fixture(vec![]);
    f.client.seed(&role(&["get", "watch"]));
    let worker = f.remediator.worker();
    let entry = QueueEntry::observed(role(&[]).id().clone(), role(&["get"]).into_raw());
    worker.refresh(&entry).await.unwrap();
    let queued = f.remediator.queue().pending(&entry.id).unwrap();
    assert!(!queued.deleted);
    assert_eq!(queued.object.unwrap()["rules"][0]["verbs"], json!(["get", "watch"]));
}

#[tokio::test]
async fn refresh_api_error_leaves_the_queue_alone() {
    let f = fixture(vec![]);
    f.client.fail_verb(Verb::Get, ClientError::Api("some error".into()));
    let worker = f.remediator.worker();
    let entry = QueueEntry::observed(role(&[]).id().clone(), role(&["get"]).into_raw());
    let err = worker.refresh(&entry).await.unwrap_err();
    assert_eq!(err, ClientError::Api("some error".into()));
    assert!(f.remediator.queue().is_empty());
}

#[tokio::test]
async fn conflicts_are_counted_by_kind() {
    let f = fixture(vec![role(&["get", "list"])]);
    f.client.seed(&role(&["get"]).owned_by(&inventory()));
    f.client.fail_verb(
        Verb::Update,
        ClientError::Conflict { id: role(&[]).id().clone(), message: "resource conflict error".into() },
    );
    let worker = f.remediator.worker();
    let entry = observed(&f.client, &role(&[]));
    worker.process(entry.clone()).await;
    assert_eq!(f.metrics.counter("resource_conflicts_total", &[("kind", "Role")]), 1);
    worker.process(entry).await;
    assert_eq!(f.metrics.counter("resource_conflicts_total", &[("kind", "Role")]), 2);
    assert_eq!(f.metrics.counter("resource_conflicts_total", &[("kind", "ClusterRole")]), 0);
    // the refreshed live body is queued for another pass
    assert!(f.remediator.queue().pending(role(&[]).id()).is_some());
}

#[tokio::test]
async fn remediator_heals_and_honours_pause() {
    let f = fixture(vec![cluster_role()]);
    let cancel = CancellationToken::new();
    let remediator = Arc::new(f.remediator);
    let running = tokio::spawn({
        let (remediator, cancel) = (remediator.clone(), cancel.clone());
        async move { remediator.run(cancel).await }
    });

    remediator.pause();
    assert!(remediator.is_paused());
    remediator.queue().add(QueueEntry::tombstone(cluster_role().id().clone(), None));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.client.object(cluster_role().id()).is_none());

    remediator.resume();
    let healed = tokio::time::timeout(Duration::from_secs(2), async {
        while f.client.object(cluster_role().id()).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(healed.is_ok(), "object was not recreated");

    // a new generation of declared objects is visible to running workers
    f.declared.update(vec![]);
    let live = f.client.object(cluster_role().id()).unwrap();
    remediator.queue().add(QueueEntry::observed(cluster_role().id().clone(), live));
    let pruned = tokio::time::timeout(Duration::from_secs(2), async {
        while f.client.object(cluster_role().id()).is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(pruned.is_ok(), "undeclared object was not deleted");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), running).await.expect("remediator did not stop").unwrap();
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{what}");
}

#[tokio::test]
async fn queue_outlives_a_cancelled_run() {
    let f = fixture(vec![cluster_role()]);
    let remediator = Arc::new(f.remediator);

    let cancel = CancellationToken::new();
    let first = tokio::spawn({
        let (remediator, cancel) = (remediator.clone(), cancel.clone());
        async move { remediator.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), first).await.expect("first run did not stop").unwrap();

    // drift observed between runs is kept for the next one
    remediator.queue().add(QueueEntry::tombstone(cluster_role().id().clone(), None));
    assert_eq!(remediator.queue().len(), 1);

    let cancel = CancellationToken::new();
    let second = tokio::spawn({
        let (remediator, cancel) = (remediator.clone(), cancel.clone());
        async move { remediator.run(cancel).await }
    });
    wait_for("second run did not recreate the object", || f.client.object(cluster_role().id()).is_some()).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), second).await.expect("second run did not stop").unwrap();
}

#[tokio::test]
async fn cancel_finishes_the_correction_in_hand_and_keeps_the_rest_queued() {
    let client = Arc::new(SlowUpdates { inner: MemoryClient::new(), delay: Duration::from_millis(100), started: Notify::new() });
    client.inner.seed(&role(&["get"]).owned_by(&inventory()));
    let declared = Arc::new(DeclaredSet::new());
    declared.update(vec![role(&["get", "list"]), cluster_role()]);
    let config = RemediatorConfig { workers: 1, api_timeout: Duration::from_secs(1), ..RemediatorConfig::default() };
    let remediator = Arc::new(Remediator::new(client.clone(), inventory(), declared, config, Arc::new(Metrics::new())));

    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let (remediator, cancel) = (remediator.clone(), cancel.clone());
        async move { remediator.run(cancel).await }
    });
    let live = client.inner.object(role(&[]).id()).unwrap();
    remediator.queue().add(QueueEntry::observed(role(&[]).id().clone(), live));
    tokio::time::timeout(Duration::from_secs(1), client.started.notified()).await.expect("update never started");

    // queued behind the in-flight update, then cancelled
    remediator.queue().add(QueueEntry::tombstone(cluster_role().id().clone(), None));
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), running).await.expect("remediator did not stop").unwrap();

    let updated = client.inner.object(role(&[]).id()).unwrap();
    assert_eq!(updated["rules"][0]["verbs"], json!(["get", "list"]));
    assert!(client.inner.object(cluster_role().id()).is_none());
    assert!(remediator.queue().pending(cluster_role().id()).is_some());
}
