//! One list+watch per applied kind, feeding the remediator queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use converge_core::manifest::{id_of, ownership};
use converge_core::{ClientError, Gvk, ObjectId, OwnershipStatus};
use converge_remediator::{DeclaredSet, ObjectQueue, QueueEntry};
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{to_json, KubeClient};

/// Decides which watched objects are worth remediating and queues them.
#[derive(Clone)]
pub struct Feed {
    queue: Arc<ObjectQueue>,
    declared: Arc<DeclaredSet>,
    inventory: ObjectId,
}

impl Feed {
    pub fn new(queue: Arc<ObjectQueue>, declared: Arc<DeclaredSet>, inventory: ObjectId) -> Self {
        Self { queue, declared, inventory }
    }

    /// Queue `obj`, watched as `gvk`, when it is declared or owned by this
    /// inventory. List items carry no type fields; they are filled in from `gvk`.
    pub fn observe(&self, gvk: &Gvk, mut obj: serde_json::Value, deleted: bool) -> bool {
        if let Some(fields) = obj.as_object_mut() {
            fields.entry("apiVersion").or_insert_with(|| gvk.api_version().into());
            fields.entry("kind").or_insert_with(|| gvk.kind.clone().into());
        }
        let Some(id) = id_of(&obj) else { return false };
        if !self.declared.contains(&id) && ownership(&obj, &self.inventory) != OwnershipStatus::Match {
            return false;
        }
        let entry = if deleted { QueueEntry::tombstone(id, Some(obj)) } else { QueueEntry::observed(id, obj) };
        self.queue.add(entry);
        true
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WatchManager {
    client: Arc<KubeClient>,
    feed: Feed,
    watches: Mutex<BTreeMap<Gvk, Running>>,
}

impl WatchManager {
    pub fn new(client: Arc<KubeClient>, feed: Feed) -> Self { Self { client, feed, watches: Mutex::new(BTreeMap::new()) } }

    pub fn watched(&self) -> BTreeSet<Gvk> {
        self.watches.lock().map(|w| w.keys().cloned().collect()).unwrap_or_default()
    }

    /// Start watches for new kinds and stop the ones no longer applied.
    /// Kinds the server does not serve are skipped and reported.
    pub async fn update_watches(&self, kinds: &BTreeSet<Gvk>) -> Vec<(Gvk, ClientError)> {
        let current = self.watched();
        for gvk in current.difference(kinds) {
            if let Some(running) = self.watches.lock().ok().and_then(|mut w| w.remove(gvk)) {
                running.cancel.cancel();
                info!(gvk = %gvk, "watch stopped");
            }
        }
        let mut failed = Vec::new();
        for gvk in kinds.difference(&current) {
            let found = match self.client.find_gvk(gvk).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(gvk = %gvk, error = %e, "cannot watch kind");
                    failed.push((gvk.clone(), e));
                    continue;
                }
            };
            let api: Api<DynamicObject> = Api::all_with(self.client.raw().clone(), &found.resource);
            let cancel = CancellationToken::new();
            let task = tokio::spawn(watch_kind(gvk.clone(), api, self.feed.clone(), cancel.clone()));
            if let Ok(mut watches) = self.watches.lock() {
                watches.insert(gvk.clone(), Running { cancel, task });
            }
        }
        failed
    }

    /// Stop every watch and wait for them to end.
    pub async fn stop(&self) {
        let running: Vec<Running> = self.watches.lock().map(|mut w| std::mem::take(&mut *w).into_values().collect()).unwrap_or_default();
        for r in &running {
            r.cancel.cancel();
        }
        for r in running {
            let _ = r.task.await;
        }
    }
}

async fn watch_kind(gvk: Gvk, api: Api<DynamicObject>, feed: Feed, cancel: CancellationToken) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(gvk = %gvk, "watcher started");
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        match ev {
            Some(Ok(Event::Applied(o))) => observe(&feed, &gvk, &o, false),
            Some(Ok(Event::Deleted(o))) => observe(&feed, &gvk, &o, true),
            Some(Ok(Event::Restarted(list))) => {
                debug!(gvk = %gvk, count = list.len(), "watch restart");
                for o in list.iter() {
                    observe(&feed, &gvk, o, false);
                }
            }
            Some(Err(e)) => warn!(gvk = %gvk, error = %e, "watch error; backing off"),
            None => {
                warn!(gvk = %gvk, "watcher stream ended");
                break;
            }
        }
    }
    debug!(gvk = %gvk, "watcher stopped");
}

fn observe(feed: &Feed, gvk: &Gvk, obj: &DynamicObject, deleted: bool) {
    match to_json(obj) {
        Ok(raw) => {
            feed.observe(gvk, raw, deleted);
        }
        Err(e) => debug!(error = %e, "skipping undecodable object"),
    }
}
