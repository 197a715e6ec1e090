//! converge kubehub: kube-rs backed [`ClusterClient`], discovery and watches.

#![forbid(unsafe_code)]

pub mod watch;

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use converge_core::{ClientError, ClusterClient, Gvk, Manifest, ObjectId};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info};

pub use watch::WatchManager;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "converge";

#[derive(Debug, Clone)]
pub struct DiscoveredResource {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Served resources keyed by (group, kind); the preferred version wins.
#[derive(Debug, Default)]
struct Catalog {
    by_kind: FxHashMap<(String, String), DiscoveredResource>,
    all: Vec<DiscoveredResource>,
}

async fn discover(client: Client) -> Result<Catalog, kube::Error> {
    let discovery = Discovery::new(client).run().await?;
    let mut catalog = Catalog::default();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let found = DiscoveredResource { namespaced: matches!(caps.scope, Scope::Namespaced), resource: ar };
            catalog.by_kind.entry((found.resource.group.clone(), found.resource.kind.clone())).or_insert_with(|| found.clone());
            catalog.all.push(found);
        }
    }
    Ok(catalog)
}

/// Map an API failure for `id` onto the client error taxonomy.
pub fn client_error(e: kube::Error, id: &ObjectId) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => ClientError::AlreadyExists(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict { id: id.clone(), message: ae.message },
        kube::Error::Api(ae) => ClientError::Api(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        other => ClientError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

pub(crate) fn to_json(obj: &DynamicObject) -> Result<Json, ClientError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClientError::Api(format!("serializing object: {e}")))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

pub struct KubeClient {
    client: Client,
    catalog: RwLock<Catalog>,
}

impl KubeClient {
    /// Connect with the ambient kubeconfig and run discovery.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Self::new(client).await
    }

    pub async fn new(client: Client) -> Result<Self> {
        let catalog = discover(client.clone()).await?;
        info!(resources = catalog.all.len(), "discovery complete");
        Ok(Self { client, catalog: RwLock::new(catalog) })
    }

    pub fn raw(&self) -> &Client { &self.client }

    /// Re-run discovery, e.g. after CRDs were installed.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let catalog = discover(self.client.clone()).await.map_err(|e| ClientError::Transport(e.to_string()))?;
        debug!(resources = catalog.all.len(), "discovery refreshed");
        if let Ok(mut slot) = self.catalog.write() {
            *slot = catalog;
        }
        Ok(())
    }

    fn cached(&self, group: &str, kind: &str) -> Option<DiscoveredResource> {
        let catalog = self.catalog.read().ok()?;
        catalog.by_kind.get(&(group.to_string(), kind.to_string())).cloned()
    }

    /// Served resource for a group/kind, refreshing discovery once on a miss.
    pub async fn find_api_resource(&self, group: &str, kind: &str) -> Result<DiscoveredResource, ClientError> {
        if let Some(found) = self.cached(group, kind) {
            return Ok(found);
        }
        self.refresh().await?;
        self.cached(group, kind)
            .ok_or_else(|| ClientError::UnknownType(format!("no matches for kind {kind:?} in group {group:?}")))
    }

    /// Like [`KubeClient::find_api_resource`] but honours the requested version when served.
    pub async fn find_gvk(&self, gvk: &Gvk) -> Result<DiscoveredResource, ClientError> {
        let exact = self.catalog.read().ok().and_then(|c| {
            c.all
                .iter()
                .find(|d| d.resource.group == gvk.group && d.resource.version == gvk.version && d.resource.kind == gvk.kind)
                .cloned()
        });
        match exact {
            Some(found) => Ok(found),
            None => self.find_api_resource(&gvk.group, &gvk.kind).await,
        }
    }

    async fn api(&self, id: &ObjectId) -> Result<Api<DynamicObject>, ClientError> {
        let found = self.find_api_resource(&id.group, &id.kind).await?;
        Ok(if found.namespaced {
            if id.namespace.is_empty() {
                return Err(ClientError::Api(format!("{id}: namespace required for namespaced kind")));
            }
            Api::namespaced_with(self.client.clone(), &id.namespace, &found.resource)
        } else {
            Api::all_with(self.client.clone(), &found.resource)
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, id: &ObjectId) -> Result<Option<Json>, ClientError> {
        let api = self.api(id).await?;
        match api.get_opt(&id.name).await.map_err(|e| client_error(e, id))? {
            Some(obj) => to_json(&obj).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &Manifest) -> Result<Json, ClientError> {
        let api = self.api(obj.id()).await?;
        let body: DynamicObject =
            serde_json::from_value(obj.raw().clone()).map_err(|e| ClientError::Api(format!("decoding {}: {e}", obj.id())))?;
        let created = api.create(&PostParams::default(), &body).await.map_err(|e| client_error(e, obj.id()))?;
        to_json(&created)
    }

    async fn update(&self, obj: &Manifest) -> Result<Json, ClientError> {
        let api = self.api(obj.id()).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&obj.id().name, &pp, &Patch::Apply(obj.raw())).await.map_err(|e| client_error(e, obj.id()))?;
        to_json(&applied)
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), ClientError> {
        let api = self.api(id).await?;
        api.delete(&id.name, &DeleteParams::background()).await.map_err(|e| client_error(e, id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: reason.into(), code })
    }

    #[test]
    fn api_errors_map_onto_client_errors() {
        let id = ObjectId::new("apps", "Deployment", "ns", "web");
        assert_eq!(client_error(api_error(404, "NotFound"), &id), ClientError::NotFound(id.clone()));
        assert_eq!(client_error(api_error(409, "AlreadyExists"), &id), ClientError::AlreadyExists(id.clone()));
        assert!(matches!(client_error(api_error(409, "Conflict"), &id), ClientError::Conflict { .. }));
        assert!(client_error(api_error(409, "Conflict"), &id).is_conflict());
        assert!(matches!(client_error(api_error(500, "InternalError"), &id), ClientError::Api(_)));
    }
}
