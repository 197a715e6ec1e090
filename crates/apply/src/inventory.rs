//! Set of objects owned by one sync.
//!
//! Persisted as a ConfigMap living at the inventory's own identity, one member
//! id per line under `data.objects`.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use converge_core::{ActuationStatus, ClusterClient, Manifest, ObjectId, ObjectStatus, Strategy};
use serde_json::Value as Json;
use tracing::debug;

const OBJECTS_KEY: &str = "objects";
pub const INVENTORY_LABEL: &str = "converge.dev/inventory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    id: ObjectId,
    members: BTreeSet<ObjectId>,
}

impl Inventory {
    pub fn new(id: ObjectId) -> Self { Self { id, members: BTreeSet::new() } }

    pub fn with_members(id: ObjectId, members: impl IntoIterator<Item = ObjectId>) -> Self {
        Self { id, members: members.into_iter().collect() }
    }

    /// Identity of the inventory object itself.
    pub fn id(&self) -> &ObjectId { &self.id }
    pub fn members(&self) -> &BTreeSet<ObjectId> { &self.members }
    pub fn contains(&self, id: &ObjectId) -> bool { self.members.contains(id) }
    pub fn len(&self) -> usize { self.members.len() }
    pub fn is_empty(&self) -> bool { self.members.is_empty() }

    /// Prune candidates: members that are no longer declared.
    pub fn diff(&self, declared: &BTreeSet<ObjectId>) -> BTreeSet<ObjectId> {
        self.members.difference(declared).cloned().collect()
    }

    /// Fold one terminal outcome into membership. Failed and skipped
    /// actuations leave membership untouched so nothing is lost from tracking.
    pub fn record(&mut self, id: &ObjectId, status: &ObjectStatus) {
        match (status.strategy, status.actuation) {
            (Strategy::Apply, ActuationStatus::Succeeded) => { self.members.insert(id.clone()); }
            (Strategy::Delete, ActuationStatus::Succeeded) => { self.members.remove(id); }
            _ => {}
        }
    }

    /// Stop tracking `id` without touching the live object.
    pub fn abandon(&mut self, id: &ObjectId) -> bool { self.members.remove(id) }

    pub fn to_manifest(&self) -> Result<Manifest> {
        let objects = self.members.iter().map(|m| m.to_string()).collect::<Vec<_>>().join("\n");
        let mut metadata = serde_json::json!({
            "name": self.id.name,
            "labels": { INVENTORY_LABEL: "true" },
        });
        if self.id.is_namespaced() {
            metadata["namespace"] = Json::String(self.id.namespace.clone());
        }
        let raw = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": metadata,
            "data": { OBJECTS_KEY: objects },
        });
        Manifest::from_json(raw).context("building inventory object")
    }

    pub fn from_object(id: ObjectId, obj: &Json) -> Result<Self> {
        let mut inv = Self::new(id);
        let Some(objects) = obj.get("data").and_then(|d| d.get(OBJECTS_KEY)) else { return Ok(inv) };
        let objects = objects.as_str().ok_or_else(|| anyhow!("inventory {} data.{} is not a string", inv.id, OBJECTS_KEY))?;
        for line in objects.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let member: ObjectId = line.parse().with_context(|| format!("inventory {} has a bad member", inv.id))?;
            inv.members.insert(member);
        }
        Ok(inv)
    }

    /// Read the persisted inventory; an absent object is an empty inventory.
    pub async fn load(client: &dyn ClusterClient, id: ObjectId) -> Result<Self> {
        match client.get(&id).await.with_context(|| format!("reading inventory {id}"))? {
            Some(obj) => {
                let inv = Self::from_object(id, &obj)?;
                debug!(inventory = %inv.id, members = inv.len(), "inventory loaded");
                Ok(inv)
            }
            None => Ok(Self::new(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::MemoryClient;

    fn id(name: &str) -> ObjectId { ObjectId::new("", "ConfigMap", "ns", name) }

    #[test]
    fn diff_is_members_minus_declared() {
        let inv = Inventory::with_members(id("inv"), [id("a"), id("b"), id("c")]);
        let declared: BTreeSet<_> = [id("b"), id("d")].into_iter().collect();
        let prune = inv.diff(&declared);
        assert_eq!(prune, [id("a"), id("c")].into_iter().collect());

        // an object declared again is never a prune candidate
        let declared: BTreeSet<_> = [id("a"), id("b"), id("c")].into_iter().collect();
        assert!(inv.diff(&declared).is_empty());
    }

    #[test]
    fn record_only_moves_on_success() {
        let mut inv = Inventory::with_members(id("inv"), [id("a")]);
        inv.record(&id("b"), &ObjectStatus::new(Strategy::Apply, ActuationStatus::Failed));
        inv.record(&id("a"), &ObjectStatus::new(Strategy::Delete, ActuationStatus::Failed));
        inv.record(&id("a"), &ObjectStatus::new(Strategy::Delete, ActuationStatus::Skipped));
        assert_eq!(inv.members().len(), 1);
        inv.record(&id("b"), &ObjectStatus::new(Strategy::Apply, ActuationStatus::Succeeded));
        inv.record(&id("a"), &ObjectStatus::new(Strategy::Delete, ActuationStatus::Succeeded));
        assert_eq!(inv.members(), &[id("b")].into_iter().collect());
    }

    #[tokio::test]
    async fn persisted_form_loads_back() {
        let inv = Inventory::with_members(id("inv"), [id("a"), ObjectId::cluster_scoped("", "Namespace", "ns")]);
        let client = MemoryClient::new();
        assert!(Inventory::load(&client, id("inv")).await.unwrap().is_empty());
        client.seed(&inv.to_manifest().unwrap());
        let loaded = Inventory::load(&client, id("inv")).await.unwrap();
        assert_eq!(loaded, inv);
    }
}
