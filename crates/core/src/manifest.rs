//! Validated object manifests.

use serde::Deserialize;
use serde_json::Value as Json;
use smallvec::SmallVec;

use crate::error::OwnershipStatus;
use crate::{Gvk, ObjectId, DEPENDS_ON_ANNOTATION, INVENTORY_ANNOTATION, MANAGED_ANNOTATION, MANAGED_DISABLED};

fn max_manifest_bytes() -> usize {
    std::env::var("CONVERGE_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_manifest_nodes() -> usize {
    std::env::var("CONVERGE_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest payload too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("manifest too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("manifest is not an object")]
    NotAnObject,
    #[error("manifest missing {0}")]
    Missing(&'static str),
    #[error("invalid depends-on reference {0:?}")]
    BadDependency(String),
    #[error("parsing YAML: {0}")]
    Yaml(String),
}

/// An object body with its identity resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    id: ObjectId,
    gvk: Gvk,
    raw: Json,
}

impl Manifest {
    pub fn from_json(raw: Json) -> Result<Self, ManifestError> {
        if !raw.is_object() { return Err(ManifestError::NotAnObject); }
        let max_nodes = max_manifest_nodes();
        if json_node_budget_exceeded(&raw, max_nodes) {
            return Err(ManifestError::TooComplex(max_nodes));
        }
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str()).ok_or(ManifestError::Missing("apiVersion"))?;
        let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or(ManifestError::Missing("kind"))?;
        let meta = raw.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or(ManifestError::Missing("metadata.name"))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("");
        let gvk = Gvk::from_api_version(api_version, kind);
        let id = ObjectId::new(gvk.group.clone(), kind, namespace, name);
        Ok(Self { id, gvk, raw })
    }

    /// Parse every non-empty document of a (multi-document) YAML stream.
    pub fn from_yaml(yaml: &str) -> Result<Vec<Self>, ManifestError> {
        let max_bytes = max_manifest_bytes();
        if yaml.len() > max_bytes {
            return Err(ManifestError::TooLarge(max_bytes));
        }
        let mut out = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let val = serde_yaml::Value::deserialize(doc).map_err(|e| ManifestError::Yaml(e.to_string()))?;
            if val.is_null() { continue; }
            let json = serde_json::to_value(val).map_err(|e| ManifestError::Yaml(e.to_string()))?;
            out.push(Self::from_json(json)?);
        }
        Ok(out)
    }

    pub fn id(&self) -> &ObjectId { &self.id }
    pub fn gvk(&self) -> &Gvk { &self.gvk }
    pub fn raw(&self) -> &Json { &self.raw }
    pub fn into_raw(self) -> Json { self.raw }

    pub fn annotation(&self, key: &str) -> Option<&str> { annotation(&self.raw, key) }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let Some(obj) = self.raw.as_object_mut() else { return };
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        let Some(meta) = meta.as_object_mut() else { return };
        let annos = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
        if let Some(annos) = annos.as_object_mut() {
            annos.insert(key.to_string(), Json::String(value.to_string()));
        }
    }

    /// Copy of this manifest stamped as owned by `inventory`.
    pub fn owned_by(&self, inventory: &ObjectId) -> Self {
        let mut m = self.clone();
        m.set_annotation(INVENTORY_ANNOTATION, &inventory.to_string());
        m
    }

    pub fn management_disabled(&self) -> bool { self.annotation(MANAGED_ANNOTATION) == Some(MANAGED_DISABLED) }

    /// Parsed depends-on annotation.
    pub fn depends_on(&self) -> Result<SmallVec<[ObjectId; 4]>, ManifestError> {
        let mut out = SmallVec::new();
        let Some(raw) = self.annotation(DEPENDS_ON_ANNOTATION) else { return Ok(out) };
        for reference in raw.split(',').filter(|s| !s.trim().is_empty()) {
            let id = ObjectId::parse_dependency(reference).ok_or_else(|| ManifestError::BadDependency(reference.to_string()))?;
            out.push(id);
        }
        Ok(out)
    }
}

pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get("annotations")?.get(key)?.as_str()
}

/// Ownership of a live object relative to `inventory`.
pub fn ownership(live: &Json, inventory: &ObjectId) -> OwnershipStatus {
    match annotation(live, INVENTORY_ANNOTATION) {
        None | Some("") => OwnershipStatus::Empty,
        Some(owner) if owner == inventory.to_string() => OwnershipStatus::Match,
        Some(_) => OwnershipStatus::NoMatch,
    }
}

/// Identity of an arbitrary object body (e.g. a watched or fetched object).
pub fn id_of(obj: &Json) -> Option<ObjectId> {
    let api_version = obj.get("apiVersion")?.as_str()?;
    let kind = obj.get("kind")?.as_str()?;
    let meta = obj.get("metadata")?;
    let name = meta.get("name")?.as_str()?;
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
    let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    Some(ObjectId::new(group, kind, namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = Manifest::from_yaml("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = Manifest::from_yaml("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = Manifest::from_yaml("apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn multi_document_yaml_skips_empty_docs() {
        let yaml = "---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: shipping\n---\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: shipping\n  annotations:\n    config.kubernetes.io/depends-on: /Namespace/shipping\n";
        let objs = Manifest::from_yaml(yaml).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[1].id(), &ObjectId::new("apps", "Deployment", "shipping", "web"));
        assert_eq!(objs[1].gvk().api_version(), "apps/v1");
        assert_eq!(objs[1].depends_on().unwrap().as_slice(), &[ObjectId::cluster_scoped("", "Namespace", "shipping")]);
        assert!(objs[0].depends_on().unwrap().is_empty());
    }

    #[test]
    fn ownership_follows_inventory_annotation() {
        let inv = ObjectId::new("", "ConfigMap", "config", "root-sync");
        let m = Manifest::from_json(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a", "namespace": "ns"}
        }))
        .unwrap();
        assert_eq!(ownership(m.raw(), &inv), OwnershipStatus::Empty);
        let owned = m.owned_by(&inv);
        assert_eq!(ownership(owned.raw(), &inv), OwnershipStatus::Match);
        let other = ObjectId::new("", "ConfigMap", "config", "other");
        assert_eq!(ownership(owned.raw(), &other), OwnershipStatus::NoMatch);
        assert_eq!(id_of(owned.raw()).as_ref(), Some(m.id()));
    }

    #[test]
    fn management_disabled_annotation() {
        let m = Manifest::from_json(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "a", "annotations": {"converge.dev/managed": "disabled"}}
        }))
        .unwrap();
        assert!(m.management_disabled());
        assert!(!m.id().is_namespaced());
    }
}
