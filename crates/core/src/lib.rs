//! converge core types: object identity, manifests, per-object status and the
//! typed error taxonomy shared by the supervisor and the remediator.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod diff;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod metrics;
pub mod status;

pub use client::{ClientError, ClusterClient};
pub use error::{
    ActuationError, DependencyPrevented, InventoryPolicy, MultiError, OwnershipStatus, PolicyPrevented, RelationPhase,
    Relationship, SyncError,
};
pub use manifest::{Manifest, ManifestError};
pub use memory::MemoryClient;
pub use metrics::Metrics;
pub use status::{ActuationStatus, ObjectStatus, ObjectStatusMap, ReconcileStatus, Strategy};

/// Dependency references of an object, comma-separated.
pub const DEPENDS_ON_ANNOTATION: &str = "config.kubernetes.io/depends-on";
/// Owning inventory, stamped on every object the engine applies.
pub const INVENTORY_ANNOTATION: &str = "converge.dev/inventory-id";
/// `disabled` opts a declared object out of management.
pub const MANAGED_ANNOTATION: &str = "converge.dev/managed";
pub const MANAGED_DISABLED: &str = "disabled";

/// Identity of a cluster object. Cluster-scoped objects carry an empty
/// namespace and core-group objects an empty group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectId {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster_scoped(group: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(group, kind, String::new(), name)
    }

    pub fn is_namespaced(&self) -> bool { !self.namespace.is_empty() }

    pub fn is_namespace(&self) -> bool { self.group.is_empty() && self.kind == "Namespace" }

    /// Parse one reference of the depends-on annotation:
    /// `group/namespaces/<ns>/kind/name` or `group/kind/name`.
    pub fn parse_dependency(reference: &str) -> Option<Self> {
        let parts: Vec<&str> = reference.trim().split('/').collect();
        let id = match parts.as_slice() {
            [group, "namespaces", ns, kind, name] if !ns.is_empty() => Self::new(*group, *kind, *ns, *name),
            [group, kind, name] => Self::cluster_scoped(*group, *kind, *name),
            _ => return None,
        };
        (!id.kind.is_empty() && !id.name.is_empty()).then_some(id)
    }

    /// Inverse of [`ObjectId::parse_dependency`].
    pub fn dependency_ref(&self) -> String {
        if self.is_namespaced() {
            format!("{}/namespaces/{}/{}/{}", self.group, self.namespace, self.kind, self.name)
        } else {
            format!("{}/{}/{}", self.group, self.kind, self.name)
        }
    }
}

/// Canonical form `namespace_name_group_kind`.
impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.namespace, self.name, self.group, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object id {0:?} (expect namespace_name_group_kind)")]
pub struct ParseIdError(pub String);

impl FromStr for ObjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        match parts.as_slice() {
            [ns, name, group, kind] if !name.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *kind, *ns, *name)),
            _ => Err(ParseIdError(s.to_string())),
        }
    }
}

/// Group/Version/Kind of a declared object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Key in the `v1/Kind` or `group/v1/Kind` form used on the command line.
    pub fn key(&self) -> String { format!("{}/{}", self.api_version(), self.kind) }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.key()) }
}

pub mod prelude {
    pub use super::{
        ActuationError, ActuationStatus, ClientError, ClusterClient, Gvk, Manifest, Metrics, MultiError, ObjectId,
        ObjectStatus, ObjectStatusMap, ReconcileStatus, Strategy, SyncError,
    };
}
