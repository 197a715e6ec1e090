//! Error taxonomy.
//!
//! [`ActuationError`] is the low-level cause reported by an engine for one
//! object (or for the stream). [`SyncError`] is the classified, typed error
//! surfaced to callers; it is built once, where the failure is first observed,
//! and then passed through unchanged inside a [`MultiError`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::client::ClientError;
use crate::status::{ActuationStatus, ReconcileStatus, Strategy};
use crate::ObjectId;

/// Ownership of a live object relative to one inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipStatus {
    /// No owner annotation.
    Empty,
    Match,
    NoMatch,
}

/// Which ownership states an engine may actuate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryPolicy {
    MustMatch,
    #[default]
    AdoptIfNoInventory,
    AdoptAll,
}

impl InventoryPolicy {
    pub fn permits(self, status: OwnershipStatus) -> bool {
        match (self, status) {
            (_, OwnershipStatus::Match) => true,
            (InventoryPolicy::AdoptAll, _) => true,
            (InventoryPolicy::AdoptIfNoInventory, OwnershipStatus::Empty) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for InventoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "must-match" | "mustmatch" => Ok(InventoryPolicy::MustMatch),
            "adopt-if-no-inventory" | "adoptifnoinventory" => Ok(InventoryPolicy::AdoptIfNoInventory),
            "adopt-all" | "adoptall" => Ok(InventoryPolicy::AdoptAll),
            other => Err(format!("unknown inventory policy: {other}")),
        }
    }
}

/// Actuation refused because the live object belongs to another inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyPrevented {
    pub strategy: Strategy,
    pub policy: InventoryPolicy,
    pub status: OwnershipStatus,
}

impl fmt::Display for PolicyPrevented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inventory policy prevented actuation (strategy: {}, status: {:?}, policy: {:?})", self.strategy, self.status, self.policy)
    }
}

/// Direction of a dependency edge, seen from the skipped object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relationship {
    /// The skipped object depends on the relation.
    Dependency,
    /// The relation depends on the skipped object.
    Dependent,
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Relationship::Dependency => "dependency", Relationship::Dependent => "dependent" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationPhase {
    Actuation,
    Reconcile,
}

impl fmt::Display for RelationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { RelationPhase::Actuation => "actuation", RelationPhase::Reconcile => "reconcile" })
    }
}

/// Actuation refused because a related object never reached terminal success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPrevented {
    pub object: ObjectId,
    pub strategy: Strategy,
    pub relationship: Relationship,
    pub relation: ObjectId,
    pub relation_phase: RelationPhase,
    pub relation_actuation: ActuationStatus,
    pub relation_reconcile: ReconcileStatus,
}

impl fmt::Display for DependencyPrevented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.relation_phase {
            RelationPhase::Actuation => self.relation_actuation.to_string(),
            RelationPhase::Reconcile => self.relation_reconcile.to_string(),
        };
        write!(f, "{} {} {} {}: {}", self.relationship, self.strategy, self.relation_phase, status, self.relation)
    }
}

/// Cause reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActuationError {
    /// The server does not serve the object's kind.
    #[error("{0}")]
    UnknownType(String),
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    PolicyPrevented(PolicyPrevented),
    #[error("{0}")]
    DependencyPrevented(DependencyPrevented),
    #[error("namespace still in use: {namespace}")]
    NamespaceInUse { namespace: String },
}

impl ActuationError {
    pub fn failed(msg: impl Into<String>) -> Self { ActuationError::Failed(msg.into()) }
}

impl From<ClientError> for ActuationError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::UnknownType(msg) => ActuationError::UnknownType(msg),
            other => ActuationError::Failed(other.to_string()),
        }
    }
}

/// Classified error surfaced by a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("failed to apply {id}: {source}")]
    Resource { id: ObjectId, source: ActuationError },
    #[error("failed to prune {id}: {source}")]
    Prune { id: ObjectId, source: ActuationError },
    #[error("failed to delete {id}: {source}")]
    Delete { id: ObjectId, source: ActuationError },
    #[error("skipped {strategy} of {id}: {source}")]
    Skip { id: ObjectId, strategy: Strategy, source: ActuationError },
    #[error("management conflict for {id}: the object is owned by another inventory; remove it from one of the sources ({source})")]
    Conflict { id: ObjectId, source: ActuationError },
    #[error("inventory object {inventory} is too large; split the declared objects across several syncs: {source}")]
    LargeInventory { inventory: ObjectId, source: ActuationError },
    #[error("event stream failed: {source}")]
    Stream { source: ActuationError },
    #[error("{operation} cancelled before the event stream completed")]
    Cancelled { operation: Strategy },
}

impl SyncError {
    /// Object the error originates from, if any.
    pub fn id(&self) -> Option<&ObjectId> {
        match self {
            SyncError::Resource { id, .. }
            | SyncError::Prune { id, .. }
            | SyncError::Delete { id, .. }
            | SyncError::Skip { id, .. }
            | SyncError::Conflict { id, .. } => Some(id),
            SyncError::LargeInventory { inventory, .. } => Some(inventory),
            SyncError::Stream { .. } | SyncError::Cancelled { .. } => None,
        }
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Resource { .. } => "resource",
            SyncError::Prune { .. } => "prune",
            SyncError::Delete { .. } => "delete",
            SyncError::Skip { .. } => "skip",
            SyncError::Conflict { .. } => "conflict",
            SyncError::LargeInventory { .. } => "large_inventory",
            SyncError::Stream { .. } => "stream",
            SyncError::Cancelled { .. } => "cancelled",
        }
    }

    /// Stream-level errors end a cycle early.
    pub fn is_stream_level(&self) -> bool {
        matches!(self, SyncError::LargeInventory { .. } | SyncError::Stream { .. } | SyncError::Cancelled { .. })
    }
}

/// Aggregate of every error observed in a cycle. Never drops an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiError(Vec<SyncError>);

impl MultiError {
    pub fn new() -> Self { Self(Vec::new()) }
    pub fn push(&mut self, e: SyncError) { self.0.push(e); }
    pub fn append(&mut self, other: MultiError) { self.0.extend(other.0); }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn errors(&self) -> &[SyncError] { &self.0 }
    pub fn iter(&self) -> std::slice::Iter<'_, SyncError> { self.0.iter() }
    pub fn into_errors(self) -> Vec<SyncError> { self.0 }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => f.write_str("no errors"),
            1 => write!(f, "{}", self.0[0]),
            n => {
                write!(f, "{n} errors:")?;
                for (i, e) in self.0.iter().enumerate() {
                    write!(f, "\n[{}] {}", i + 1, e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

impl From<SyncError> for MultiError {
    fn from(e: SyncError) -> Self { Self(vec![e]) }
}

impl FromIterator<SyncError> for MultiError {
    fn from_iter<T: IntoIterator<Item = SyncError>>(iter: T) -> Self { Self(iter.into_iter().collect()) }
}

impl Extend<SyncError> for MultiError {
    fn extend<T: IntoIterator<Item = SyncError>>(&mut self, iter: T) { self.0.extend(iter); }
}

impl IntoIterator for MultiError {
    type Item = SyncError;
    type IntoIter = std::vec::IntoIter<SyncError>;
    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}
