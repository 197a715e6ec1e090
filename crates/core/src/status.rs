//! Per-object actuation and reconcile status.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ObjectId;

/// Direction of an actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Strategy {
    Apply,
    Delete,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Strategy::Apply => "apply", Strategy::Delete => "delete" })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActuationStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Skipped,
}

impl ActuationStatus {
    pub fn is_terminal(self) -> bool { !matches!(self, ActuationStatus::Pending) }
}

impl fmt::Display for ActuationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActuationStatus::Pending => "pending",
            ActuationStatus::Succeeded => "succeeded",
            ActuationStatus::Failed => "failed",
            ActuationStatus::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReconcileStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Timeout,
    Skipped,
}

impl ReconcileStatus {
    pub fn is_terminal(self) -> bool { !matches!(self, ReconcileStatus::Pending) }
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileStatus::Pending => "pending",
            ReconcileStatus::Succeeded => "succeeded",
            ReconcileStatus::Failed => "failed",
            ReconcileStatus::Timeout => "timeout",
            ReconcileStatus::Skipped => "skipped",
        })
    }
}

/// Status record of one object touched during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStatus {
    pub strategy: Strategy,
    pub actuation: ActuationStatus,
    pub reconcile: ReconcileStatus,
}

impl ObjectStatus {
    pub fn new(strategy: Strategy, actuation: ActuationStatus) -> Self {
        Self { strategy, actuation, reconcile: ReconcileStatus::Pending }
    }
}

/// Exactly one record per object touched in a cycle; absent means not yet processed.
pub type ObjectStatusMap = BTreeMap<ObjectId, ObjectStatus>;
