//! The apply/destroy engine seam.

use std::collections::BTreeSet;
use std::time::Duration;

use converge_core::{InventoryPolicy, Manifest, ObjectId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Apply the given objects, then prune.
    Apply,
    /// Delete every object in the prune set.
    Destroy,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Current inventory membership.
    pub members: BTreeSet<ObjectId>,
    /// Objects to delete: inventory minus declared for [`RunMode::Apply`],
    /// the whole inventory for [`RunMode::Destroy`].
    pub prune: BTreeSet<ObjectId>,
    pub policy: InventoryPolicy,
    /// How long to wait for applied objects to reconcile. Zero disables waiting.
    pub reconcile_timeout: Duration,
}

impl RunOptions {
    pub fn apply(members: BTreeSet<ObjectId>, prune: BTreeSet<ObjectId>) -> Self {
        Self {
            mode: RunMode::Apply,
            members,
            prune,
            policy: InventoryPolicy::default(),
            reconcile_timeout: Duration::from_secs(300),
        }
    }

    pub fn destroy(members: BTreeSet<ObjectId>) -> Self {
        Self { mode: RunMode::Destroy, ..Self::apply(members.clone(), members) }
    }

    pub fn with_policy(mut self, policy: InventoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }
}

/// Runs one apply or destroy and reports progress as an ordered event stream.
/// The channel closes when the run is over.
pub trait ApplyEngine: Send + Sync {
    fn run(&self, cancel: CancellationToken, inventory: &ObjectId, objects: Vec<Manifest>, options: RunOptions) -> mpsc::Receiver<Event>;
}
