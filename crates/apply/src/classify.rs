//! Maps engine failures into the typed [`SyncError`] taxonomy.

use converge_core::{ActuationError, ObjectId, Strategy, SyncError};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::Operation;

/// Where a cause was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Actuation of one object failed.
    Failed(Operation),
    /// Actuation of one object was skipped.
    Skipped(Operation),
    /// The stream itself failed (e.g. writing the inventory object).
    Stream,
}

impl Operation {
    pub fn strategy(self) -> Strategy {
        match self {
            Operation::Apply => Strategy::Apply,
            Operation::Prune | Operation::Delete => Strategy::Delete,
        }
    }
}

static TOO_LARGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(request is too large|trying to send message larger than max|exceeding the max size|request entity too large)")
        .unwrap()
});

/// True for backend failures caused by an oversized request payload.
pub fn is_request_too_large(cause: &ActuationError) -> bool {
    match cause {
        ActuationError::Failed(msg) | ActuationError::UnknownType(msg) => TOO_LARGE_RE.is_match(msg),
        _ => false,
    }
}

/// Classify `cause`, observed for `id` in `phase`. For [`Phase::Stream`] `id`
/// is the inventory object.
///
/// Returns `None` when the observation is not an error: policy skips on
/// prune/delete (abandonment) and skips without a cause.
pub fn classify(cause: Option<ActuationError>, id: &ObjectId, phase: Phase) -> Option<SyncError> {
    let id = id.clone();
    match phase {
        Phase::Stream => {
            let source = cause?;
            if is_request_too_large(&source) {
                Some(SyncError::LargeInventory { inventory: id, source })
            } else {
                Some(SyncError::Stream { source })
            }
        }
        Phase::Failed(op) => {
            let source = cause.unwrap_or_else(|| ActuationError::failed("unknown failure"));
            Some(match op {
                Operation::Apply => SyncError::Resource { id, source },
                Operation::Prune => SyncError::Prune { id, source },
                Operation::Delete => SyncError::Delete { id, source },
            })
        }
        Phase::Skipped(op) => match cause? {
            source @ ActuationError::PolicyPrevented(_) => match op {
                Operation::Apply => Some(SyncError::Conflict { id, source }),
                // Prunes and deletes ignore ownership mismatches so that
                // managed objects can be abandoned.
                Operation::Prune | Operation::Delete => None,
            },
            source @ ActuationError::NamespaceInUse { .. } => Some(SyncError::Skip { id, strategy: Strategy::Delete, source }),
            source => Some(SyncError::Skip { id, strategy: op.strategy(), source }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::{
        ActuationStatus, DependencyPrevented, InventoryPolicy, OwnershipStatus, PolicyPrevented, ReconcileStatus,
        RelationPhase, Relationship,
    };

    fn id() -> ObjectId { ObjectId::new("configsync.test", "Test", "test-namespace", "random-name") }

    fn policy(strategy: Strategy) -> ActuationError {
        ActuationError::PolicyPrevented(PolicyPrevented { strategy, policy: InventoryPolicy::MustMatch, status: OwnershipStatus::NoMatch })
    }

    #[test]
    fn failures_follow_operation_direction() {
        let cause = ActuationError::failed("failed apply");
        assert!(matches!(classify(Some(cause.clone()), &id(), Phase::Failed(Operation::Apply)), Some(SyncError::Resource { .. })));
        assert!(matches!(classify(Some(cause.clone()), &id(), Phase::Failed(Operation::Prune)), Some(SyncError::Prune { .. })));
        let e = classify(Some(cause), &id(), Phase::Failed(Operation::Delete)).unwrap();
        assert_eq!(e.to_string(), "failed to delete test-namespace_random-name_configsync.test_Test: failed apply");
    }

    // Ownership mismatches are a conflict on apply but silently permit
    // abandonment on prune and delete.
    #[test]
    fn policy_skip_is_asymmetric() {
        assert!(matches!(
            classify(Some(policy(Strategy::Apply)), &id(), Phase::Skipped(Operation::Apply)),
            Some(SyncError::Conflict { .. })
        ));
        assert_eq!(classify(Some(policy(Strategy::Delete)), &id(), Phase::Skipped(Operation::Prune)), None);
        assert_eq!(classify(Some(policy(Strategy::Delete)), &id(), Phase::Skipped(Operation::Delete)), None);
    }

    #[test]
    fn dependency_skip_keeps_relation_context() {
        let relation = ObjectId::new("apps", "Deployment", "test-namespace", "dep");
        let dep = DependencyPrevented {
            object: id(),
            strategy: Strategy::Apply,
            relationship: Relationship::Dependency,
            relation: relation.clone(),
            relation_phase: RelationPhase::Actuation,
            relation_actuation: ActuationStatus::Failed,
            relation_reconcile: ReconcileStatus::Pending,
        };
        let e = classify(Some(ActuationError::DependencyPrevented(dep)), &id(), Phase::Skipped(Operation::Apply)).unwrap();
        match e {
            SyncError::Skip { strategy, source: ActuationError::DependencyPrevented(d), .. } => {
                assert_eq!(strategy, Strategy::Apply);
                assert_eq!(d.relation, relation);
                assert_eq!(d.relation_phase, RelationPhase::Actuation);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn namespace_in_use_is_a_delete_skip() {
        let ns = ObjectId::cluster_scoped("", "Namespace", "test-namespace");
        let e = classify(Some(ActuationError::NamespaceInUse { namespace: "test-namespace".into() }), &ns, Phase::Skipped(Operation::Prune));
        assert!(matches!(e, Some(SyncError::Skip { strategy: Strategy::Delete, .. })));
        assert_eq!(classify(None, &ns, Phase::Skipped(Operation::Prune)), None);
    }

    #[test]
    fn oversized_inventory_is_recognised() {
        let inv = ObjectId::new("", "ConfigMap", "test-namespace", "rs");
        let e = classify(Some(ActuationError::failed("etcdserver: request is too large")), &inv, Phase::Stream).unwrap();
        assert_eq!(e.id(), Some(&inv));
        assert!(matches!(e, SyncError::LargeInventory { .. }));
        assert!(is_request_too_large(&ActuationError::failed("413 Request Entity Too Large")));

        let other = classify(Some(ActuationError::failed("connection refused")), &inv, Phase::Stream).unwrap();
        assert!(matches!(other, SyncError::Stream { .. }));
    }
}
