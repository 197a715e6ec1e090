//! Declared objects of the current generation, swapped atomically per sync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use converge_core::{Manifest, ObjectId};
use rustc_hash::FxHashMap;

/// Read access to declared state.
pub trait DeclaredLookup: Send + Sync {
    fn get(&self, id: &ObjectId) -> Option<Manifest>;
}

#[derive(Default)]
pub struct DeclaredSet {
    objects: ArcSwap<FxHashMap<ObjectId, Manifest>>,
    generation: AtomicU64,
}

impl DeclaredSet {
    pub fn new() -> Self { Self::default() }

    /// Replace the whole set. Readers see either the old or the new set.
    pub fn update(&self, objects: impl IntoIterator<Item = Manifest>) -> u64 {
        let next: FxHashMap<ObjectId, Manifest> = objects.into_iter().map(|m| (m.id().clone(), m)).collect();
        self.objects.store(Arc::new(next));
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn snapshot(&self) -> Arc<FxHashMap<ObjectId, Manifest>> { self.objects.load_full() }
    pub fn generation(&self) -> u64 { self.generation.load(Ordering::Acquire) }
    pub fn contains(&self, id: &ObjectId) -> bool { self.objects.load().contains_key(id) }
    pub fn len(&self) -> usize { self.objects.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl DeclaredLookup for DeclaredSet {
    fn get(&self, id: &ObjectId) -> Option<Manifest> { self.objects.load().get(id).cloned() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> Manifest {
        Manifest::from_json(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": "ns" }
        }))
        .unwrap()
    }

    #[test]
    fn update_replaces_the_whole_set() {
        let set = DeclaredSet::new();
        assert_eq!(set.update([cm("a"), cm("b")]), 1);
        let before = set.snapshot();
        assert_eq!(set.update([cm("c")]), 2);
        assert_eq!(before.len(), 2);
        assert_eq!(set.len(), 1);
        assert!(set.get(&ObjectId::new("", "ConfigMap", "ns", "a")).is_none());
        assert!(set.contains(&ObjectId::new("", "ConfigMap", "ns", "c")));
    }
}
