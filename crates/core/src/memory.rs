//! In-memory [`ClusterClient`] with mutation counters and error injection.
//! Used for dry runs and as the fake cluster in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value as Json;

use crate::client::{ClientError, ClusterClient};
use crate::diff::strip_noisy;
use crate::{Manifest, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

/// Mutating calls that reached the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mutations {
    pub creates: usize,
    pub updates: usize,
    /// Updates whose body did not change anything.
    pub noop_updates: usize,
    pub deletes: usize,
}

impl Mutations {
    pub fn effective(&self) -> usize { self.creates + self.updates + self.deletes }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectId, Json>,
    next_uid: u64,
    mutations: Mutations,
    verb_errors: BTreeMap<Verb, ClientError>,
    id_errors: BTreeMap<(Verb, ObjectId), ClientError>,
    unknown_kinds: BTreeSet<(String, String)>,
}

#[derive(Default)]
pub struct MemoryClient {
    state: Mutex<State>,
}

fn bump(v: &Json) -> String {
    let cur = v.as_str().and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
    (cur + 1).to_string()
}

fn spec_of(v: &Json) -> Json {
    let mut v = strip_noisy(v.clone());
    if let Some(obj) = v.as_object_mut() { obj.remove("metadata"); }
    v
}

impl MemoryClient {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not poison every later call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object as if it already existed; not counted as a mutation.
    pub fn seed(&self, obj: &Manifest) {
        let mut st = self.lock();
        st.next_uid += 1;
        let mut body = obj.raw().clone();
        let uid = st.next_uid.to_string();
        stamp_created(&mut body, &uid);
        st.objects.insert(obj.id().clone(), body);
    }

    pub fn object(&self, id: &ObjectId) -> Option<Json> { self.lock().objects.get(id).cloned() }

    pub fn ids(&self) -> Vec<ObjectId> { self.lock().objects.keys().cloned().collect() }

    pub fn mutations(&self) -> Mutations { self.lock().mutations }

    pub fn reset_mutations(&self) { self.lock().mutations = Mutations::default(); }

    /// Fail every call of `verb` until cleared.
    pub fn fail_verb(&self, verb: Verb, err: ClientError) { self.lock().verb_errors.insert(verb, err); }

    /// Fail `verb` calls for one object until cleared.
    pub fn fail_object(&self, verb: Verb, id: ObjectId, err: ClientError) { self.lock().id_errors.insert((verb, id), err); }

    pub fn clear_failures(&self) {
        let mut st = self.lock();
        st.verb_errors.clear();
        st.id_errors.clear();
    }

    /// Behave as if the server did not serve this kind.
    pub fn mark_unknown_kind(&self, group: &str, kind: &str) {
        self.lock().unknown_kinds.insert((group.to_string(), kind.to_string()));
    }

    /// Out-of-band deletion (someone else deleted the object).
    pub fn remove(&self, id: &ObjectId) -> Option<Json> { self.lock().objects.remove(id) }

    /// Out-of-band modification (someone else edited the object).
    pub fn modify(&self, id: &ObjectId, f: impl FnOnce(&mut Json)) -> bool {
        let mut st = self.lock();
        match st.objects.get_mut(id) {
            Some(obj) => {
                f(obj);
                if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                    let rv = bump(meta.get("resourceVersion").unwrap_or(&Json::Null));
                    meta.insert("resourceVersion".into(), Json::String(rv));
                }
                true
            }
            None => false,
        }
    }

    fn check(st: &State, verb: Verb, id: &ObjectId) -> Result<(), ClientError> {
        if st.unknown_kinds.contains(&(id.group.clone(), id.kind.clone())) {
            return Err(ClientError::UnknownType(format!("no matches for kind {:?} in group {:?}", id.kind, id.group)));
        }
        if let Some(e) = st.id_errors.get(&(verb, id.clone())) { return Err(e.clone()); }
        if let Some(e) = st.verb_errors.get(&verb) { return Err(e.clone()); }
        Ok(())
    }
}

fn stamp_created(body: &mut Json, uid: &str) {
    if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert("uid".into(), Json::String(uid.to_string()));
        meta.insert("resourceVersion".into(), Json::String("1".into()));
        meta.insert("generation".into(), Json::from(1));
    }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryClient {
    async fn get(&self, id: &ObjectId) -> Result<Option<Json>, ClientError> {
        let st = self.lock();
        Self::check(&st, Verb::Get, id)?;
        Ok(st.objects.get(id).cloned())
    }

    async fn create(&self, obj: &Manifest) -> Result<Json, ClientError> {
        let mut st = self.lock();
        Self::check(&st, Verb::Create, obj.id())?;
        if st.objects.contains_key(obj.id()) {
            return Err(ClientError::AlreadyExists(obj.id().clone()));
        }
        st.next_uid += 1;
        let uid = st.next_uid.to_string();
        let mut body = strip_noisy(obj.raw().clone());
        stamp_created(&mut body, &uid);
        st.objects.insert(obj.id().clone(), body.clone());
        st.mutations.creates += 1;
        Ok(body)
    }

    async fn update(&self, obj: &Manifest) -> Result<Json, ClientError> {
        let mut st = self.lock();
        Self::check(&st, Verb::Update, obj.id())?;
        let Some(live) = st.objects.get(obj.id()).cloned() else {
            return Err(ClientError::NotFound(obj.id().clone()));
        };
        let live_meta = live.get("metadata").cloned().unwrap_or(Json::Null);
        if let Some(want_rv) = obj.raw().pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
            let have_rv = live_meta.get("resourceVersion").and_then(|v| v.as_str()).unwrap_or("");
            if want_rv != have_rv {
                return Err(ClientError::Conflict { id: obj.id().clone(), message: format!("resourceVersion {want_rv} is stale (live {have_rv})") });
            }
        }
        let mut body = strip_noisy(obj.raw().clone());
        if strip_noisy(live.clone()) == body {
            st.mutations.noop_updates += 1;
            return Ok(live);
        }
        let generation = live_meta.get("generation").and_then(|v| v.as_i64()).unwrap_or(1);
        let generation = if spec_of(&live) != spec_of(&body) { generation + 1 } else { generation };
        if let Some(meta) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for key in ["uid", "creationTimestamp"] {
                if let Some(v) = live_meta.get(key) { meta.insert(key.into(), v.clone()); }
            }
            meta.insert("resourceVersion".into(), Json::String(bump(live_meta.get("resourceVersion").unwrap_or(&Json::Null))));
            meta.insert("generation".into(), Json::from(generation));
        }
        st.objects.insert(obj.id().clone(), body.clone());
        st.mutations.updates += 1;
        Ok(body)
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), ClientError> {
        let mut st = self.lock();
        Self::check(&st, Verb::Delete, id)?;
        match st.objects.remove(id) {
            Some(_) => {
                st.mutations.deletes += 1;
                Ok(())
            }
            None => Err(ClientError::NotFound(id.clone())),
        }
    }
}
