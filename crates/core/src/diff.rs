//! Declared-vs-live comparison.

use serde_json::Value as Json;

/// Drop server-populated fields that never take part in a comparison.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// True when `live` no longer carries every field of `declared`.
///
/// Fields present only on the live side (defaults, server bookkeeping, other
/// field managers) are not drift.
pub fn drifted(declared: &Json, live: &Json) -> bool {
    fn covers(want: &Json, have: &Json) -> bool {
        match (want, have) {
            (Json::Object(w), Json::Object(h)) => w.iter().all(|(k, wv)| h.get(k).is_some_and(|hv| covers(wv, hv))),
            (Json::Array(w), Json::Array(h)) => w.len() == h.len() && w.iter().zip(h).all(|(wv, hv)| covers(wv, hv)),
            (w, h) => w == h,
        }
    }
    !covers(&strip_noisy(declared.clone()), &strip_noisy(live.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_bookkeeping_is_stripped_before_comparing() {
        let live = serde_json::json!({
            "kind": "Role",
            "metadata": {
                "name": "admin",
                "uid": "42",
                "managedFields": [ { "manager": "kubectl" } ],
                "resourceVersion": "9",
                "generation": 3,
                "creationTimestamp": "2024-05-01T00:00:00Z"
            },
            "status": { "conditions": [] },
            "rules": []
        });
        let stripped = strip_noisy(live);
        assert_eq!(stripped, serde_json::json!({ "kind": "Role", "metadata": { "name": "admin" }, "rules": [] }));
    }

    #[test]
    fn live_only_fields_are_not_drift() {
        let declared = serde_json::json!({
            "metadata": { "name": "web", "labels": { "app": "web" } },
            "spec": { "template": { "containers": [ { "name": "c", "image": "nginx" } ] } }
        });
        let live = serde_json::json!({
            "metadata": { "name": "web", "uid": "1", "resourceVersion": "7", "labels": { "app": "web" } },
            "spec": { "template": { "containers": [ { "name": "c", "image": "nginx", "imagePullPolicy": "Always" } ] } },
            "status": { "ready": true }
        });
        assert!(!drifted(&declared, &live));

        let mut changed = live.clone();
        changed["metadata"]["labels"]["app"] = serde_json::json!("other");
        assert!(drifted(&declared, &changed));

        let mut missing = live;
        missing["spec"]["template"]["containers"] = serde_json::json!([]);
        assert!(drifted(&declared, &missing));
    }
}
