//! Value helpers: server-stamped timestamps and tree surgery.
//!
//! The store's value type is [`serde_json::Value`]. Clients that need the
//! *store's* notion of "now" (rather than their own clock) write the
//! [`server_timestamp`] sentinel; the store replaces it with its clock at
//! apply time. This is how `disconnected_at` stays comparable across
//! clients with skewed clocks.

use serde_json::{Map, Value, json};

/// Key of the sentinel object understood by the store.
const SENTINEL_KEY: &str = ".sv";

/// A placeholder resolved to the store's clock (ms) when the write lands.
pub fn server_timestamp() -> Value {
    json!({ SENTINEL_KEY: "timestamp" })
}

/// True if `value` is the server-timestamp sentinel.
fn is_timestamp_sentinel(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.len() == 1 && m.get(SENTINEL_KEY).and_then(Value::as_str) == Some("timestamp"))
}

/// Replace every sentinel in `value` with `now_ms`.
pub(crate) fn resolve_sentinels(value: &mut Value, now_ms: i64) {
    if is_timestamp_sentinel(value) {
        *value = json!(now_ms);
        return;
    }
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                resolve_sentinels(v, now_ms);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_sentinels(v, now_ms);
            }
        }
        _ => {}
    }
}

/// Relative read below a JSON node (slash-separated), for use inside
/// transaction closures that inspect a subtree before deciding.
pub fn value_at<'a>(root: &'a Value, rel: &str) -> Option<&'a Value> {
    let segs: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
    get_at(root, &segs)
}

/// Relative write below a JSON node (slash-separated, null removes), the
/// mutating counterpart of [`value_at`].
pub fn set_value_at(root: &mut Value, rel: &str, value: Value) {
    let segs: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
    set_at(root, &segs, value);
}

/// Read the node at `segments` below `root`, if present.
pub(crate) fn get_at<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in segments {
        cur = cur.as_object()?.get(*seg)?;
    }
    Some(cur)
}

/// Write `value` at `segments` below `root`, creating intermediate objects.
///
/// Writing `Value::Null` is a removal: the node is deleted and empty parent
/// objects are pruned, so absent and null are indistinguishable to readers.
pub(crate) fn set_at(root: &mut Value, segments: &[&str], value: Value) {
    if segments.is_empty() {
        *root = if value.is_null() { json!({}) } else { value };
        return;
    }
    if value.is_null() {
        remove_at(root, segments);
        return;
    }
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        if !cur.is_object() {
            *cur = json!({});
        }
        let Value::Object(map) = cur else { return };
        cur = map.entry((*seg).to_string()).or_insert_with(|| json!({}));
    }
    if !cur.is_object() {
        *cur = json!({});
    }
    if let Some(map) = cur.as_object_mut() {
        map.insert(segments[segments.len() - 1].to_string(), value);
    }
}

/// Delete the node at `segments`, pruning parents left empty.
pub(crate) fn remove_at(root: &mut Value, segments: &[&str]) {
    fn inner(node: &mut Value, segments: &[&str]) -> bool {
        let Some(map) = node.as_object_mut() else {
            return false;
        };
        match segments {
            [] => false,
            [last] => {
                map.remove(*last);
                map.is_empty()
            }
            [head, rest @ ..] => {
                if let Some(child) = map.get_mut(*head) {
                    if inner(child, rest) {
                        map.remove(*head);
                    }
                }
                map.is_empty()
            }
        }
    }
    inner(root, segments);
}

/// Apply a shallow update at `segments`.
///
/// Each key in `fields` may itself contain slashes and is applied as a
/// relative write below the update path; a null value removes that child.
/// Children not named in `fields` are left untouched.
pub(crate) fn apply_update(root: &mut Value, segments: &[&str], fields: Map<String, Value>) {
    for (key, value) in fields {
        let mut full: Vec<&str> = segments.to_vec();
        let rel: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
        full.extend(rel);
        set_at(root, &full, value);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_resolves_to_clock() {
        let mut v = json!({
            "status": "disconnected",
            "disconnected_at": server_timestamp(),
            "nested": { "t": server_timestamp() },
        });
        resolve_sentinels(&mut v, 42);
        assert_eq!(v["disconnected_at"], json!(42));
        assert_eq!(v["nested"]["t"], json!(42));
        assert_eq!(v["status"], json!("disconnected"));
    }

    #[test]
    fn set_and_get_roundtrip() {
        let mut root = json!({});
        set_at(&mut root, &["rooms", "ABCD", "meta"], json!({"code": "ABCD"}));
        assert_eq!(
            get_at(&root, &["rooms", "ABCD", "meta", "code"]),
            Some(&json!("ABCD"))
        );
        assert_eq!(get_at(&root, &["rooms", "WXYZ"]), None);
    }

    #[test]
    fn null_write_removes_and_prunes() {
        let mut root = json!({});
        set_at(&mut root, &["rooms", "ABCD", "players", "u1"], json!({"score": 0}));
        set_at(&mut root, &["rooms", "ABCD", "players", "u1"], Value::Null);
        // The whole empty branch is gone, not just the leaf.
        assert_eq!(get_at(&root, &["rooms", "ABCD"]), None);
    }

    #[test]
    fn update_is_shallow_and_supports_slash_keys() {
        let mut root = json!({});
        set_at(
            &mut root,
            &["rooms", "ABCD"],
            json!({"state": {"lock_uid": "u1", "banner": "hi"}, "meta": {"code": "ABCD"}}),
        );
        let mut fields = Map::new();
        fields.insert("state/lock_uid".into(), Value::Null);
        fields.insert("state/banner".into(), json!(""));
        apply_update(&mut root, &["rooms", "ABCD"], fields);

        assert_eq!(get_at(&root, &["rooms", "ABCD", "state", "lock_uid"]), None);
        assert_eq!(
            get_at(&root, &["rooms", "ABCD", "state", "banner"]),
            Some(&json!(""))
        );
        // Untouched siblings survive.
        assert_eq!(
            get_at(&root, &["rooms", "ABCD", "meta", "code"]),
            Some(&json!("ABCD"))
        );
    }
}
