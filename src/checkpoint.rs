// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication checkpoint identity and document handling.
//!
//! A checkpoint records how far a replication has progressed. It lives in
//! two places that must be compared on startup: a `_local/<checkpoint_id>`
//! document on the remote, and a mirror row in the local store keyed by the
//! same ID (`Database::set_last_sequence`).
//!
//! The checkpoint ID is a pure function of everything that affects which
//! revisions a replication transfers:
//!
//! ```text
//! checkpoint_id = SHA1(canonical_json({
//!     localUUID, remoteURL, push, filter?, filterParams?
//! }))
//! ```
//!
//! Canonical JSON means sorted object keys and no whitespace, so identical
//! replicator settings yield the identical ID across restarts and across
//! processes. Changing the filter (or its params) changes the ID, which
//! correctly restarts the replication from scratch.

use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};

/// Serialize a JSON value deterministically: object keys sorted, no
/// whitespace. Arrays keep their order.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Compute the checkpoint ID for a replication's settings.
pub fn checkpoint_id(
    local_uuid: &str,
    remote_url: &str,
    push: bool,
    filter: Option<&str>,
    filter_params: Option<&Value>,
) -> String {
    let mut spec = Map::new();
    spec.insert("localUUID".into(), json!(local_uuid));
    spec.insert("remoteURL".into(), json!(remote_url));
    spec.insert("push".into(), json!(push));
    if let Some(name) = filter {
        spec.insert("filter".into(), json!(name));
    }
    if let Some(params) = filter_params {
        spec.insert("filterParams".into(), params.clone());
    }

    let canonical = canonical_json(&Value::Object(spec));
    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// In-memory copy of the remote `_local/<checkpoint_id>` document.
///
/// The `_rev` returned by each successful PUT is folded back in so the next
/// PUT carries it for optimistic concurrency; unknown fields written by
/// other agents are preserved.
#[derive(Debug, Clone, Default)]
pub struct RemoteCheckpoint {
    body: Map<String, Value>,
}

impl RemoteCheckpoint {
    /// Wrap a fetched checkpoint body. Non-object values read as empty.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(body) => Self { body },
            _ => Self::default(),
        }
    }

    /// The recorded last sequence, `"0"` when absent.
    pub fn last_sequence(&self) -> String {
        match self.body.get("lastSequence") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => "0".to_string(),
        }
    }

    /// The remote document revision, when known.
    pub fn rev(&self) -> Option<&str> {
        self.body.get("_rev").and_then(Value::as_str)
    }

    /// Adopt the `_rev` returned by a successful PUT.
    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.body.insert("_rev".into(), Value::String(rev.into()));
    }

    /// Body to PUT for a new `last_sequence`, preserving existing fields.
    pub fn body_for_save(&self, last_sequence: &str) -> Value {
        let mut body = self.body.clone();
        body.insert("lastSequence".into(), Value::String(last_sequence.into()));
        Value::Object(body)
    }

    /// Record a saved sequence locally (after a successful PUT).
    pub fn set_last_sequence(&mut self, last_sequence: impl Into<String>) {
        self.body
            .insert("lastSequence".into(), Value::String(last_sequence.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"zeta": 1, "alpha": {"b": 2, "a": 1}, "mid": [3, 1]});
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"a":1,"b":2},"mid":[3,1],"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_json_no_whitespace() {
        let value = json!({"a": "x y", "b": [1, 2]});
        let s = canonical_json(&value);
        assert_eq!(s, r#"{"a":"x y","b":[1,2]}"#);
    }

    #[test]
    fn test_checkpoint_id_is_pure() {
        let a = checkpoint_id("uuid-1", "http://peer/db", true, None, None);
        let b = checkpoint_id("uuid-1", "http://peer/db", true, None, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 40); // SHA-1 hex
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_checkpoint_id_varies_with_settings() {
        let base = checkpoint_id("uuid-1", "http://peer/db", true, None, None);
        assert_ne!(
            base,
            checkpoint_id("uuid-2", "http://peer/db", true, None, None)
        );
        assert_ne!(
            base,
            checkpoint_id("uuid-1", "http://peer/other", true, None, None)
        );
        assert_ne!(
            base,
            checkpoint_id("uuid-1", "http://peer/db", false, None, None)
        );
        assert_ne!(
            base,
            checkpoint_id("uuid-1", "http://peer/db", true, Some("ddoc/f"), None)
        );
        assert_ne!(
            base,
            checkpoint_id(
                "uuid-1",
                "http://peer/db",
                true,
                Some("ddoc/f"),
                Some(&json!({"k": 1}))
            )
        );
    }

    #[test]
    fn test_filter_param_order_does_not_matter() {
        let p1 = serde_json::from_str::<Value>(r#"{"a":1,"b":2}"#).unwrap();
        let p2 = serde_json::from_str::<Value>(r#"{"b":2,"a":1}"#).unwrap();
        let id1 = checkpoint_id("u", "http://p/db", false, Some("f"), Some(&p1));
        let id2 = checkpoint_id("u", "http://p/db", false, Some("f"), Some(&p2));
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_remote_checkpoint_defaults() {
        let cp = RemoteCheckpoint::default();
        assert_eq!(cp.last_sequence(), "0");
        assert_eq!(cp.rev(), None);
    }

    #[test]
    fn test_remote_checkpoint_preserves_foreign_fields() {
        let mut cp = RemoteCheckpoint::from_value(json!({
            "_rev": "0-1",
            "lastSequence": "12",
            "history": [{"session_id": "x"}]
        }));
        assert_eq!(cp.last_sequence(), "12");
        assert_eq!(cp.rev(), Some("0-1"));

        let body = cp.body_for_save("15");
        assert_eq!(body["lastSequence"], "15");
        assert_eq!(body["_rev"], "0-1");
        assert!(body["history"].is_array());

        cp.set_rev("0-2");
        cp.set_last_sequence("15");
        assert_eq!(cp.rev(), Some("0-2"));
        assert_eq!(cp.last_sequence(), "15");
    }

    #[test]
    fn test_numeric_last_sequence_reads_as_string() {
        let cp = RemoteCheckpoint::from_value(json!({"lastSequence": 42}));
        assert_eq!(cp.last_sequence(), "42");
    }
}
