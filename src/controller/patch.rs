//! JSON patch (RFC 6902) builder
//!
//! Operations are kept in append order. Builder methods take the patch by
//! value and return the extended patch:
//!
//! ```
//! use stack_controller::controller::JsonPatch;
//!
//! let patch = JsonPatch::new()
//!     .replace("/spec/replicas", 3)
//!     .add_kv("/metadata/annotations", "example.com/key", "value");
//! assert_eq!(patch.len(), 2);
//! ```

use kube::api::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    /// Fails the whole patch unless `path` holds `value`
    Test { path: String, value: Value },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(Vec<Operation>);

impl JsonPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push(Operation::Replace {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn add(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push(Operation::Add {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.0.push(Operation::Remove { path: path.into() });
        self
    }

    pub fn test(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push(Operation::Test {
            path: path.into(),
            value: value.into(),
        });
        self
    }

    /// Whether the patch carries a `test` precondition
    pub fn is_guarded(&self) -> bool {
        self.0.iter().any(|op| matches!(op, Operation::Test { .. }))
    }

    /// Add `key` to the map at `path`; the key is JSON-pointer escaped
    pub fn add_kv(self, path: &str, key: &str, value: impl Into<Value>) -> Self {
        self.add(format!("{}/{}", path, escape_key(key)), value)
    }

    /// Append every operation of `other`
    pub fn extend(mut self, other: JsonPatch) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn operations(&self) -> &[Operation] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Wire form; an empty patch is `[]`
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Convert into a patch the kube client can send
    pub fn to_kube_patch(&self) -> Result<Patch<()>> {
        let patch: json_patch::Patch = serde_json::from_value(serde_json::to_value(&self.0)?)?;
        Ok(Patch::Json(patch))
    }
}

/// JSON-pointer escaping of a single path segment
pub fn escape_key(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_patch_serializes_to_empty_list() {
        assert_eq!(JsonPatch::new().to_json().unwrap(), "[]");
    }

    #[test]
    fn test_operations_keep_append_order() {
        let patch = JsonPatch::new()
            .remove("/metadata/annotations/a")
            .replace("/spec/replicas", 2)
            .add("/metadata/labels", json!({}));

        let value: Value = serde_json::from_str(&patch.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!([
                {"op": "remove", "path": "/metadata/annotations/a"},
                {"op": "replace", "path": "/spec/replicas", "value": 2},
                {"op": "add", "path": "/metadata/labels", "value": {}}
            ])
        );
    }

    #[test]
    fn test_add_kv_escapes_key() {
        let patch =
            JsonPatch::new().add_kv("/metadata/annotations", "compose.docker.com/revision-1", "{}");
        assert_eq!(
            patch.operations()[0],
            Operation::Add {
                path: "/metadata/annotations/compose.docker.com~1revision-1".to_string(),
                value: json!("{}"),
            }
        );
        assert_eq!(escape_key("a~b/c"), "a~0b~1c");
    }

    #[test]
    fn test_guard_serializes_as_test_op() {
        let patch = JsonPatch::new()
            .test("/metadata/resourceVersion", "42")
            .add("/metadata/annotations", json!({}));

        assert!(patch.is_guarded());
        assert!(!JsonPatch::new().remove("/a").is_guarded());
        let value: Value = serde_json::from_str(&patch.to_json().unwrap()).unwrap();
        assert_eq!(
            value[0],
            json!({"op": "test", "path": "/metadata/resourceVersion", "value": "42"})
        );
        assert!(patch.to_kube_patch().is_ok());
    }

    #[test]
    fn test_extend_appends() {
        let first = JsonPatch::new().remove("/a");
        let second = JsonPatch::new().remove("/b").remove("/c");
        let patch = first.clone().extend(second);

        assert_eq!(first.len(), 1);
        assert_eq!(patch.len(), 3);
    }

    #[test]
    fn test_converts_to_kube_patch() {
        let patch = JsonPatch::new().replace("/spec/replicas", 3);
        match patch.to_kube_patch().unwrap() {
            Patch::Json(ops) => assert_eq!(ops.0.len(), 1),
            other => panic!("unexpected patch {other:?}"),
        }
    }
}
