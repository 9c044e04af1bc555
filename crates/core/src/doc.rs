//! Structured entity documents with typed accessors.
//!
//! A [`Document`] is immutable once built; every edit clones the tree and yields a
//! new document, so a cached record is never mutated in place.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::CabinError;

/// Annotation kubectl writes with the declarative configuration of an object.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";
/// Annotation carrying a ReplicaSet's rollout revision.
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

static LABEL_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9./]+$").expect("static regex"));

/// Label keys and values must be non-empty and match `[a-z0-9./]+`.
pub fn validate_label(key: &str, value: Option<&str>) -> Result<(), CabinError> {
    if !LABEL_PART.is_match(key) {
        return Err(CabinError::InvalidLabelFormat(format!("key {:?}", key)));
    }
    if let Some(v) = value {
        if !LABEL_PART.is_match(v) {
            return Err(CabinError::InvalidLabelFormat(format!("value {:?} for key {:?}", v, key)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document(Arc<Value>);

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { self.0.serialize(s) }
}

impl From<Value> for Document {
    fn from(v: Value) -> Self { Self::new(v) }
}

impl Document {
    pub fn new(v: Value) -> Self { Self(Arc::new(v)) }

    pub fn as_value(&self) -> &Value { &self.0 }

    pub fn to_value(&self) -> Value { (*self.0).clone() }

    pub fn pointer(&self, path: &str) -> Option<&Value> { self.0.pointer(path) }

    fn str_at(&self, path: &str) -> Option<&str> { self.0.pointer(path).and_then(|v| v.as_str()) }

    pub fn name(&self) -> Option<&str> { self.str_at("/metadata/name") }
    pub fn namespace(&self) -> Option<&str> { self.str_at("/metadata/namespace") }
    pub fn resource_version(&self) -> Option<&str> { self.str_at("/metadata/resourceVersion") }
    pub fn uid(&self) -> Option<&str> { self.str_at("/metadata/uid") }

    pub fn labels(&self) -> SmallVec<[(String, String); 8]> {
        let mut out = SmallVec::new();
        if let Some(map) = self.0.pointer("/metadata/labels").and_then(|m| m.as_object()) {
            for (k, v) in map.iter() {
                if let Some(val) = v.as_str() {
                    out.push((k.clone(), val.to_string()));
                }
            }
        }
        out
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.0.pointer("/metadata/labels").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0.pointer("/metadata/annotations").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn spec_replicas(&self) -> Option<i64> { self.0.pointer("/spec/replicas").and_then(|v| v.as_i64()) }
    pub fn status_replicas(&self) -> Option<i64> { self.0.pointer("/status/replicas").and_then(|v| v.as_i64()) }
    pub fn status_available_replicas(&self) -> Option<i64> {
        self.0.pointer("/status/availableReplicas").and_then(|v| v.as_i64())
    }
    pub fn status_updated_replicas(&self) -> Option<i64> {
        self.0.pointer("/status/updatedReplicas").and_then(|v| v.as_i64())
    }

    /// Containers of a workload's pod template (`spec.template.spec.containers`).
    pub fn template_containers(&self) -> &[Value] {
        self.0
            .pointer("/spec/template/spec/containers")
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or(&[])
    }

    /// Names of a pod's own containers (`spec.containers`), init containers excluded.
    pub fn container_names(&self) -> Vec<&str> {
        self.0
            .pointer("/spec/containers")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|c| c.get("name").and_then(|n| n.as_str())).collect())
            .unwrap_or_default()
    }

    /// True when `metadata.ownerReferences` names the given owner.
    pub fn is_owned_by(&self, kind: &str, name: &str) -> bool {
        self.0
            .pointer("/metadata/ownerReferences")
            .and_then(|v| v.as_array())
            .map(|refs| {
                refs.iter().any(|r| {
                    r.get("kind").and_then(|k| k.as_str()) == Some(kind)
                        && r.get("name").and_then(|n| n.as_str()) == Some(name)
                })
            })
            .unwrap_or(false)
    }

    /// Short pod status: terminating, the first waiting/terminated reason, else the phase.
    pub fn pod_status(&self) -> String {
        if self.0.pointer("/metadata/deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false) {
            return "Terminating".to_string();
        }
        if let Some(statuses) = self.0.pointer("/status/containerStatuses").and_then(|v| v.as_array()) {
            for st in statuses {
                for state in ["waiting", "terminated"] {
                    if let Some(reason) = st.pointer(&format!("/state/{}/reason", state)).and_then(|v| v.as_str()) {
                        return reason.to_string();
                    }
                }
            }
        }
        self.str_at("/status/phase").unwrap_or("Unknown").to_string()
    }

    /// `(ready, total)` over `status.containerStatuses`.
    pub fn container_readiness(&self) -> (usize, usize) {
        let statuses = self.0.pointer("/status/containerStatuses").and_then(|v| v.as_array());
        match statuses {
            Some(list) => {
                let ready = list.iter().filter(|s| s.get("ready").and_then(|r| r.as_bool()).unwrap_or(false)).count();
                (ready, list.len())
            }
            None => (0, 0),
        }
    }

    /// Clone the tree, apply `f`, and return the result as a new document.
    pub fn edit(&self, f: impl FnOnce(&mut Value)) -> Document {
        let mut v = (*self.0).clone();
        f(&mut v);
        Document::new(v)
    }

    pub fn with_label(&self, key: &str, value: &str) -> Document {
        self.edit(|v| {
            let labels = object_at(v, &["metadata", "labels"]);
            labels.insert(key.to_string(), Value::String(value.to_string()));
        })
    }

    pub fn without_label(&self, key: &str) -> Document {
        self.edit(|v| {
            if let Some(labels) = v.pointer_mut("/metadata/labels").and_then(|m| m.as_object_mut()) {
                labels.remove(key);
            }
        })
    }

    pub fn with_replicas(&self, replicas: u32) -> Document {
        self.edit(|v| {
            let spec = object_at(v, &["spec"]);
            spec.insert("replicas".into(), Value::from(replicas));
        })
    }
}

/// Walk (creating as needed) a chain of object keys and return the innermost map.
fn object_at<'a>(v: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    if !v.is_object() {
        *v = Value::Object(Map::new());
    }
    let map = match v {
        Value::Object(m) => m,
        _ => unreachable!("coerced to an object above"),
    };
    match path.split_first() {
        None => map,
        Some((head, rest)) => object_at(map.entry(head.to_string()).or_insert(Value::Null), rest),
    }
}

#[cfg(feature = "strip-managed-fields")]
pub(crate) fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn label_charset() {
        assert!(validate_label("env", Some("prod")).is_ok());
        assert!(validate_label("app.kubernetes.io/name", Some("web")).is_ok());
        assert!(validate_label("env", Some("prod ")).is_err());
        assert!(validate_label("Env", Some("prod")).is_err());
        assert!(validate_label("", Some("x")).is_err());
        assert!(validate_label("env", Some("")).is_err());
        assert!(validate_label("tier", None).is_ok());
    }

    #[test]
    fn edits_leave_original_untouched() {
        let d = Document::new(json!({"metadata": {"name": "d1"}, "spec": {"replicas": 2}}));
        let labeled = d.with_label("env", "prod");
        let scaled = labeled.with_replicas(5);
        assert_eq!(d.label("env"), None);
        assert_eq!(labeled.label("env"), Some("prod"));
        assert_eq!(labeled.spec_replicas(), Some(2));
        assert_eq!(scaled.spec_replicas(), Some(5));
        assert_eq!(scaled.without_label("env").label("env"), None);
        assert_eq!(scaled.label("env"), Some("prod"));
    }

    #[test]
    fn pod_status_prefers_container_reasons() {
        let crash = Document::new(json!({
            "status": {"phase": "Running", "containerStatuses": [
                {"ready": true, "state": {"running": {}}},
                {"ready": false, "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
            ]}
        }));
        assert_eq!(crash.pod_status(), "CrashLoopBackOff");
        assert_eq!(crash.container_readiness(), (1, 2));

        let running = Document::new(json!({"status": {"phase": "Running"}}));
        assert_eq!(running.pod_status(), "Running");
        let gone = Document::new(json!({"metadata": {"deletionTimestamp": "2020-01-01T00:00:00Z"}}));
        assert_eq!(gone.pod_status(), "Terminating");
        assert_eq!(Document::new(json!({})).pod_status(), "Unknown");
    }

    #[test]
    fn pod_container_names_skip_init_containers() {
        let pod = Document::new(json!({
            "spec": {"initContainers": [{"name": "setup"}], "containers": [{"name": "app"}, {"name": "sidecar"}]}
        }));
        assert_eq!(pod.container_names(), vec!["app", "sidecar"]);
        assert!(Document::new(json!({"spec": {}})).container_names().is_empty());
    }

    #[test]
    fn template_containers_and_owners() {
        let d = Document::new(json!({
            "metadata": {"ownerReferences": [{"kind": "Deployment", "name": "web"}]},
            "spec": {"template": {"spec": {"containers": [{"name": "a", "image": "nginx:1"}]}}}
        }));
        assert_eq!(d.template_containers().len(), 1);
        assert!(d.is_owned_by("Deployment", "web"));
        assert!(!d.is_owned_by("Deployment", "api"));
    }
}
