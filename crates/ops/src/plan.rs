//! What each mutation sends, and the checks it must pass before sending it.

use cabin_core::{
    validate_label, CabinError, CabinResult, ClusterId, Document, EntityKey, EntityRecord, MutationKind, Policy,
    LAST_APPLIED_ANNOTATION,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A user-initiated write against one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    LabelAdd { key: String, value: String },
    LabelDelete { key: String },
    Scale { replicas: u32 },
    RollingUpdate { image: String },
    /// Recreate the entity on another cluster from its last-applied configuration.
    CrossClusterCopy { target: ClusterId },
}

pub(crate) enum Plan {
    Patch { partial: Value },
    Create { target: ClusterId, dest: EntityKey, document: Value },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::LabelAdd { .. } => MutationKind::LabelAdd,
            Mutation::LabelDelete { .. } => MutationKind::LabelDelete,
            Mutation::Scale { .. } => MutationKind::Scale,
            Mutation::RollingUpdate { .. } => MutationKind::RollingUpdate,
            Mutation::CrossClusterCopy { .. } => MutationKind::CrossClusterCopy,
        }
    }

    /// Checks that need nothing but the request itself and the current policy.
    pub fn validate(&self, key: &EntityKey, policy: &Policy) -> CabinResult<()> {
        match self {
            Mutation::LabelAdd { key: k, value } => validate_label(k, Some(value)),
            Mutation::LabelDelete { key: k } => validate_label(k, None),
            Mutation::Scale { replicas } => {
                if !key.kind.scalable() {
                    return Err(CabinError::InvalidArgument(format!("{} has no replica count", key.kind)));
                }
                if *replicas == 0 || *replicas > policy.max_replicas {
                    return Err(CabinError::InvalidReplicas { requested: *replicas, max: policy.max_replicas });
                }
                Ok(())
            }
            Mutation::RollingUpdate { image } => {
                if !key.kind.supports_rolling_update() {
                    return Err(CabinError::InvalidArgument(format!("{} does not support rolling updates", key.kind)));
                }
                if image.trim().is_empty() || image.chars().any(char::is_whitespace) {
                    return Err(CabinError::InvalidArgument(format!("invalid image reference {:?}", image)));
                }
                Ok(())
            }
            Mutation::CrossClusterCopy { target } => {
                if *target == key.cluster {
                    return Err(CabinError::InvalidArgument("copy target must be a different cluster".into()));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn is_optimistic(&self) -> bool {
        matches!(self, Mutation::LabelAdd { .. } | Mutation::LabelDelete { .. } | Mutation::Scale { .. })
    }

    /// Local preview of the change, applied to the cache before the server answers.
    pub(crate) fn preview(&self, doc: &Document) -> Document {
        match self {
            Mutation::LabelAdd { key, value } => doc.with_label(key, value),
            Mutation::LabelDelete { key } => doc.without_label(key),
            Mutation::Scale { replicas } => doc.with_replicas(*replicas),
            _ => doc.clone(),
        }
    }

    /// Build the request from the entity's current cached state.
    pub(crate) fn plan(&self, source: &EntityRecord) -> CabinResult<Plan> {
        let partial = match self {
            Mutation::LabelAdd { key, value } => json!({"metadata": {"labels": {key.as_str(): value}}}),
            Mutation::LabelDelete { key } => json!({"metadata": {"labels": {key.as_str(): Value::Null}}}),
            Mutation::Scale { replicas } => json!({"spec": {"replicas": replicas}}),
            Mutation::RollingUpdate { image } => {
                let containers = source.payload.template_containers();
                if containers.len() != 1 {
                    return Err(CabinError::UnsupportedMultiContainer(containers.len()));
                }
                // Merge patches replace arrays wholesale, so send the full container.
                let mut container = containers[0].clone();
                match container.as_object_mut() {
                    Some(c) => c.insert("image".into(), Value::String(image.clone())),
                    None => return Err(CabinError::MalformedResponse("container spec is not an object".into())),
                };
                json!({"spec": {"template": {"spec": {"containers": [container]}}}})
            }
            Mutation::CrossClusterCopy { target } => {
                let document = copy_document(source)?;
                let dest = EntityKey::new(
                    *target,
                    source.key.kind,
                    document.pointer("/metadata/namespace").and_then(|v| v.as_str()),
                    document.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or(&source.key.name),
                );
                return Ok(Plan::Create { target: *target, dest, document });
            }
        };
        Ok(Plan::Patch { partial })
    }
}

/// Server-populated fields that must not travel to another cluster.
const NOISY_METADATA: [&str; 7] =
    ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "selfLink", "ownerReferences"];

/// Declarative configuration of `source`, cleaned up for creation elsewhere.
pub fn copy_document(source: &EntityRecord) -> CabinResult<Value> {
    let raw = source
        .payload
        .annotation(LAST_APPLIED_ANNOTATION)
        .ok_or_else(|| CabinError::MissingSourceConfiguration(format!("{} has no {}", source.key, LAST_APPLIED_ANNOTATION)))?;
    let mut doc: Value = serde_json::from_str(raw)
        .map_err(|e| CabinError::MissingSourceConfiguration(format!("{}: unparsable configuration: {}", source.key, e)))?;
    let Some(obj) = doc.as_object_mut() else {
        return Err(CabinError::MissingSourceConfiguration(format!("{}: configuration is not an object", source.key)));
    };
    obj.remove("status");
    obj.entry("apiVersion").or_insert_with(|| Value::String(source.key.kind.api_version()));
    obj.entry("kind").or_insert_with(|| Value::String(source.key.kind.as_str().to_string()));
    let meta = obj.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    if let Some(m) = meta.as_object_mut() {
        for f in NOISY_METADATA {
            m.remove(f);
        }
        m.entry("name").or_insert_with(|| Value::String(source.key.name.clone()));
        if let Some(ns) = source.key.namespace.as_deref() {
            m.entry("namespace").or_insert_with(|| Value::String(ns.to_string()));
        }
    }
    Ok(doc)
}
