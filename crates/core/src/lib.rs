//! Cabin core types: cluster identity, entity keys and records, events.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod doc;
mod error;
pub mod policy;

pub use doc::{validate_label, Document, LAST_APPLIED_ANNOTATION, REVISION_ANNOTATION};
pub use error::{CabinError, CabinResult, ClientError};
pub use policy::{Policy, PolicySource, SharedPolicy};

pub mod prelude {
    pub use super::{
        CabinError, CabinResult, ClientError, Cluster, ClusterId, Document, EntityKey, EntityKind, EntityRecord,
        Event, MutationId, MutationKind, MutationStatus, NewCluster, Policy, PolicySource, ResourceVersion, Topic,
    };
}

/// Opaque identity of a registered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for ClusterId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl FromStr for ClusterId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s).map(Self) }
}

/// Registration request for a new cluster endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewCluster {
    pub name: String,
    pub url: String,
    /// Kubeconfig context holding the credentials for this endpoint.
    #[serde(default)]
    pub credentials_ref: Option<String>,
}

/// A registered cluster endpoint and its last-known health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub url: String,
    pub credentials_ref: Option<String>,
    /// Assumed reachable until the health loop proves otherwise.
    pub reachable: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// Normalized form used for duplicate detection (`https://c1/` == `https://c1`).
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Entity kinds tracked per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Pod,
    Deployment,
    Namespace,
    Service,
    ReplicaSet,
    Node,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Pod,
        EntityKind::Deployment,
        EntityKind::Namespace,
        EntityKind::Service,
        EntityKind::ReplicaSet,
        EntityKind::Node,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Pod => "Pod",
            EntityKind::Deployment => "Deployment",
            EntityKind::Namespace => "Namespace",
            EntityKind::Service => "Service",
            EntityKind::ReplicaSet => "ReplicaSet",
            EntityKind::Node => "Node",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            EntityKind::Deployment | EntityKind::ReplicaSet => "apps",
            _ => "",
        }
    }

    pub fn version(&self) -> &'static str { "v1" }

    pub fn plural(&self) -> &'static str {
        match self {
            EntityKind::Pod => "pods",
            EntityKind::Deployment => "deployments",
            EntityKind::Namespace => "namespaces",
            EntityKind::Service => "services",
            EntityKind::ReplicaSet => "replicasets",
            EntityKind::Node => "nodes",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, EntityKind::Namespace | EntityKind::Node)
    }

    /// Kinds exposing `spec.replicas`.
    pub fn scalable(&self) -> bool {
        matches!(self, EntityKind::Deployment | EntityKind::ReplicaSet)
    }

    pub fn supports_rolling_update(&self) -> bool { matches!(self, EntityKind::Deployment) }

    /// `v1/Pod` or `apps/v1/Deployment`.
    pub fn gvk_key(&self) -> String {
        if self.group().is_empty() {
            format!("{}/{}", self.version(), self.as_str())
        } else {
            format!("{}/{}/{}", self.group(), self.version(), self.as_str())
        }
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for EntityKind {
    type Err = CabinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let k = match s.trim().to_ascii_lowercase().as_str() {
            "po" | "pod" | "pods" => EntityKind::Pod,
            "deploy" | "deployment" | "deployments" => EntityKind::Deployment,
            "ns" | "namespace" | "namespaces" => EntityKind::Namespace,
            "svc" | "service" | "services" => EntityKind::Service,
            "rs" | "replicaset" | "replicasets" => EntityKind::ReplicaSet,
            "no" | "node" | "nodes" => EntityKind::Node,
            other => return Err(CabinError::UnsupportedKind(other.to_string())),
        };
        Ok(k)
    }
}

/// Unique identity of a cached entity: `(cluster, kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub cluster: ClusterId,
    pub kind: EntityKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl EntityKey {
    pub fn new(cluster: ClusterId, kind: EntityKind, namespace: Option<&str>, name: &str) -> Self {
        // Cluster-scoped kinds never carry a namespace.
        let namespace = if kind.namespaced() { namespace.map(|s| s.to_string()) } else { None };
        Self { cluster, kind, namespace, name: name.to_string() }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}/{}", self.cluster, self.kind, ns, self.name),
            None => write!(f, "{}:{}/{}", self.cluster, self.kind, self.name),
        }
    }
}

/// Server-assigned version token. Kubernetes serializes these as decimal strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceVersion(pub u64);

impl FromStr for ResourceVersion {
    type Err = ClientError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| ClientError::Malformed(format!("non-numeric resourceVersion {:?}", s)))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// A fetched resource. Never partially written: payload replacement is atomic.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    pub key: EntityKey,
    pub resource_version: ResourceVersion,
    pub payload: Document,
    pub fetched_at: DateTime<Utc>,
}

impl EntityRecord {
    /// Build a record from a raw server document, rejecting anything that cannot be keyed.
    pub fn from_document(cluster: ClusterId, kind: EntityKind, raw: serde_json::Value) -> Result<Self, ClientError> {
        let mut raw = raw;
        if !raw.is_object() {
            return Err(ClientError::Malformed(format!("{} document is not an object", kind)));
        }
        #[cfg(feature = "strip-managed-fields")]
        doc::strip_managed_fields(&mut raw);
        let payload = Document::new(raw);
        let name = payload
            .name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ClientError::Malformed(format!("{} document missing metadata.name", kind)))?
            .to_string();
        let namespace = payload.namespace().map(|s| s.to_string());
        if kind.namespaced() && namespace.is_none() {
            return Err(ClientError::Malformed(format!("{} {} missing metadata.namespace", kind, name)));
        }
        let resource_version = payload
            .resource_version()
            .ok_or_else(|| ClientError::Malformed(format!("{} {} missing metadata.resourceVersion", kind, name)))?
            .parse::<ResourceVersion>()?;
        Ok(Self {
            key: EntityKey::new(cluster, kind, namespace.as_deref(), &name),
            resource_version,
            payload,
            fetched_at: Utc::now(),
        })
    }
}

/// Monotonic id assigned to each submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "m{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    LabelAdd,
    LabelDelete,
    Scale,
    RollingUpdate,
    CrossClusterCopy,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationKind::LabelAdd => "label-add",
            MutationKind::LabelDelete => "label-delete",
            MutationKind::Scale => "scale",
            MutationKind::RollingUpdate => "rolling-update",
            MutationKind::CrossClusterCopy => "cross-cluster-copy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Change notifications fanned out by the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ClusterRegistered { cluster: ClusterId },
    ClusterUpdated { cluster: ClusterId },
    ClusterRemoved { cluster: ClusterId },
    ClusterReachabilityChanged { cluster: ClusterId, reachable: bool },
    EntityChanged { key: EntityKey },
    EntityRemoved { key: EntityKey },
    MutationResolved {
        id: MutationId,
        key: EntityKey,
        kind: MutationKind,
        status: MutationStatus,
        reason: Option<String>,
    },
}

impl Event {
    pub fn cluster(&self) -> ClusterId {
        match self {
            Event::ClusterRegistered { cluster }
            | Event::ClusterUpdated { cluster }
            | Event::ClusterRemoved { cluster }
            | Event::ClusterReachabilityChanged { cluster, .. } => *cluster,
            Event::EntityChanged { key } | Event::EntityRemoved { key } | Event::MutationResolved { key, .. } => {
                key.cluster
            }
        }
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            Event::EntityChanged { key } | Event::EntityRemoved { key } | Event::MutationResolved { key, .. } => {
                Some(key.kind)
            }
            _ => None,
        }
    }
}

/// Subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Global,
    Cluster(ClusterId),
    Kind(ClusterId, EntityKind),
}

impl Topic {
    pub fn matches(&self, ev: &Event) -> bool {
        match self {
            Topic::Global => true,
            Topic::Cluster(id) => ev.cluster() == *id,
            Topic::Kind(id, kind) => ev.cluster() == *id && ev.entity_kind() == Some(*kind),
        }
    }
}
