//! In-memory cluster API for tests.
//!
//! Clusters are addressed by URL. Every call is recorded so tests can assert that
//! an operation never reached the network. Objects get monotonically increasing
//! resource versions; a merge patch to `spec.replicas` leaves `status` stale until
//! the next read, mimicking a controller catching up. Container logs are
//! scripted per pod and container with [`FakeClusterClient::set_logs`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use cabin_core::{Cluster, ClientError, EntityKey, EntityKind};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};

use crate::{ClusterClient, DocStream, LineStream, LogOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Probe,
    List,
    Get,
    Patch,
    Create,
    Logs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub url: String,
    pub op: FakeOp,
    pub target: String,
}

type ObjKey = (EntityKind, Option<String>, String);

struct FakeCluster {
    reachable: bool,
    objects: BTreeMap<ObjKey, Value>,
    failures: VecDeque<(FakeOp, ClientError)>,
    interrupt_list_after: Option<usize>,
    unsettled: HashSet<ObjKey>,
    logs: HashMap<(ObjKey, Option<String>), Vec<String>>,
}

impl FakeCluster {
    fn new() -> Self {
        Self {
            reachable: true,
            objects: BTreeMap::new(),
            failures: VecDeque::new(),
            interrupt_list_after: None,
            unsettled: HashSet::new(),
            logs: HashMap::new(),
        }
    }

    fn take_failure(&mut self, op: FakeOp) -> Option<ClientError> {
        let idx = self.failures.iter().position(|(o, _)| *o == op)?;
        self.failures.remove(idx).map(|(_, e)| e)
    }
}

#[derive(Default)]
struct FakeState {
    clusters: HashMap<String, FakeCluster>,
    calls: Vec<FakeCall>,
    next_rv: u64,
    patch_delay: Option<Duration>,
}

impl FakeState {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    /// Converge `status.replicas` for objects whose spec changed since the last read.
    fn settle(&mut self, url: &str) {
        let Some(c) = self.clusters.get_mut(url) else { return };
        let pending: Vec<ObjKey> = c.unsettled.drain().collect();
        for k in pending {
            self.next_rv += 1;
            let rv = self.next_rv.to_string();
            let Some(c) = self.clusters.get_mut(url) else { return };
            if let Some(obj) = c.objects.get_mut(&k) {
                let want = obj.pointer("/spec/replicas").cloned().unwrap_or(Value::from(0));
                let status = ensure_object(obj, "status");
                status.insert("replicas".into(), want.clone());
                status.insert("availableReplicas".into(), want.clone());
                status.insert("updatedReplicas".into(), want);
                set_rv(obj, rv);
            }
        }
    }
}

fn ensure_object<'a>(v: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
    if !v.is_object() {
        *v = Value::Object(Map::new());
    }
    let map = v.as_object_mut().expect("object ensured above");
    let entry = map.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut().expect("object ensured above")
}

fn set_rv(obj: &mut Value, rv: String) {
    ensure_object(obj, "metadata").insert("resourceVersion".into(), Value::String(rv));
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn obj_key(kind: EntityKind, namespace: Option<&str>, name: &str) -> ObjKey {
    let ns = if kind.namespaced() { namespace.map(|s| s.to_string()) } else { None };
    (kind, ns, name.to_string())
}

pub struct FakeClusterClient {
    state: Mutex<FakeState>,
}

impl Default for FakeClusterClient {
    fn default() -> Self { Self::new() }
}

impl FakeClusterClient {
    pub fn new() -> Self { Self { state: Mutex::new(FakeState::default()) } }

    fn lock(&self) -> MutexGuard<'_, FakeState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn add_cluster(&self, url: &str) {
        self.lock().clusters.entry(url.to_string()).or_insert_with(FakeCluster::new);
    }

    pub fn set_reachable(&self, url: &str, reachable: bool) {
        self.lock().clusters.entry(url.to_string()).or_insert_with(FakeCluster::new).reachable = reachable;
    }

    /// Store a document, stamping a fresh resource version. Returns the stored copy.
    pub fn put(&self, url: &str, kind: EntityKind, mut doc: Value) -> Value {
        let mut st = self.lock();
        let rv = st.bump();
        set_rv(&mut doc, rv);
        let name = doc.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let ns = doc.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let cluster = st.clusters.entry(url.to_string()).or_insert_with(FakeCluster::new);
        cluster.objects.insert(obj_key(kind, ns.as_deref(), &name), doc.clone());
        doc
    }

    /// Store a document exactly as given, without stamping a version.
    pub fn put_raw(&self, url: &str, kind: EntityKind, doc: Value) {
        let name = doc.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let ns = doc.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(|s| s.to_string());
        let mut st = self.lock();
        let cluster = st.clusters.entry(url.to_string()).or_insert_with(FakeCluster::new);
        cluster.objects.insert(obj_key(kind, ns.as_deref(), &name), doc);
    }

    pub fn remove(&self, url: &str, kind: EntityKind, namespace: Option<&str>, name: &str) {
        if let Some(c) = self.lock().clusters.get_mut(url) {
            c.objects.remove(&obj_key(kind, namespace, name));
        }
    }

    pub fn object(&self, url: &str, kind: EntityKind, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock().clusters.get(url).and_then(|c| c.objects.get(&obj_key(kind, namespace, name)).cloned())
    }

    /// Make the next `op` against `url` fail with `err`.
    pub fn fail_next(&self, url: &str, op: FakeOp, err: ClientError) {
        self.lock()
            .clusters
            .entry(url.to_string())
            .or_insert_with(FakeCluster::new)
            .failures
            .push_back((op, err));
    }

    /// The next listing against `url` yields `n` documents, then a network error.
    pub fn interrupt_list_after(&self, url: &str, n: usize) {
        self.lock().clusters.entry(url.to_string()).or_insert_with(FakeCluster::new).interrupt_list_after = Some(n);
    }

    /// Script the log of a pod container; `None` is the log served when no container is named.
    pub fn set_logs(&self, url: &str, namespace: &str, pod: &str, container: Option<&str>, lines: &[&str]) {
        let key = (obj_key(EntityKind::Pod, Some(namespace), pod), container.map(|c| c.to_string()));
        let lines = lines.iter().map(|l| l.to_string()).collect();
        self.lock().clusters.entry(url.to_string()).or_insert_with(FakeCluster::new).logs.insert(key, lines);
    }

    /// Delay applied before every patch takes effect.
    pub fn set_patch_delay(&self, delay: Option<Duration>) { self.lock().patch_delay = delay; }

    pub fn calls(&self) -> Vec<FakeCall> { self.lock().calls.clone() }

    pub fn count(&self, op: FakeOp) -> usize { self.lock().calls.iter().filter(|c| c.op == op).count() }

    pub fn count_for(&self, url: &str, op: FakeOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op && c.url == url).count()
    }

    fn begin(&self, url: &str, op: FakeOp, target: String) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.calls.push(FakeCall { url: url.to_string(), op, target });
        let cluster = st
            .clusters
            .get_mut(url)
            .ok_or_else(|| ClientError::Network(format!("{}: connection refused", url)))?;
        if let Some(err) = cluster.take_failure(op) {
            return Err(err);
        }
        if !cluster.reachable {
            return Err(ClientError::Network(format!("{}: unreachable", url)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeClusterClient {
    async fn probe(&self, cluster: &Cluster) -> bool { self.begin(&cluster.url, FakeOp::Probe, String::new()).is_ok() }

    async fn list(
        &self,
        cluster: &Cluster,
        kind: EntityKind,
        namespace: Option<&str>,
        _page_size: u32,
    ) -> Result<DocStream, ClientError> {
        self.begin(&cluster.url, FakeOp::List, format!("{}/{}", kind, namespace.unwrap_or("*")))?;
        let mut st = self.lock();
        st.settle(&cluster.url);
        let Some(c) = st.clusters.get_mut(&cluster.url) else {
            return Err(ClientError::Network("cluster vanished".into()));
        };
        let items: Vec<Result<Value, ClientError>> = c
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .map(|(_, v)| Ok(v.clone()))
            .collect();
        let items = match c.interrupt_list_after.take() {
            Some(n) => {
                let mut cut: Vec<_> = items.into_iter().take(n).collect();
                cut.push(Err(ClientError::Network("connection reset mid-listing".into())));
                cut
            }
            None => items,
        };
        Ok(stream::iter(items).boxed())
    }

    async fn get(&self, cluster: &Cluster, key: &EntityKey) -> Result<Value, ClientError> {
        self.begin(&cluster.url, FakeOp::Get, key.to_string())?;
        let mut st = self.lock();
        st.settle(&cluster.url);
        st.clusters
            .get(&cluster.url)
            .and_then(|c| c.objects.get(&obj_key(key.kind, key.namespace.as_deref(), &key.name)).cloned())
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn patch(&self, cluster: &Cluster, key: &EntityKey, partial: &Value) -> Result<Value, ClientError> {
        self.begin(&cluster.url, FakeOp::Patch, key.to_string())?;
        let delay = self.lock().patch_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.lock();
        let rv = st.bump();
        let c = st
            .clusters
            .get_mut(&cluster.url)
            .ok_or_else(|| ClientError::Network("cluster vanished".into()))?;
        let k = obj_key(key.kind, key.namespace.as_deref(), &key.name);
        let obj = c.objects.get_mut(&k).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        merge_patch(obj, partial);
        set_rv(obj, rv);
        let out = obj.clone();
        if partial.pointer("/spec/replicas").is_some() {
            c.unsettled.insert(k);
        }
        Ok(out)
    }

    async fn create(&self, cluster: &Cluster, kind: EntityKind, document: &Value) -> Result<Value, ClientError> {
        let name = document
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClientError::Server("metadata.name is required".into()))?
            .to_string();
        self.begin(&cluster.url, FakeOp::Create, format!("{}/{}", kind, name))?;
        let mut doc = document.clone();
        let ns = if kind.namespaced() {
            let ns = doc.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("default").to_string();
            ensure_object(&mut doc, "metadata").insert("namespace".into(), json!(ns));
            Some(ns)
        } else {
            None
        };
        let mut st = self.lock();
        let rv = st.bump();
        let c = st
            .clusters
            .get_mut(&cluster.url)
            .ok_or_else(|| ClientError::Network("cluster vanished".into()))?;
        let k = obj_key(kind, ns.as_deref(), &name);
        if c.objects.contains_key(&k) {
            return Err(ClientError::Conflict(format!("{} {} already exists", kind, name)));
        }
        ensure_object(&mut doc, "metadata").insert("uid".into(), json!(uuid::Uuid::new_v4().to_string()));
        set_rv(&mut doc, rv);
        c.objects.insert(k, doc.clone());
        Ok(doc)
    }

    async fn logs(
        &self,
        cluster: &Cluster,
        pod: &EntityKey,
        container: Option<&str>,
        opts: &LogOptions,
    ) -> Result<LineStream, ClientError> {
        self.begin(&cluster.url, FakeOp::Logs, format!("{}/{}", pod, container.unwrap_or("")))?;
        let st = self.lock();
        let Some(c) = st.clusters.get(&cluster.url) else {
            return Err(ClientError::Network("cluster vanished".into()));
        };
        let k = obj_key(EntityKind::Pod, pod.namespace.as_deref(), &pod.name);
        if !c.objects.contains_key(&k) {
            let missing: Vec<Result<String, ClientError>> = vec![Err(ClientError::NotFound(pod.to_string()))];
            return Ok(stream::iter(missing).boxed());
        }
        let mut lines = c.logs.get(&(k, container.map(|s| s.to_string()))).cloned().unwrap_or_default();
        if let Some(n) = opts.tail_lines {
            let keep = usize::try_from(n.max(0)).unwrap_or(0);
            let cut = lines.len().saturating_sub(keep);
            lines.drain(..cut);
        }
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }
}
