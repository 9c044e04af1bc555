//! Cabin kubehub: the cluster API client contract and its kube-rs backend.
//!
//! The engine never speaks the Kubernetes wire protocol itself; it goes through
//! [`ClusterClient`], which classifies every failure into a [`ClientError`].

#![forbid(unsafe_code)]

use std::sync::Mutex;

use cabin_core::{Cluster, ClusterId, ClientError, EntityKey, EntityKind};
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, LogParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "fake"))]
pub mod fake;

/// Raw documents yielded one at a time; an `Err` item ends the listing early.
pub type DocStream = BoxStream<'static, Result<Value, ClientError>>;

/// Log lines as they arrive, without trailing newlines; an `Err` item ends the stream.
pub type LineStream = BoxStream<'static, Result<String, ClientError>>;

/// How much of a container log to read and whether to keep following it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    /// Read the previous, terminated instance of the container.
    pub previous: bool,
}

/// Remote operations the engine needs from a cluster.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Lightweight liveness probe.
    async fn probe(&self, cluster: &Cluster) -> bool;

    /// List a collection, page by page.
    async fn list(
        &self,
        cluster: &Cluster,
        kind: EntityKind,
        namespace: Option<&str>,
        page_size: u32,
    ) -> Result<DocStream, ClientError>;

    async fn get(&self, cluster: &Cluster, key: &EntityKey) -> Result<Value, ClientError>;

    /// JSON merge patch; returns the server-confirmed document.
    async fn patch(&self, cluster: &Cluster, key: &EntityKey, partial: &Value) -> Result<Value, ClientError>;

    async fn create(&self, cluster: &Cluster, kind: EntityKind, document: &Value) -> Result<Value, ClientError>;

    /// Stream a pod's container log. `container` may be omitted for
    /// single-container pods. A server refusal arrives as the first item.
    async fn logs(
        &self,
        cluster: &Cluster,
        pod: &EntityKey,
        container: Option<&str>,
        opts: &LogOptions,
    ) -> Result<LineStream, ClientError>;

    /// Drop any per-cluster connection state.
    fn forget(&self, _cluster: ClusterId) {}
}

/// Map kube-rs errors onto the engine's remote error classes.
pub fn classify(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            401 | 403 => ClientError::Auth(ae.message),
            404 => ClientError::NotFound(ae.message),
            409 => ClientError::Conflict(ae.message),
            code if code >= 500 => ClientError::Server(format!("{} ({})", ae.message, code)),
            code => ClientError::Server(format!("{}: {} ({})", ae.reason, ae.message, code)),
        },
        kube::Error::SerdeError(e) => ClientError::Malformed(e.to_string()),
        kube::Error::Auth(e) => ClientError::Auth(e.to_string()),
        other => ClientError::Network(other.to_string()),
    }
}

fn api_resource(kind: EntityKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn dynamic_api(client: Client, kind: EntityKind, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = api_resource(kind);
    match namespace {
        Some(ns) if kind.namespaced() => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    }
}

fn log_params(container: Option<&str>, opts: &LogOptions) -> LogParams {
    LogParams {
        container: container.map(|c| c.to_string()),
        follow: opts.follow,
        tail_lines: opts.tail_lines,
        since_seconds: opts.since_seconds,
        previous: opts.previous,
        ..LogParams::default()
    }
}

fn to_json(obj: &DynamicObject) -> Result<Value, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Malformed(format!("serializing DynamicObject: {}", e)))
}

/// Aim a loaded kubeconfig at the registered endpoint instead of the context's own server.
fn point_at(cfg: &mut Config, url: &str) -> Result<(), ClientError> {
    cfg.cluster_url = url.parse().map_err(|e| ClientError::Network(format!("invalid cluster url {}: {}", url, e)))?;
    Ok(())
}

/// Default implementation using kube-rs. One client per cluster, built lazily
/// from the kubeconfig context named by `credentials_ref`.
pub struct KubeClusterClient {
    clients: Mutex<FxHashMap<ClusterId, Client>>,
}

impl Default for KubeClusterClient {
    fn default() -> Self { Self::new() }
}

impl KubeClusterClient {
    pub fn new() -> Self { Self { clients: Mutex::new(FxHashMap::default()) } }

    async fn client_for(&self, cluster: &Cluster) -> Result<Client, ClientError> {
        if let Some(c) = self.clients.lock().unwrap_or_else(|e| e.into_inner()).get(&cluster.id).cloned() {
            return Ok(c);
        }
        let mut cfg = match cluster.credentials_ref.as_deref() {
            Some(ctx) => {
                let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
                Config::from_kubeconfig(&opts)
                    .await
                    .map_err(|e| ClientError::Auth(format!("kubeconfig context {}: {}", ctx, e)))?
            }
            None => Config::infer().await.map_err(|e| ClientError::Auth(format!("inferring kube config: {}", e)))?,
        };
        point_at(&mut cfg, &cluster.url)?;
        let client = Client::try_from(cfg).map_err(classify)?;
        info!(cluster = %cluster.id, url = %cluster.url, context = ?cluster.credentials_ref, "kube client ready");
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cluster.id, client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn probe(&self, cluster: &Cluster) -> bool {
        let client = match self.client_for(cluster).await {
            Ok(c) => c,
            Err(e) => {
                warn!(cluster = %cluster.id, error = %e, "probe: no client");
                return false;
            }
        };
        match client.apiserver_version().await {
            Ok(info) => {
                debug!(cluster = %cluster.id, version = %info.git_version, "probe ok");
                true
            }
            Err(e) => {
                debug!(cluster = %cluster.id, error = %e, "probe failed");
                false
            }
        }
    }

    async fn list(
        &self,
        cluster: &Cluster,
        kind: EntityKind,
        namespace: Option<&str>,
        page_size: u32,
    ) -> Result<DocStream, ClientError> {
        let client = self.client_for(cluster).await?;
        let api = dynamic_api(client, kind, namespace);
        let cluster_id = cluster.id;
        let stream = async_stream::try_stream! {
            let mut token: Option<String> = None;
            let mut pages = 0u32;
            loop {
                let mut lp = ListParams::default().limit(page_size);
                if let Some(t) = token.take() {
                    lp = lp.continue_token(&t);
                }
                let page = api.list(&lp).await.map_err(classify)?;
                pages += 1;
                counter!("kube_list_pages_total", 1u64);
                let next = page.metadata.continue_.clone().filter(|t| !t.is_empty());
                for obj in page.items.iter() {
                    yield to_json(obj)?;
                }
                match next {
                    Some(t) => token = Some(t),
                    None => break,
                }
            }
            debug!(cluster = %cluster_id, kind = %kind, pages, "list complete");
        };
        Ok(Box::pin(stream))
    }

    async fn get(&self, cluster: &Cluster, key: &EntityKey) -> Result<Value, ClientError> {
        let client = self.client_for(cluster).await?;
        let api = dynamic_api(client, key.kind, key.namespace.as_deref());
        let obj = api.get(&key.name).await.map_err(classify)?;
        to_json(&obj)
    }

    async fn patch(&self, cluster: &Cluster, key: &EntityKey, partial: &Value) -> Result<Value, ClientError> {
        let client = self.client_for(cluster).await?;
        let api = dynamic_api(client, key.kind, key.namespace.as_deref());
        let pp = PatchParams::default();
        let obj = api.patch(&key.name, &pp, &Patch::Merge(partial)).await.map_err(classify)?;
        to_json(&obj)
    }

    async fn create(&self, cluster: &Cluster, kind: EntityKind, document: &Value) -> Result<Value, ClientError> {
        let client = self.client_for(cluster).await?;
        let obj: DynamicObject = serde_json::from_value(document.clone())
            .map_err(|e| ClientError::Malformed(format!("document is not a {}: {}", kind, e)))?;
        let ns = obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let api = dynamic_api(client, kind, Some(&ns));
        let created = api.create(&PostParams::default(), &obj).await.map_err(classify)?;
        to_json(&created)
    }

    async fn logs(
        &self,
        cluster: &Cluster,
        pod: &EntityKey,
        container: Option<&str>,
        opts: &LogOptions,
    ) -> Result<LineStream, ClientError> {
        let client = self.client_for(cluster).await?;
        let api: Api<Pod> = Api::namespaced(client, pod.namespace.as_deref().unwrap_or("default"));
        let lp = log_params(container, opts);
        let name = pod.name.clone();
        let cluster_id = cluster.id;
        counter!("kube_log_streams_total", 1u64);
        let stream = async_stream::try_stream! {
            let reader = api.log_stream(&name, &lp).await.map_err(classify)?;
            let mut lines = Box::pin(reader.lines());
            let mut read = 0u64;
            while let Some(line) = lines.next().await {
                let line = line.map_err(|e| ClientError::Network(format!("log stream: {}", e)))?;
                read += 1;
                yield line;
            }
            debug!(cluster = %cluster_id, pod = %name, lines = read, "log stream closed");
        };
        Ok(Box::pin(stream))
    }

    fn forget(&self, cluster: ClusterId) {
        if self.clients.lock().unwrap_or_else(|e| e.into_inner()).remove(&cluster).is_some() {
            debug!(cluster = %cluster, "kube client dropped");
        }
    }
}
