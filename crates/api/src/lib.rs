//! Cabin engine: one explicitly constructed instance of every component.
//!
//! [`Engine`] owns the bus, registry, cache, poller and mutation coordinator and
//! keeps their lifecycles paired: registering a cluster opens its cache
//! partition and starts its loops; removing it stops the loops, purges the
//! partition and drops the cached client.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use cabin_bus::{Bus, EventStream, SubscriptionHandle};
use cabin_core::{
    CabinError, CabinResult, Cluster, ClusterId, EntityKey, EntityKind, EntityRecord, Event, Policy, PolicySource,
    SharedPolicy, Topic, REVISION_ANNOTATION,
};
use cabin_kubehub::ClusterClient;
use cabin_ops::{Coordinator, MutationOutcome, PendingMutation};
use cabin_poller::Poller;
use cabin_store::{refresh_collection, EntityCache, RefreshOutcome, Registry};
use metrics::gauge;
use serde::Serialize;
use tracing::{debug, info};

pub use cabin_core::NewCluster;
pub use cabin_kubehub::{LineStream, LogOptions};
pub use cabin_ops::Mutation;

/// One rollout step of a deployment, backed by the ReplicaSet it created.
#[derive(Debug, Clone)]
pub struct Revision {
    pub revision: u64,
    pub replica_set: Arc<EntityRecord>,
}

impl Revision {
    pub fn images(&self) -> Vec<String> {
        self.replica_set
            .payload
            .template_containers()
            .iter()
            .filter_map(|c| c.get("image").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect()
    }
}

/// Result of probing one cluster from [`Engine::check_clusters`].
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub cluster: ClusterId,
    pub name: String,
    pub reachable: Option<bool>,
    pub error: Option<String>,
}

pub struct Engine {
    bus: Bus,
    registry: Arc<Registry>,
    cache: Arc<EntityCache>,
    client: Arc<dyn ClusterClient>,
    policy: Arc<SharedPolicy>,
    poller: Poller,
    coordinator: Coordinator,
}

impl Engine {
    pub fn new(client: Arc<dyn ClusterClient>, policy: Arc<SharedPolicy>) -> Self {
        let bus = Bus::new();
        let registry = Arc::new(Registry::new(bus.clone()));
        let cache = Arc::new(EntityCache::new(bus.clone()));
        let source: Arc<dyn PolicySource> = policy.clone();
        let poller = Poller::new(registry.clone(), cache.clone(), client.clone(), source.clone());
        let coordinator = Coordinator::new(registry.clone(), cache.clone(), client.clone(), source, bus.clone());
        Self { bus, registry, cache, client, policy, poller, coordinator }
    }

    pub fn bus(&self) -> &Bus { &self.bus }

    pub fn policy(&self) -> Arc<Policy> { self.policy.policy() }

    // ---- clusters ----

    /// Register an endpoint, open its cache partition and start its loops.
    /// Must be called from within a Tokio runtime.
    pub fn register_cluster(&self, req: NewCluster) -> CabinResult<ClusterId> {
        let url = req.url.clone();
        let id = self.registry.register(req)?;
        self.cache.attach(id);
        if let Err(e) = self.poller.start(id) {
            // Lost a race with a concurrent removal; leave nothing behind.
            self.cache.purge_cluster(id);
            return Err(e);
        }
        gauge!("clusters_registered", self.registry.len() as f64);
        info!(cluster = %id, url = %url, "engine: cluster registered");
        Ok(id)
    }

    /// Remove a cluster together with its cached entities and scheduled loops.
    /// In-flight mutations are left to resolve; their confirmations are dropped.
    pub fn remove_cluster(&self, id: ClusterId) -> CabinResult<Cluster> {
        let cluster = self.registry.remove(id)?;
        self.poller.stop(id);
        let purged = self.cache.purge_cluster(id);
        self.client.forget(id);
        gauge!("clusters_registered", self.registry.len() as f64);
        info!(cluster = %id, purged, "engine: cluster removed");
        Ok(cluster)
    }

    pub fn rename_cluster(&self, id: ClusterId, name: &str) -> CabinResult<()> { self.registry.rename(id, name) }

    /// Registered clusters in registration order.
    pub fn clusters(&self) -> Vec<Cluster> { self.registry.list() }

    pub fn cluster(&self, id: ClusterId) -> Option<Cluster> { self.registry.get(id) }

    /// Probe every registered cluster once, concurrently, and record the results.
    pub async fn check_clusters(&self) -> Vec<ProbeReport> {
        let t0 = Instant::now();
        let clusters = self.registry.list();
        let probes = clusters.iter().map(|c| self.poller.probe_once(c.id));
        let results = futures::future::join_all(probes).await;
        let reports: Vec<ProbeReport> = clusters
            .into_iter()
            .zip(results)
            .map(|(c, r)| match r {
                Ok(ok) => ProbeReport { cluster: c.id, name: c.name, reachable: Some(ok), error: None },
                Err(e) => ProbeReport { cluster: c.id, name: c.name, reachable: None, error: Some(e.to_string()) },
            })
            .collect();
        let up = reports.iter().filter(|r| r.reachable == Some(true)).count();
        info!(clusters = reports.len(), up, took_ms = %t0.elapsed().as_millis(), "engine: clusters checked");
        reports
    }

    // ---- entities ----

    pub fn entity(&self, key: &EntityKey) -> Option<Arc<EntityRecord>> { self.cache.get(key) }

    /// Cached entities of one kind, optionally limited to a namespace.
    pub fn query(
        &self,
        cluster: ClusterId,
        kind: EntityKind,
        namespace: Option<&str>,
    ) -> CabinResult<Vec<Arc<EntityRecord>>> {
        if !self.registry.contains(cluster) {
            return Err(CabinError::ClusterNotFound(cluster));
        }
        Ok(self.cache.query(cluster, kind, namespace))
    }

    /// List a collection now and wait for it to land in the cache.
    pub async fn refresh(
        &self,
        cluster: ClusterId,
        kind: EntityKind,
        namespace: Option<&str>,
    ) -> CabinResult<RefreshOutcome> {
        let page_size = self.policy.policy().list_page_size;
        refresh_collection(&*self.client, &self.registry, &self.cache, cluster, kind, namespace, page_size).await
    }

    /// Queue a refresh on the cluster's refresh loop without waiting for it.
    pub fn request_refresh(&self, cluster: ClusterId, kind: EntityKind, namespace: Option<&str>) -> CabinResult<()> {
        self.poller.trigger(cluster, kind, namespace)
    }

    /// Cached ReplicaSets owned by a deployment, newest revision first.
    pub fn deployment_history(&self, key: &EntityKey) -> CabinResult<Vec<Revision>> {
        if key.kind != EntityKind::Deployment {
            return Err(CabinError::InvalidArgument(format!("{} has no rollout history", key.kind)));
        }
        if self.cache.get(key).is_none() {
            return Err(CabinError::EntityNotFound(key.to_string()));
        }
        let owned = self
            .cache
            .query(key.cluster, EntityKind::ReplicaSet, key.namespace.as_deref())
            .into_iter()
            .filter(|rs| rs.payload.is_owned_by("Deployment", &key.name));
        let mut revisions: Vec<Revision> = Vec::new();
        for rs in owned {
            match rs.payload.annotation(REVISION_ANNOTATION).and_then(|s| s.trim().parse::<u64>().ok()) {
                Some(revision) => revisions.push(Revision { revision, replica_set: rs }),
                None => debug!(rs = %rs.key, "engine: replica set without revision skipped"),
            }
        }
        revisions.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(revisions)
    }

    /// Stream a pod container's log straight from the cluster.
    ///
    /// When the pod is cached, the container name is checked against it and
    /// must be given for multi-container pods.
    pub async fn logs(&self, pod: &EntityKey, container: Option<&str>, opts: &LogOptions) -> CabinResult<LineStream> {
        if pod.kind != EntityKind::Pod {
            return Err(CabinError::InvalidArgument(format!("{} has no logs", pod.kind)));
        }
        let cluster = self.registry.get(pod.cluster).ok_or(CabinError::ClusterNotFound(pod.cluster))?;
        if let Some(rec) = self.cache.get(pod) {
            let names = rec.payload.container_names();
            match container {
                Some(c) if !names.is_empty() && !names.contains(&c) => {
                    return Err(CabinError::InvalidArgument(format!("pod {} has no container {}", pod.name, c)));
                }
                None if names.len() > 1 => {
                    return Err(CabinError::InvalidArgument(format!(
                        "pod {} has {} containers; name one of {}",
                        pod.name,
                        names.len(),
                        names.join(", ")
                    )));
                }
                _ => {}
            }
        }
        debug!(pod = %pod, container = ?container, follow = opts.follow, "engine: opening log stream");
        Ok(self.client.logs(&cluster, pod, container, opts).await?)
    }

    // ---- mutations ----

    pub async fn submit(&self, key: EntityKey, mutation: Mutation) -> CabinResult<MutationOutcome> {
        self.coordinator.submit(key, mutation).await
    }

    pub fn pending(&self, key: &EntityKey) -> Vec<PendingMutation> { self.coordinator.pending(key) }

    // ---- notifications ----

    pub fn subscribe(&self, topic: Topic, cb: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionHandle {
        self.bus.subscribe(topic, cb)
    }

    pub fn events(&self, topic: Topic) -> EventStream { self.bus.stream(topic) }

    // ---- settings ----

    /// Takes effect for mutations that reach the head of their queue afterwards.
    pub fn update_max_replicas(&self, max: u32) -> CabinResult<()> {
        self.policy.set_max_replicas(max)?;
        info!(max, "engine: max replicas updated");
        Ok(())
    }

    /// Kinds listed by the periodic refresh loop from its next cycle on.
    pub fn update_refresh_kinds(&self, kinds: Vec<EntityKind>) -> CabinResult<()> {
        self.policy.set_refresh_kinds(kinds)?;
        info!(kinds = ?self.policy.policy().refresh_kinds, "engine: refresh kinds updated");
        Ok(())
    }

    /// Cancel every poll loop. Registered clusters and cached entities stay readable.
    pub fn shutdown(&self) {
        let scheduled = self.poller.task_count();
        self.poller.shutdown();
        info!(tasks = scheduled, "engine: poll loops cancelled");
    }

    /// Live poll-loop tasks across all clusters.
    pub fn task_count(&self) -> usize { self.poller.task_count() }

    pub fn cached_count(&self, cluster: ClusterId) -> usize { self.cache.count(cluster) }
}

impl Drop for Engine {
    fn drop(&mut self) { self.poller.shutdown(); }
}
