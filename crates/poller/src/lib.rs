//! Cabin poller: two cancellable loops per registered cluster.
//!
//! The health loop probes on a fixed interval and drives the registry's
//! reachability flag. The refresh loop lists the configured kinds while the
//! cluster is reachable and serves on-demand refresh requests at any time.
//! Failures are logged and retried on the next tick; nothing here escalates.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cabin_core::{CabinError, CabinResult, Cluster, ClusterId, EntityKind, PolicySource};
use cabin_kubehub::ClusterClient;
use cabin_store::{refresh_collection, EntityCache, Registry};
use chrono::Utc;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// On-demand refresh of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub kind: EntityKind,
    pub namespace: Option<String>,
}

struct ClusterTasks {
    token: CancellationToken,
    health: JoinHandle<()>,
    refresh: JoinHandle<()>,
    requests: mpsc::UnboundedSender<RefreshRequest>,
}

impl ClusterTasks {
    fn cancel(self) {
        self.token.cancel();
        self.health.abort();
        self.refresh.abort();
    }

    fn live(&self) -> usize { [&self.health, &self.refresh].iter().filter(|h| !h.is_finished()).count() }
}

#[derive(Clone)]
struct Shared {
    registry: Arc<Registry>,
    cache: Arc<EntityCache>,
    client: Arc<dyn ClusterClient>,
    policy: Arc<dyn PolicySource>,
}

pub struct Poller {
    shared: Shared,
    tasks: Mutex<FxHashMap<ClusterId, ClusterTasks>>,
}

impl Poller {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<EntityCache>,
        client: Arc<dyn ClusterClient>,
        policy: Arc<dyn PolicySource>,
    ) -> Self {
        Self { shared: Shared { registry, cache, client, policy }, tasks: Mutex::new(FxHashMap::default()) }
    }

    fn tasks(&self) -> MutexGuard<'_, FxHashMap<ClusterId, ClusterTasks>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn both loops for a registered cluster. Starting twice is a no-op.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, id: ClusterId) -> CabinResult<()> {
        if !self.shared.registry.contains(id) {
            return Err(CabinError::ClusterNotFound(id));
        }
        let mut tasks = self.tasks();
        if tasks.contains_key(&id) {
            return Ok(());
        }
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let health = tokio::spawn(health_loop(self.shared.clone(), id, token.child_token()));
        let refresh = tokio::spawn(refresh_loop(self.shared.clone(), id, token.child_token(), rx));
        tasks.insert(id, ClusterTasks { token, health, refresh, requests: tx });
        info!(cluster = %id, "poller: started");
        Ok(())
    }

    /// Cancel both loops. Returns whether anything was scheduled.
    pub fn stop(&self, id: ClusterId) -> bool {
        let Some(t) = self.tasks().remove(&id) else { return false };
        t.cancel();
        info!(cluster = %id, "poller: stopped");
        true
    }

    pub fn is_scheduled(&self, id: ClusterId) -> bool { self.tasks().contains_key(&id) }

    /// Live loop tasks across all clusters.
    pub fn task_count(&self) -> usize { self.tasks().values().map(|t| t.live()).sum() }

    /// Ask the refresh loop of `id` to list a collection now.
    pub fn trigger(&self, id: ClusterId, kind: EntityKind, namespace: Option<&str>) -> CabinResult<()> {
        let tasks = self.tasks();
        let t = tasks.get(&id).ok_or(CabinError::ClusterNotFound(id))?;
        t.requests
            .send(RefreshRequest { kind, namespace: namespace.map(|s| s.to_string()) })
            .map_err(|_| CabinError::ClusterRemoved(id))
    }

    /// Probe once outside the schedule and record the result directly.
    pub async fn probe_once(&self, id: ClusterId) -> CabinResult<bool> {
        let cluster = self.shared.registry.get(id).ok_or(CabinError::ClusterNotFound(id))?;
        let timeout = self.shared.policy.policy().probe_timeout;
        let ok = probe(&*self.shared.client, &cluster, timeout).await;
        self.shared.registry.set_reachability(id, ok, Utc::now())?;
        Ok(ok)
    }

    pub fn shutdown(&self) {
        let drained: Vec<_> = self.tasks().drain().collect();
        for (id, t) in drained {
            debug!(cluster = %id, "poller: shutdown");
            t.cancel();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) { self.shutdown(); }
}

async fn probe(client: &dyn ClusterClient, cluster: &Cluster, timeout: Duration) -> bool {
    counter!("poll_probe_total", 1u64);
    let ok = match tokio::time::timeout(timeout, client.probe(cluster)).await {
        Ok(ok) => ok,
        Err(_) => {
            debug!(cluster = %cluster.id, timeout_ms = timeout.as_millis() as u64, "poller: probe timed out");
            false
        }
    };
    if !ok {
        counter!("poll_probe_failed_total", 1u64);
    }
    ok
}

async fn health_loop(sh: Shared, id: ClusterId, token: CancellationToken) {
    let mut failures: u32 = 0;
    loop {
        let policy = sh.policy.policy();
        let Some(cluster) = sh.registry.get(id) else { break };
        let ok = tokio::select! {
            _ = token.cancelled() => break,
            ok = probe(&*sh.client, &cluster, policy.probe_timeout) => ok,
        };
        let now = Utc::now();
        let recorded = if ok {
            if failures > 0 {
                debug!(cluster = %id, after = failures, "poller: probe recovered");
            }
            failures = 0;
            sh.registry.set_reachability(id, true, now)
        } else {
            failures = failures.saturating_add(1);
            if failures >= policy.failure_threshold {
                if failures == policy.failure_threshold {
                    warn!(cluster = %id, failures, "poller: cluster unreachable");
                }
                sh.registry.set_reachability(id, false, now)
            } else {
                debug!(cluster = %id, failures, "poller: probe failed");
                sh.registry.touch(id, now).map(|_| false)
            }
        };
        if recorded.is_err() {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(policy.health_interval) => {}
        }
    }
    debug!(cluster = %id, "poller: health loop exited");
}

async fn refresh_loop(
    sh: Shared,
    id: ClusterId,
    token: CancellationToken,
    mut requests: mpsc::UnboundedReceiver<RefreshRequest>,
) {
    let mut next_tick = Instant::now();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            req = requests.recv() => {
                let Some(req) = req else { break };
                let page = sh.policy.policy().list_page_size;
                run_refresh(&sh, id, req.kind, req.namespace.as_deref(), page).await;
            }
            _ = sleep_until(next_tick) => {
                let policy = sh.policy.policy();
                next_tick = Instant::now() + policy.refresh_interval;
                match sh.registry.get(id) {
                    None => break,
                    Some(c) if !c.reachable => {
                        debug!(cluster = %id, "poller: skipping periodic refresh while unreachable");
                        continue;
                    }
                    Some(_) => {}
                }
                for kind in policy.refresh_kinds.iter().copied() {
                    if !run_refresh(&sh, id, kind, None, policy.list_page_size).await {
                        break;
                    }
                }
            }
        }
    }
    debug!(cluster = %id, "poller: refresh loop exited");
}

/// Returns false when further refreshes of this cluster are pointless this cycle.
async fn run_refresh(sh: &Shared, id: ClusterId, kind: EntityKind, namespace: Option<&str>, page: u32) -> bool {
    match refresh_collection(&*sh.client, &sh.registry, &sh.cache, id, kind, namespace, page).await {
        Ok(out) => {
            if let Some(e) = out.interrupted {
                counter!("poll_refresh_failed_total", 1u64);
                debug!(cluster = %id, kind = %kind, error = %e, "poller: partial refresh");
            }
            true
        }
        Err(CabinError::ClusterNotFound(_)) | Err(CabinError::ClusterRemoved(_)) => false,
        Err(e) => {
            counter!("poll_refresh_failed_total", 1u64);
            warn!(cluster = %id, kind = %kind, error = %e, "poller: refresh failed");
            true
        }
    }
}
