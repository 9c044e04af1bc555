//! Cabin ops: the mutation coordinator.
//!
//! Every write goes through [`Coordinator::submit`]. Mutations on the same
//! entity run one at a time in submission order; label and scale changes are
//! previewed in the cache and either committed with the server's answer or
//! rolled back. Writes are attempted once and never retried.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cabin_bus::Bus;
use cabin_core::{
    CabinError, CabinResult, ClientError, Cluster, Document, EntityKey, EntityKind, EntityRecord, Event,
    MutationId, MutationKind, MutationStatus, Policy, PolicySource,
};
use cabin_kubehub::ClusterClient;
use cabin_store::{refresh_collection, Checkout, EntityCache, Registry};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

mod lanes;
mod plan;

pub use plan::{copy_document, Mutation};

use lanes::{Lanes, Ticket};
use plan::Plan;

/// A submitted mutation that has not resolved yet.
#[derive(Debug, Clone, Serialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub target: EntityKey,
    pub kind: MutationKind,
    /// Preview written to the cache while in flight, for optimistic kinds.
    pub optimistic_payload: Option<Document>,
    pub submitted_at: DateTime<Utc>,
    pub status: MutationStatus,
    /// False while queued behind an earlier mutation on the same key.
    pub in_flight: bool,
}

/// Terminal result of a confirmed mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub id: MutationId,
    pub kind: MutationKind,
    /// Entity the server confirmed; the destination for a cross-cluster copy.
    pub key: EntityKey,
    pub confirmed: EntityRecord,
    /// Whether the confirmed record is what the cache now holds.
    pub cached: bool,
}

pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    cache: Arc<EntityCache>,
    client: Arc<dyn ClusterClient>,
    policy: Arc<dyn PolicySource>,
    bus: Bus,
    lanes: Lanes,
    next_id: AtomicU64,
}

impl Coordinator {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<EntityCache>,
        client: Arc<dyn ClusterClient>,
        policy: Arc<dyn PolicySource>,
        bus: Bus,
    ) -> Self {
        let inner = Inner { registry, cache, client, policy, bus, lanes: Lanes::default(), next_id: AtomicU64::new(1) };
        Self { inner: Arc::new(inner) }
    }

    /// Queued and in-flight mutations for `key`, oldest first.
    pub fn pending(&self, key: &EntityKey) -> Vec<PendingMutation> { self.inner.lanes.pending(key) }

    /// Keys with at least one unresolved mutation.
    pub fn busy_keys(&self) -> usize { self.inner.lanes.len() }

    /// Validate, queue behind earlier mutations on the same key, then execute.
    ///
    /// Request-level validation failures return before an id is assigned and
    /// publish nothing. Anything that gets queued resolves with exactly one
    /// [`Event::MutationResolved`]. Once queued, the mutation runs on its own
    /// task: dropping the returned future stops the wait, not the write, and
    /// the preview is still committed or rolled back.
    pub async fn submit(&self, key: EntityKey, mutation: Mutation) -> CabinResult<MutationOutcome> {
        let inner = &self.inner;
        if !inner.registry.contains(key.cluster) {
            return Err(CabinError::ClusterNotFound(key.cluster));
        }
        mutation.validate(&key, &inner.policy.policy())?;

        let id = MutationId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = mutation.kind();
        let ticket = inner.lanes.join(PendingMutation {
            id,
            target: key.clone(),
            kind,
            optimistic_payload: None,
            submitted_at: Utc::now(),
            status: MutationStatus::Pending,
            in_flight: false,
        });
        let task = tokio::spawn(Arc::clone(inner).run(ticket, id, key.clone(), mutation));
        match task.await {
            Ok(result) => result,
            Err(e) => {
                counter!("mutation_failed_total", 1u64);
                let reason = format!("mutation task ended abnormally: {}", e);
                warn!(id = %id, key = %key, kind = %kind, error = %reason, "mutation: failed");
                inner.bus.publish(Event::MutationResolved {
                    id,
                    key,
                    kind,
                    status: MutationStatus::Failed,
                    reason: Some(reason.clone()),
                });
                Err(CabinError::MutationFailed { reason })
            }
        }
    }
}

impl Inner {
    async fn run(
        self: Arc<Self>,
        ticket: Ticket,
        id: MutationId,
        key: EntityKey,
        mutation: Mutation,
    ) -> CabinResult<MutationOutcome> {
        let kind = mutation.kind();
        ticket.turn().await;
        // Policy is read once the mutation reaches the head of its lane.
        let policy = self.policy.policy();
        let started = Instant::now();
        debug!(id = %id, key = %key, kind = %kind, "mutation: dispatch");

        let result = self.execute(id, &key, &mutation, &policy, |p| ticket.set_optimistic(p)).await;

        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("mutation_latency_ms", took_ms);
        let (status, reason) = match &result {
            Ok(out) => {
                counter!("mutation_ok_total", 1u64);
                info!(id = %id, key = %out.key, kind = %kind, rv = %out.confirmed.resource_version, took_ms = took_ms as u64, "mutation: confirmed");
                (MutationStatus::Confirmed, None)
            }
            Err(e) => {
                counter!("mutation_failed_total", 1u64);
                warn!(id = %id, key = %key, kind = %kind, error = %e, took_ms = took_ms as u64, "mutation: failed");
                (MutationStatus::Failed, Some(e.to_string()))
            }
        };
        self.bus.publish(Event::MutationResolved { id, key, kind, status, reason });
        result
    }

    async fn execute(
        &self,
        id: MutationId,
        key: &EntityKey,
        mutation: &Mutation,
        policy: &Policy,
        on_preview: impl FnOnce(Document),
    ) -> CabinResult<MutationOutcome> {
        let source = self.cache.get(key).ok_or_else(|| CabinError::EntityNotFound(key.to_string()))?;
        let plan = mutation.plan(&source)?;
        let cluster = self.registry.get(key.cluster).ok_or(CabinError::ClusterRemoved(key.cluster))?;
        let deadline = policy.mutation_timeout;

        let (dest, confirmed, cached) = match plan {
            Plan::Patch { partial } => {
                let checkout = if mutation.is_optimistic() {
                    let co = self.cache.apply_optimistic(key, |d| mutation.preview(d))?;
                    on_preview(co.applied.payload.clone());
                    Some(co)
                } else {
                    None
                };
                let sent = tokio::time::timeout(deadline, self.client.patch(&cluster, key, &partial)).await;
                let doc = self.settle(sent, deadline, &cluster, key, checkout.as_ref()).await?;
                let (rec, cached) = self.confirm(key, doc, checkout.as_ref())?;
                if let Mutation::Scale { .. } = mutation {
                    self.schedule_followup(key.clone(), policy.scale_followup_delay, policy.list_page_size);
                }
                (key.clone(), rec, cached)
            }
            Plan::Create { target, dest, document } => {
                let target_cluster = self.registry.get(target).ok_or(CabinError::ClusterNotFound(target))?;
                let sent =
                    tokio::time::timeout(deadline, self.client.create(&target_cluster, key.kind, &document)).await;
                let doc = self.settle(sent, deadline, &target_cluster, &dest, None).await?;
                let (rec, cached) = self.confirm(&dest, doc, None)?;
                (rec.key.clone(), rec, cached)
            }
        };
        Ok(MutationOutcome { id, kind: mutation.kind(), key: dest, confirmed, cached })
    }

    /// Turn a remote answer into a document or a terminal error, rolling back on failure.
    async fn settle(
        &self,
        sent: Result<Result<Value, ClientError>, tokio::time::error::Elapsed>,
        deadline: Duration,
        cluster: &Cluster,
        key: &EntityKey,
        checkout: Option<&Checkout>,
    ) -> CabinResult<Value> {
        let err = match sent {
            Ok(Ok(doc)) => return Ok(doc),
            Ok(Err(e)) => e,
            Err(_) => {
                self.revert(checkout);
                return Err(CabinError::MutationTimedOut(deadline));
            }
        };
        self.revert(checkout);
        match err {
            ClientError::Conflict(msg) => {
                self.force_refresh(cluster, key, deadline).await;
                Err(CabinError::MutationFailed { reason: format!("conflict: {}", msg) })
            }
            ClientError::Malformed(msg) => Err(CabinError::MalformedResponse(msg)),
            other => Err(CabinError::MutationFailed { reason: other.to_string() }),
        }
    }

    /// Key and cache the server-confirmed document.
    fn confirm(
        &self,
        expected: &EntityKey,
        doc: Value,
        checkout: Option<&Checkout>,
    ) -> CabinResult<(EntityRecord, bool)> {
        if !self.registry.contains(expected.cluster) {
            return Err(CabinError::ClusterRemoved(expected.cluster));
        }
        let rec = match EntityRecord::from_document(expected.cluster, expected.kind, doc) {
            Ok(r) if &r.key == expected => r,
            Ok(r) => {
                self.revert(checkout);
                return Err(CabinError::MalformedResponse(format!("server confirmed {} instead of {}", r.key, expected)));
            }
            Err(e) => {
                self.revert(checkout);
                return Err(e.into());
            }
        };
        let landed = match checkout {
            Some(co) => self.cache.commit(co, rec.clone()),
            None => self.cache.upsert(rec.clone()),
        };
        match landed {
            Ok(cached) => Ok((rec, cached)),
            Err(CabinError::ClusterNotFound(id)) => Err(CabinError::ClusterRemoved(id)),
            Err(e) => Err(e),
        }
    }

    fn revert(&self, checkout: Option<&Checkout>) {
        if let Some(co) = checkout {
            self.cache.rollback(co);
        }
    }

    /// Replace whatever the cache holds for `key` with the server's current state.
    async fn force_refresh(&self, cluster: &Cluster, key: &EntityKey, deadline: Duration) {
        match tokio::time::timeout(deadline, self.client.get(cluster, key)).await {
            Ok(Ok(doc)) => match EntityRecord::from_document(key.cluster, key.kind, doc) {
                Ok(rec) => {
                    let _ = self.cache.upsert(rec);
                }
                Err(e) => warn!(key = %key, error = %e, "mutation: forced refresh returned malformed data"),
            },
            Ok(Err(ClientError::NotFound(_))) => {
                self.cache.remove(key);
            }
            Ok(Err(e)) => warn!(key = %key, error = %e, "mutation: forced refresh failed"),
            Err(_) => warn!(key = %key, "mutation: forced refresh timed out"),
        }
    }

    /// Pick up eventually-consistent status after a scale. Failures only get logged.
    fn schedule_followup(&self, key: EntityKey, delay: Duration, page_size: u32) {
        let registry = Arc::clone(&self.registry);
        let cache = Arc::clone(&self.cache);
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(cluster) = registry.get(key.cluster) else { return };
            match client.get(&cluster, &key).await {
                Ok(doc) => match EntityRecord::from_document(key.cluster, key.kind, doc) {
                    Ok(rec) => {
                        let _ = cache.upsert(rec);
                    }
                    Err(e) => debug!(key = %key, error = %e, "scale follow-up: malformed entity"),
                },
                Err(e) => debug!(key = %key, error = %e, "scale follow-up: get failed"),
            }
            let ns = key.namespace.as_deref();
            if let Err(e) = refresh_collection(&*client, &registry, &cache, key.cluster, EntityKind::Pod, ns, page_size).await {
                debug!(key = %key, error = %e, "scale follow-up: pod refresh failed");
            }
        });
    }
}
