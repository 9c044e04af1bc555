//! One pass of "list a collection and feed it into the cache", shared by the
//! poller's refresh loop, on-demand refreshes and post-mutation follow-ups.

use std::time::Instant;

use cabin_core::{CabinError, CabinResult, ClientError, ClusterId, EntityKind, EntityRecord};
use cabin_kubehub::ClusterClient;
use futures::StreamExt;
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::{EntityCache, Registry};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub seen: usize,
    pub changed: usize,
    pub removed: usize,
    pub malformed: usize,
    /// Set when the listing broke off; records applied before the break stay cached.
    pub interrupted: Option<ClientError>,
}

impl RefreshOutcome {
    pub fn complete(&self) -> bool { self.interrupted.is_none() }
}

/// List `kind` on `cluster` and upsert records one at a time.
///
/// Entries missing from the listing are pruned only when it ran to completion
/// with every document keyable. Fails when the listing cannot start or the
/// cluster disappears mid-way.
pub async fn refresh_collection(
    client: &dyn ClusterClient,
    registry: &Registry,
    cache: &EntityCache,
    cluster_id: ClusterId,
    kind: EntityKind,
    namespace: Option<&str>,
    page_size: u32,
) -> CabinResult<RefreshOutcome> {
    let cluster = registry.get(cluster_id).ok_or(CabinError::ClusterNotFound(cluster_id))?;
    let started = Instant::now();
    let mut stream = client.list(&cluster, kind, namespace, page_size).await?;
    let mut out = RefreshOutcome::default();
    let mut seen: FxHashSet<_> = FxHashSet::default();

    while let Some(item) = stream.next().await {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => {
                warn!(cluster = %cluster_id, kind = %kind, error = %e, applied = out.seen, "refresh: listing interrupted");
                out.interrupted = Some(e);
                break;
            }
        };
        let rec = match EntityRecord::from_document(cluster_id, kind, raw) {
            Ok(r) => r,
            Err(e) => {
                out.malformed += 1;
                warn!(cluster = %cluster_id, kind = %kind, error = %e, "refresh: skipping malformed document");
                continue;
            }
        };
        out.seen += 1;
        seen.insert(rec.key.clone());
        match cache.upsert(rec) {
            Ok(true) => out.changed += 1,
            Ok(false) => {}
            Err(CabinError::ClusterNotFound(_)) => return Err(CabinError::ClusterRemoved(cluster_id)),
            Err(e) => return Err(e),
        }
    }

    if out.complete() && out.malformed == 0 {
        out.removed = cache.retain_listed(cluster_id, kind, namespace, &seen).len();
    }
    counter!("refresh_records_total", out.seen as u64);
    histogram!("refresh_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    if out.changed > 0 || out.removed > 0 {
        info!(
            cluster = %cluster_id,
            kind = %kind,
            ns = namespace.unwrap_or("*"),
            seen = out.seen,
            changed = out.changed,
            removed = out.removed,
            took_ms = %started.elapsed().as_millis(),
            "refresh: ok"
        );
    } else {
        debug!(cluster = %cluster_id, kind = %kind, seen = out.seen, "refresh: no changes");
    }
    Ok(out)
}
