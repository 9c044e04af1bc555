//! Per-cluster, per-kind keyed store of fetched entities.
//!
//! Records are immutable `Arc`s; an upsert swaps the whole record, so a reader
//! holding one never observes a half-written payload. Each kind in a partition
//! has its own lock, letting refreshes of different collections run in parallel.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cabin_bus::Bus;
use cabin_core::{CabinError, CabinResult, ClusterId, Document, EntityKey, EntityKind, EntityRecord, Event};
use chrono::Utc;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

type Slot = (Option<String>, String);
type Collection = RwLock<BTreeMap<Slot, Arc<EntityRecord>>>;

struct Partition {
    kinds: FxHashMap<EntityKind, Collection>,
}

impl Partition {
    fn new() -> Self {
        Self { kinds: EntityKind::ALL.iter().map(|k| (*k, RwLock::new(BTreeMap::new()))).collect() }
    }

    fn collection(&self, kind: EntityKind) -> &Collection {
        // Every kind is allocated up front in `new`.
        &self.kinds[&kind]
    }
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> { l.read().unwrap_or_else(|e| e.into_inner()) }
fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> { l.write().unwrap_or_else(|e| e.into_inner()) }

fn slot(key: &EntityKey) -> Slot { (key.namespace.clone(), key.name.clone()) }

/// Transient writable view handed to the mutation coordinator.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub key: EntityKey,
    /// Pre-mutation record; restored verbatim on rollback.
    pub previous: Arc<EntityRecord>,
    pub applied: Arc<EntityRecord>,
}

pub struct EntityCache {
    parts: RwLock<FxHashMap<ClusterId, Partition>>,
    bus: Bus,
}

impl EntityCache {
    pub fn new(bus: Bus) -> Self { Self { parts: RwLock::new(FxHashMap::default()), bus } }

    /// Open an empty partition for a newly registered cluster.
    pub fn attach(&self, cluster: ClusterId) {
        write(&self.parts).entry(cluster).or_insert_with(Partition::new);
    }

    pub fn has_cluster(&self, cluster: ClusterId) -> bool { read(&self.parts).contains_key(&cluster) }

    /// Drop the partition and everything in it. No per-entity events are emitted.
    pub fn purge_cluster(&self, cluster: ClusterId) -> usize {
        let Some(part) = write(&self.parts).remove(&cluster) else { return 0 };
        let n: usize = part.kinds.values().map(|c| read(c).len()).sum();
        debug!(cluster = %cluster, records = n, "cache: partition purged");
        n
    }

    fn with_collection<T>(
        &self,
        cluster: ClusterId,
        kind: EntityKind,
        f: impl FnOnce(&Collection) -> T,
    ) -> CabinResult<T> {
        let parts = read(&self.parts);
        let part = parts.get(&cluster).ok_or(CabinError::ClusterNotFound(cluster))?;
        Ok(f(part.collection(kind)))
    }

    /// Store `rec` if its version is newer than the cached one. Returns whether anything changed.
    pub fn upsert(&self, rec: EntityRecord) -> CabinResult<bool> {
        let key = rec.key.clone();
        let incoming = rec.resource_version;
        let changed = self.with_collection(key.cluster, key.kind, |col| {
            let mut map = write(col);
            let s = slot(&key);
            match map.get(&s) {
                Some(cur) if cur.resource_version >= incoming => false,
                _ => {
                    map.insert(s, Arc::new(rec));
                    true
                }
            }
        })?;
        if changed {
            counter!("cache_upserts_total", 1u64);
            trace!(key = %key, rv = %incoming, "cache: upsert");
            self.bus.publish(Event::EntityChanged { key });
        } else {
            counter!("cache_stale_dropped_total", 1u64);
            trace!(key = %key, rv = %incoming, "cache: stale record dropped");
        }
        Ok(changed)
    }

    pub fn get(&self, key: &EntityKey) -> Option<Arc<EntityRecord>> {
        self.with_collection(key.cluster, key.kind, |col| read(col).get(&slot(key)).cloned()).ok().flatten()
    }

    /// Point-in-time snapshot of one collection, ordered by namespace then name.
    pub fn query(&self, cluster: ClusterId, kind: EntityKind, namespace: Option<&str>) -> Vec<Arc<EntityRecord>> {
        self.with_collection(cluster, kind, |col| {
            read(col)
                .values()
                .filter(|r| namespace.map_or(true, |ns| r.key.namespace.as_deref() == Some(ns)))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn count(&self, cluster: ClusterId) -> usize {
        read(&self.parts)
            .get(&cluster)
            .map(|p| p.kinds.values().map(|c| read(c).len()).sum())
            .unwrap_or(0)
    }

    pub fn remove(&self, key: &EntityKey) -> bool {
        let gone = self
            .with_collection(key.cluster, key.kind, |col| write(col).remove(&slot(key)).is_some())
            .unwrap_or(false);
        if gone {
            self.bus.publish(Event::EntityRemoved { key: key.clone() });
        }
        gone
    }

    /// Drop cached entries of a collection that a complete listing did not return.
    pub fn retain_listed(
        &self,
        cluster: ClusterId,
        kind: EntityKind,
        namespace: Option<&str>,
        seen: &FxHashSet<EntityKey>,
    ) -> Vec<EntityKey> {
        let removed: Vec<EntityKey> = self
            .with_collection(cluster, kind, |col| {
                let mut map = write(col);
                let doomed: Vec<Slot> = map
                    .iter()
                    .filter(|(_, r)| namespace.map_or(true, |ns| r.key.namespace.as_deref() == Some(ns)))
                    .filter(|(_, r)| !seen.contains(&r.key))
                    .map(|(s, _)| s.clone())
                    .collect();
                doomed.into_iter().filter_map(|s| map.remove(&s)).map(|r| r.key.clone()).collect()
            })
            .unwrap_or_default();
        for key in &removed {
            debug!(key = %key, "cache: pruned");
            self.bus.publish(Event::EntityRemoved { key: key.clone() });
        }
        removed
    }

    /// Replace the cached payload with `patch(previous)`, keeping the version.
    pub fn apply_optimistic(&self, key: &EntityKey, patch: impl FnOnce(&Document) -> Document) -> CabinResult<Checkout> {
        let checkout = self.with_collection(key.cluster, key.kind, |col| {
            let mut map = write(col);
            let s = slot(key);
            let previous = map.get(&s).cloned().ok_or_else(|| CabinError::EntityNotFound(key.to_string()))?;
            let applied = Arc::new(EntityRecord {
                key: previous.key.clone(),
                resource_version: previous.resource_version,
                payload: patch(&previous.payload),
                fetched_at: Utc::now(),
            });
            map.insert(s, Arc::clone(&applied));
            Ok::<_, CabinError>(Checkout { key: key.clone(), previous, applied })
        })??;
        self.bus.publish(Event::EntityChanged { key: key.clone() });
        Ok(checkout)
    }

    /// Land a server-confirmed record for an optimistic checkout.
    ///
    /// While the optimistic record is still current it is replaced by `confirmed`,
    /// or by the pre-mutation record when the confirmation is not newer than it.
    /// Once something else has replaced the optimistic record, plain upsert rules
    /// apply. Returns whether the confirmed record is now cached.
    pub fn commit(&self, checkout: &Checkout, confirmed: EntityRecord) -> CabinResult<bool> {
        let key = checkout.key.clone();
        let (landed, changed) = self.with_collection(key.cluster, key.kind, |col| {
            let mut map = write(col);
            let s = slot(&key);
            let ours = map.get(&s).map_or(false, |cur| Arc::ptr_eq(cur, &checkout.applied));
            let newer_than = match map.get(&s) {
                Some(_) if ours => checkout.previous.resource_version,
                Some(cur) => cur.resource_version,
                None => {
                    map.insert(s, Arc::new(confirmed));
                    return (true, true);
                }
            };
            if confirmed.resource_version > newer_than {
                map.insert(s, Arc::new(confirmed));
                (true, true)
            } else if ours {
                map.insert(s, Arc::clone(&checkout.previous));
                (false, true)
            } else {
                (false, false)
            }
        })?;
        if !landed {
            counter!("cache_stale_dropped_total", 1u64);
            debug!(key = %key, "cache: stale confirmation dropped");
        }
        if changed {
            self.bus.publish(Event::EntityChanged { key });
        }
        Ok(landed)
    }

    /// Restore the pre-mutation record if the optimistic one is still current.
    /// A newer record that landed in the meantime is left alone.
    pub fn rollback(&self, checkout: &Checkout) -> bool {
        let restored = self
            .with_collection(checkout.key.cluster, checkout.key.kind, |col| {
                let mut map = write(col);
                let s = slot(&checkout.key);
                match map.get(&s) {
                    Some(cur) if Arc::ptr_eq(cur, &checkout.applied) => {
                        map.insert(s, Arc::clone(&checkout.previous));
                        true
                    }
                    _ => false,
                }
            })
            .unwrap_or(false);
        if restored {
            debug!(key = %checkout.key, "cache: optimistic state rolled back");
            self.bus.publish(Event::EntityChanged { key: checkout.key.clone() });
        }
        restored
    }
}
