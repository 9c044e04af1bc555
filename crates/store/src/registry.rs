//! Registered cluster endpoints and their last-known health.
//!
//! Readers load an immutable snapshot; writers serialize on a small lock and
//! swap in a new one. Events are published after the swap so a subscriber that
//! reads the registry from its callback sees the change.

use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use cabin_bus::Bus;
use cabin_core::{normalize_url, CabinError, CabinResult, Cluster, ClusterId, Event, NewCluster};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

pub struct Registry {
    snap: ArcSwap<Vec<Cluster>>,
    writer: Mutex<()>,
    bus: Bus,
}

impl Registry {
    pub fn new(bus: Bus) -> Self {
        Self { snap: ArcSwap::from_pointee(Vec::new()), writer: Mutex::new(()), bus }
    }

    fn write(&self) -> MutexGuard<'_, ()> { self.writer.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Swap in an edited copy of the cluster list. `f` returns `Ok(None)` for "no change".
    fn edit<T>(&self, f: impl FnOnce(&mut Vec<Cluster>) -> CabinResult<Option<T>>) -> CabinResult<Option<T>> {
        let _w = self.write();
        let mut next = (**self.snap.load()).clone();
        let out = f(&mut next)?;
        if out.is_some() {
            self.snap.store(Arc::new(next));
        }
        Ok(out)
    }

    pub fn register(&self, req: NewCluster) -> CabinResult<ClusterId> {
        let url = req.url.trim().to_string();
        if url.is_empty() {
            return Err(CabinError::InvalidArgument("cluster url must not be empty".into()));
        }
        let norm = normalize_url(&url);
        let id = self
            .edit(|list| {
                if list.iter().any(|c| normalize_url(&c.url) == norm) {
                    return Err(CabinError::DuplicateCluster(url.clone()));
                }
                let id = ClusterId::new();
                list.push(Cluster {
                    id,
                    name: if req.name.trim().is_empty() { url.clone() } else { req.name.clone() },
                    url: url.clone(),
                    credentials_ref: req.credentials_ref.clone(),
                    reachable: true,
                    last_checked_at: None,
                });
                Ok(Some(id))
            })?
            .ok_or_else(|| CabinError::InvalidArgument("registration produced no cluster".into()))?;
        info!(cluster = %id, url = %url, "registry: cluster registered");
        self.bus.publish(Event::ClusterRegistered { cluster: id });
        Ok(id)
    }

    /// Drop the registry entry only. Cascading to cache and poller is the caller's job.
    pub fn remove(&self, id: ClusterId) -> CabinResult<Cluster> {
        let removed = self
            .edit(|list| {
                let idx = list.iter().position(|c| c.id == id).ok_or(CabinError::ClusterNotFound(id))?;
                Ok(Some(list.remove(idx)))
            })?
            .ok_or(CabinError::ClusterNotFound(id))?;
        info!(cluster = %id, url = %removed.url, "registry: cluster removed");
        self.bus.publish(Event::ClusterRemoved { cluster: id });
        Ok(removed)
    }

    pub fn rename(&self, id: ClusterId, name: &str) -> CabinResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CabinError::InvalidArgument("cluster name must not be empty".into()));
        }
        let changed = self.edit(|list| {
            let c = list.iter_mut().find(|c| c.id == id).ok_or(CabinError::ClusterNotFound(id))?;
            if c.name == name {
                return Ok(None);
            }
            c.name = name.to_string();
            Ok(Some(()))
        })?;
        if changed.is_some() {
            self.bus.publish(Event::ClusterUpdated { cluster: id });
        }
        Ok(())
    }

    /// Record a probe result. Returns whether reachability flipped; only a flip emits an event.
    pub fn set_reachability(&self, id: ClusterId, reachable: bool, at: DateTime<Utc>) -> CabinResult<bool> {
        let flipped = self
            .edit(|list| {
                let c = list.iter_mut().find(|c| c.id == id).ok_or(CabinError::ClusterNotFound(id))?;
                let flipped = c.reachable != reachable;
                c.reachable = reachable;
                c.last_checked_at = Some(at);
                Ok(Some(flipped))
            })?
            .unwrap_or(false);
        if flipped {
            info!(cluster = %id, reachable, "registry: reachability changed");
            self.bus.publish(Event::ClusterReachabilityChanged { cluster: id, reachable });
        } else {
            debug!(cluster = %id, reachable, "registry: reachability unchanged");
        }
        Ok(flipped)
    }

    /// Stamp `last_checked_at` without touching reachability.
    pub fn touch(&self, id: ClusterId, at: DateTime<Utc>) -> CabinResult<()> {
        self.edit(|list| {
            let c = list.iter_mut().find(|c| c.id == id).ok_or(CabinError::ClusterNotFound(id))?;
            c.last_checked_at = Some(at);
            Ok(Some(()))
        })?;
        Ok(())
    }

    /// Insertion order.
    pub fn list(&self) -> Vec<Cluster> { (**self.snap.load()).clone() }

    pub fn get(&self, id: ClusterId) -> Option<Cluster> { self.snap.load().iter().find(|c| c.id == id).cloned() }

    pub fn contains(&self, id: ClusterId) -> bool { self.snap.load().iter().any(|c| c.id == id) }

    pub fn len(&self) -> usize { self.snap.load().len() }

    pub fn is_empty(&self) -> bool { self.snap.load().is_empty() }
}
