//! Per-entity FIFO lanes. A ticket's turn comes when it heads its lane's
//! queue; the lane is torn down when its last ticket drops.

use std::sync::{Arc, Mutex, MutexGuard};

use cabin_core::{Document, EntityKey, MutationId};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::PendingMutation;

struct Lane {
    advanced: Arc<Notify>,
    queue: Vec<PendingMutation>,
}

#[derive(Clone, Default)]
pub(crate) struct Lanes {
    inner: Arc<Mutex<FxHashMap<EntityKey, Lane>>>,
}

impl Lanes {
    fn lock(&self) -> MutexGuard<'_, FxHashMap<EntityKey, Lane>> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Queue position is fixed here, not when the ticket is first awaited.
    pub(crate) fn join(&self, pm: PendingMutation) -> Ticket {
        let key = pm.target.clone();
        let id = pm.id;
        let mut map = self.lock();
        let lane = map
            .entry(key.clone())
            .or_insert_with(|| Lane { advanced: Arc::new(Notify::new()), queue: Vec::new() });
        lane.queue.push(pm);
        Ticket { lanes: self.clone(), key, id, advanced: Arc::clone(&lane.advanced) }
    }

    pub(crate) fn pending(&self, key: &EntityKey) -> Vec<PendingMutation> {
        self.lock().get(key).map(|l| l.queue.clone()).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize { self.lock().len() }

    fn update(&self, key: &EntityKey, id: MutationId, f: impl FnOnce(&mut PendingMutation)) {
        if let Some(pm) = self.lock().get_mut(key).and_then(|l| l.queue.iter_mut().find(|p| p.id == id)) {
            f(pm);
        }
    }

    /// Marks `id` in flight if it heads its lane.
    fn claim_head(&self, key: &EntityKey, id: MutationId) -> bool {
        let mut map = self.lock();
        match map.get_mut(key).and_then(|l| l.queue.first_mut()) {
            Some(head) if head.id == id => {
                head.in_flight = true;
                true
            }
            _ => false,
        }
    }

    fn leave(&self, key: &EntityKey, id: MutationId) {
        let mut map = self.lock();
        if let Some(lane) = map.get_mut(key) {
            lane.queue.retain(|p| p.id != id);
            if lane.queue.is_empty() {
                map.remove(key);
            } else {
                lane.advanced.notify_waiters();
            }
        }
    }
}

/// A queued mutation's place in its lane. Owned, so it can travel into a task.
pub(crate) struct Ticket {
    lanes: Lanes,
    key: EntityKey,
    id: MutationId,
    advanced: Arc<Notify>,
}

impl Ticket {
    /// Wait until every earlier mutation on this key has resolved.
    pub(crate) async fn turn(&self) {
        loop {
            // Registered before the check, so a leave in between is not missed.
            let advanced = self.advanced.notified();
            if self.lanes.claim_head(&self.key, self.id) {
                return;
            }
            advanced.await;
        }
    }

    pub(crate) fn set_optimistic(&self, payload: Document) {
        self.lanes.update(&self.key, self.id, |p| p.optimistic_payload = Some(payload));
    }
}

impl Drop for Ticket {
    fn drop(&mut self) { self.lanes.leave(&self.key, self.id); }
}
