//! Cabin notification bus: pure fan-out of [`Event`]s to topic subscribers.
//!
//! Delivery is at-most-once with no replay. Events are delivered in one global
//! publish order: whichever publisher finds the bus idle drains the queue, and a
//! publish issued from inside a callback is queued behind the event being delivered.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use arc_swap::ArcSwap;
use cabin_core::{Event, Topic};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    topic: Topic,
    cb: Callback,
}

#[derive(Default)]
struct Queue {
    events: VecDeque<Event>,
    draining: bool,
}

struct Inner {
    subs: ArcSwap<Vec<Arc<Subscriber>>>,
    queue: Mutex<Queue>,
    next_id: AtomicU64,
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, Queue> { self.queue.lock().unwrap_or_else(|e| e.into_inner()) }

    fn remove(&self, id: u64) -> bool {
        let mut removed = false;
        self.subs.rcu(|cur| {
            let next: Vec<Arc<Subscriber>> = cur.iter().filter(|s| s.id != id).cloned().collect();
            removed = next.len() != cur.len();
            next
        });
        removed
    }
}

/// Cheap to clone; all clones share subscribers.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

/// Unsubscribes when dropped, so a subscription never outlives its owner.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    id: u64,
    bus: Weak<Inner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 { self.id }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if inner.remove(self.id) {
                debug!(sub = self.id, "unsubscribed");
            }
        }
    }
}

/// Async view of a subscription for consumers living on the runtime.
pub struct EventStream {
    pub rx: mpsc::UnboundedReceiver<Event>,
    _handle: SubscriptionHandle,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> { self.rx.recv().await }
}

impl Default for Bus {
    fn default() -> Self { Self::new() }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: ArcSwap::from_pointee(Vec::new()),
                queue: Mutex::new(Queue::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, topic: Topic, cb: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscriber { id, topic, cb: Arc::new(cb) });
        self.inner.subs.rcu(|cur| {
            let mut next = Vec::with_capacity(cur.len() + 1);
            next.extend(cur.iter().cloned());
            next.push(Arc::clone(&sub));
            next
        });
        debug!(sub = id, topic = ?topic, "subscribed");
        SubscriptionHandle { id, bus: Arc::downgrade(&self.inner) }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) { drop(handle); }

    /// Subscribe through an unbounded channel instead of a callback.
    pub fn stream(&self, topic: Topic) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(topic, move |ev| {
            let _ = tx.send(ev.clone());
        });
        EventStream { rx, _handle: handle }
    }

    pub fn subscriber_count(&self) -> usize { self.inner.subs.load().len() }

    pub fn publish(&self, ev: Event) {
        {
            let mut q = self.inner.queue();
            q.events.push_back(ev);
            if q.draining {
                return;
            }
            q.draining = true;
        }
        loop {
            let next = {
                let mut q = self.inner.queue();
                match q.events.pop_front() {
                    Some(e) => e,
                    None => {
                        q.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&next);
        }
    }

    fn deliver(&self, ev: &Event) {
        counter!("bus_events_total", 1u64);
        let subs = self.inner.subs.load();
        for s in subs.iter().filter(|s| s.topic.matches(ev)) {
            if catch_unwind(AssertUnwindSafe(|| (s.cb)(ev))).is_err() {
                warn!(sub = s.id, "subscriber panicked during delivery");
            }
        }
    }
}
