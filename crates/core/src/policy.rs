//! Runtime policy consumed by the poller and the mutation coordinator.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::{CabinError, EntityKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub health_interval: Duration,
    pub refresh_interval: Duration,
    /// Consecutive failed probes before a cluster is marked unreachable.
    pub failure_threshold: u32,
    pub max_replicas: u32,
    pub mutation_timeout: Duration,
    pub scale_followup_delay: Duration,
    pub probe_timeout: Duration,
    /// Kinds fetched by the periodic refresh loop.
    pub refresh_kinds: Vec<EntityKind>,
    pub list_page_size: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(30),
            failure_threshold: 3,
            max_replicas: 20,
            mutation_timeout: Duration::from_secs(15),
            scale_followup_delay: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            refresh_kinds: vec![EntityKind::Pod, EntityKind::Deployment, EntityKind::Namespace],
            list_page_size: 250,
        }
    }
}

impl Policy {
    /// Defaults overlaid with `CABIN_*` environment variables.
    pub fn from_env() -> Self { Self::default().overlay(|k| std::env::var(k).ok()) }

    /// Overlay values from a key lookup; unparsable values are ignored with a warning.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn num<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparsable policy value");
                    None
                }
            }
        }
        if let Some(s) = num::<u64>(&lookup, "CABIN_HEALTH_INTERVAL_SECS") { self.health_interval = Duration::from_secs(s.max(1)); }
        if let Some(s) = num::<u64>(&lookup, "CABIN_REFRESH_INTERVAL_SECS") { self.refresh_interval = Duration::from_secs(s.max(1)); }
        if let Some(n) = num::<u32>(&lookup, "CABIN_FAILURE_THRESHOLD") { self.failure_threshold = n.max(1); }
        if let Some(n) = num::<u32>(&lookup, "CABIN_MAX_REPLICAS") {
            if n > 0 { self.max_replicas = n; }
        }
        if let Some(s) = num::<u64>(&lookup, "CABIN_MUTATION_TIMEOUT_SECS") { self.mutation_timeout = Duration::from_secs(s.max(1)); }
        if let Some(ms) = num::<u64>(&lookup, "CABIN_SCALE_FOLLOWUP_MS") { self.scale_followup_delay = Duration::from_millis(ms); }
        if let Some(s) = num::<u64>(&lookup, "CABIN_PROBE_TIMEOUT_SECS") { self.probe_timeout = Duration::from_secs(s.max(1)); }
        if let Some(n) = num::<u32>(&lookup, "CABIN_LIST_PAGE_SIZE") { self.list_page_size = n.max(1); }
        if let Some(raw) = lookup("CABIN_REFRESH_KINDS") {
            let mut kinds = Vec::new();
            for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
                match part.parse::<EntityKind>() {
                    Ok(k) if !kinds.contains(&k) => kinds.push(k),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "ignoring refresh kind"),
                }
            }
            if !kinds.is_empty() { self.refresh_kinds = kinds; }
        }
        self
    }
}

/// Read-only view of the current policy. Implementations may change the value
/// between calls; consumers read it once per scheduling cycle.
pub trait PolicySource: Send + Sync {
    fn policy(&self) -> Arc<Policy>;
}

impl PolicySource for Policy {
    fn policy(&self) -> Arc<Policy> { Arc::new(self.clone()) }
}

/// Policy holder updatable at runtime (settings screen, config reload).
pub struct SharedPolicy {
    cur: ArcSwap<Policy>,
}

impl SharedPolicy {
    pub fn new(p: Policy) -> Self { Self { cur: ArcSwap::from_pointee(p) } }

    pub fn update(&self, f: impl Fn(&mut Policy)) {
        self.cur.rcu(|old| {
            let mut next = (**old).clone();
            f(&mut next);
            next
        });
    }

    pub fn set_max_replicas(&self, max: u32) -> Result<(), CabinError> {
        if max == 0 {
            return Err(CabinError::InvalidArgument("max replicas must be positive".into()));
        }
        self.update(|p| p.max_replicas = max);
        Ok(())
    }

    pub fn set_refresh_kinds(&self, kinds: Vec<EntityKind>) -> Result<(), CabinError> {
        if kinds.is_empty() {
            return Err(CabinError::InvalidArgument("at least one refresh kind is required".into()));
        }
        self.update(|p| p.refresh_kinds = kinds.clone());
        Ok(())
    }
}

impl Default for SharedPolicy {
    fn default() -> Self { Self::new(Policy::default()) }
}

impl PolicySource for SharedPolicy {
    fn policy(&self) -> Arc<Policy> { self.cur.load_full() }
}
