//! Cabin store: the cluster registry and the in-RAM entity cache.
//!
//! Both are explicit instances shared through `Arc`; neither reaches for
//! process-wide state. Every effective change is published on the [`Bus`].

#![forbid(unsafe_code)]

mod cache;
mod refresh;
mod registry;

pub use cabin_bus::Bus;
pub use cache::{Checkout, EntityCache};
pub use refresh::{refresh_collection, RefreshOutcome};
pub use registry::Registry;
