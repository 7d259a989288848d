//! Client-side query cache.
//!
//! This module provides the keyed cache the dashboard reads through:
//! - One entry per `QueryKey`, holding confirmed rows plus freshness metadata
//! - At most one outstanding fetch per key; newer requests win over older ones
//! - Stale-while-revalidate and stale-while-error reads
//! - Optimistic overlays layered over confirmed rows
//! - Summary keys recomputed from scratch whenever their rows change

mod entry;
mod key;
mod layer;
mod policy;
mod subscription;

pub use entry::{CacheEntry, QueryStatus};
pub use key::{QueryData, QueryKey};
pub use layer::{fetcher, FetchFuture, Fetcher, Overlay, QueryCache};
pub use policy::{PolicyClass, QueryOptions};
pub use subscription::Subscription;
