#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Real-time incident synchronization.
//!
//! [`feed::IncidentFeed`] is the pure core: a bounded, deduplicated,
//! newest-first list of incidents with upsert/delete semantics.
//! [`store::IncidentSyncStore`] wraps it with the connection lifecycle —
//! REST bootstrap, the live WebSocket stream, exponential-backoff
//! reconnection, and explicit teardown.
//!
//! Both original client applications carried their own copy of this
//! logic as a module-level singleton; here it is one explicitly
//! constructed store per consumer, parameterized by
//! [`green_sentinel_config::ClientConfig`].

pub mod feed;
pub mod store;

pub use feed::IncidentFeed;
pub use store::IncidentSyncStore;
