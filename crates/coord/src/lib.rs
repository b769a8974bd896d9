//! Drift - Coordination store
//!
//! The processor shares task state with its peers and the owner through a
//! small replicated KV store (etcd-shaped): every key has a modification
//! revision, writes can be guarded by an expected revision (CAS), and
//! watches replay history from a revision unless it has been compacted away.
//!
//! # Layout
//!
//! - [`CoordStore`] - the store contract the processor is written against
//! - [`MemStore`] - in-process reference implementation (tests, embedding)
//! - [`CoordClient`] - typed CDC operations (task status/position/workload,
//!   changefeed status) over any store
//! - [`keys`] - key layout, namespaced per changefeed and capture

mod client;
mod error;
pub mod keys;
mod mem;
mod store;

pub use client::CoordClient;
pub use error::StoreError;
pub use mem::MemStore;
pub use store::{CoordStore, KeyValue, WatchEvent};

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
