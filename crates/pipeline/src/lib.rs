//! Drift - Pipeline stages
//!
//! Building blocks of the per-table replication chain:
//!
//! ```text
//! [Puller] ──raw──> [Sorter] ──ordered──> [Rectifier] ──gated──> consumers
//!                                                        │
//!                              [Mounter pool] <──arm/decode/latch
//! ```
//!
//! - [`Notifier`]: edge-triggered, coalescing wake-ups with minimum pacing
//! - [`MemoryLimiter`]: byte-budget backpressure for puller buffers
//! - [`Puller`]: the upstream-source contract plus a channel-fed reference
//!   implementation
//! - [`EventSorter`]: ordering stage; in-memory and spill-to-disk engines
//! - [`Rectifier`]: target-ts gate and safe-stop state machine
//! - [`Mounter`]: shared decode pool turning raw entries into row changes
//! - [`SchemaStorage`]: multi-version schema snapshots the mounter decodes
//!   against

mod error;
mod limiter;
mod mounter;
mod notify;
mod puller;
mod rectifier;
mod schema;
mod sort_output;
pub mod sorter;
pub mod span;

pub use error::PipelineError;
pub use limiter::MemoryLimiter;
pub use mounter::Mounter;
pub use notify::{Notifier, Receiver};
pub use puller::{ChannelPuller, ChannelPullerFactory, Puller, PullerFactory, PullerFeed};
pub use rectifier::{Rectifier, RectifierStatus};
pub use schema::{MemorySchemaStorage, SchemaSnapshot, SchemaStorage, TableSchema};
pub use sort_output::sort_raw_output;
pub use sorter::{build_sorter, EventSorter, FileSorter, MemorySorter, SortEngine};
pub use span::Span;



#[cfg(test)]
#[path = "mounter_test.rs"]
mod mounter_test;
