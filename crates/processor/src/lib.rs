//! Drift - CDC Processor
//!
//! The per-capture, per-changefeed engine: turns raw KV mutation streams
//! into a totally-ordered, watermark-gated stream of row changes delivered
//! to a sink, while coordinating table ownership with the cluster owner
//! through a shared CAS/watch store.
//!
//! # Architecture
//!
//! ```text
//!                   ┌── per table ─────────────────────────────┐
//!  upstream ──raw──>│ Puller ──> Sorter ──> Rectifier ──┐      │
//!                   └───────────────────────────────────┼──────┘
//!                         Mounter pool <── arm ─────────┤
//!                                                       v
//!                 global watermark fan-out ──> [output queue]
//!                                                       │
//!                                               syncResolved ──> Sink
//!                                                       │
//!            sinkDriver: flush(min(sinkEmitted, global)) ──> checkpoint
//! ```
//!
//! Control flow: the owner writes `TaskStatus` operations into the
//! coordination store; the [`Processor`]'s status writer CAS-loops them
//! through the table scheduler and persists `TaskPosition` as watermarks
//! advance. The owner-published global watermark gates both the fan-out and
//! the sink flush.

mod config;
mod error;
mod metrics;
mod processor;
pub mod retry;
mod scheduler;
mod table;

pub use config::ChangefeedConfig;
pub use error::ProcessorError;
pub use metrics::{MetricsSnapshot, ProcessorMetrics};
pub use processor::{run_processor, Processor, ProcessorHandle, ProcessorParams};
