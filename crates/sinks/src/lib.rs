//! Drift - Sinks
//!
//! Downstream delivery targets for row-change events.
//!
//! # Contract
//!
//! ```text
//! [OutputMerger] --emit_rows--> [Sink buffer] --flush(ts)--> durable <= ts
//! ```
//!
//! - `emit_rows` is a blocking, atomic append (empty slices allowed)
//! - `flush(target_ts)` durably commits everything emitted with
//!   `commit_ts <= target_ts` and reports the timestamp actually made
//!   durable (at most `target_ts`; `0` = nothing durable yet)
//! - `close` is an idempotent release
//!
//! # Available sinks
//!
//! - [`BlackholeSink`]: counts and discards (throughput testing)
//! - [`CaptureSink`]: records the exact call sequence (law tests)

mod blackhole;
mod capture;
mod common;
mod sink;

pub use blackhole::BlackholeSink;
pub use capture::{CaptureSink, SinkCall};
pub use common::{MetricsSnapshot, SinkMetrics};
pub use sink::{Sink, SinkError};
