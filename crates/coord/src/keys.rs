//! Coordination-store key layout.
//!
//! Keys are namespaced per changefeed and capture. The three `/task/...`
//! keys are owned (and deleted on stop) by the capture they name; `/job/...`
//! is owner-written and read-only for processors.

/// Task status: owner-assigned tables and pending operations. CAS-written.
pub fn task_status_key(changefeed_id: &str, capture_id: &str) -> String {
    format!("/task/status/{changefeed_id}/{capture_id}")
}

/// Task position: this capture's checkpoint/resolved watermarks.
pub fn task_position_key(changefeed_id: &str, capture_id: &str) -> String {
    format!("/task/position/{changefeed_id}/{capture_id}")
}

/// Task workload: per-table load report, refreshed every 10 s.
pub fn task_workload_key(changefeed_id: &str, capture_id: &str) -> String {
    format!("/task/workload/{changefeed_id}/{capture_id}")
}

/// Changefeed status: owner-published global watermarks.
pub fn job_key(changefeed_id: &str) -> String {
    format!("/job/{changefeed_id}")
}
