//! Capture and changefeed identity carriers.

use serde::{Deserialize, Serialize};

use crate::ts::Ts;

/// Identity of the replica hosting a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInfo {
    pub id: String,
    /// Address advertised to peers; recorded in error reports.
    pub advertise_addr: String,
}

/// Static description of a changefeed, as created by the owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangefeedInfo {
    #[serde(default)]
    pub sink_uri: String,
    /// Timestamp replication started from.
    #[serde(default)]
    pub start_ts: Ts,
    /// Upper bound of the changefeed; `0` means unbounded.
    #[serde(default)]
    pub target_ts: Ts,
}

impl ChangefeedInfo {
    /// Effective upper bound: `u64::MAX` when unbounded.
    pub fn effective_target_ts(&self) -> Ts {
        if self.target_ts == 0 {
            u64::MAX
        } else {
            self.target_ts
        }
    }
}
