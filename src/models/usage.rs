//! Per-principal usage counters.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of one principal's accumulated usage.
///
/// Counters only ever grow for the life of the process.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub uploaded_bytes: u64,
    pub upload_requests: u64,
    pub downloaded_bytes: u64,
    pub download_requests: u64,

    /// When the last report for this principal was applied.
    pub last_activity: Option<DateTime<Utc>>,
}
