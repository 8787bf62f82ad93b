//! Claim outcomes and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in the pipeline.

use crate::model::{ProcessingRecord, ProcessingStatus};
use std::time::Duration;

/// Who is claiming and under which bounds.
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub run_id: &'a str,
    pub max_attempts: i64,
    pub lease: Duration,
}

/// Result of an atomic claim attempt on one message id.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// First sighting; a Pending record was inserted for this run.
    Claimed(ProcessingRecord),
    /// An unfinished record was taken over for a retry.
    Reclaimed(ProcessingRecord),
    /// Responded or Skipped already; nothing left to do.
    AlreadyFinal(ProcessingRecord),
    /// Failed for good (permanent error or attempts used up).
    Exhausted(ProcessingRecord),
    /// Another worker holds a live lease on it.
    InFlight,
}

/// Per-status row count for operator reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub status: ProcessingStatus,
    pub count: i64,
}
