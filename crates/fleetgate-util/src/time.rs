//! Time utilities for fleetgate
//!
//! Session accounting is derived purely from captured UTC timestamps;
//! nothing in the system runs off a live clock or timer.

use chrono::{DateTime, Utc};

/// Current UTC time. All timestamps in the store go through this so a
/// future mock-clock hook has a single seam.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Whole minutes elapsed between `start` and `end`, floored.
///
/// 125 seconds is 2 minutes; 59 seconds is 0. Ends before starts clamp
/// to zero rather than going negative.
pub fn whole_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let secs = (end - start).num_seconds().max(0);
    secs / 60
}
