//! Override gate — manual suppression windows.
//!
//! An override set on an instance suppresses every idle shutdown decision
//! while `now < override_until`, whatever the measured idle time. The gate
//! is consulted by the decision engine and again by the coordinator right
//! before a stop call.

use idlewatch_state::{IdleRecord, Timestamp};

/// Whether shutdown is currently suppressed for this record.
pub fn is_suppressed(record: &IdleRecord, now: Timestamp) -> bool {
    record.override_until.is_some_and(|until| now < until)
}

/// Seconds of suppression left, if any.
pub fn remaining_secs(record: &IdleRecord, now: Timestamp) -> Option<u64> {
    record
        .override_until
        .filter(|until| now < *until)
        .map(|until| until - now)
}

/// End of an override window starting now and lasting `minutes`.
pub fn window_end(now: Timestamp, minutes: u64) -> Timestamp {
    now.saturating_add(minutes.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppressed_strictly_before_end() {
        let mut record = IdleRecord::new("nb-1", 0);
        record.override_until = Some(3_600);

        assert!(is_suppressed(&record, 0));
        assert!(is_suppressed(&record, 3_599));
        assert!(!is_suppressed(&record, 3_600));
        assert_eq!(remaining_secs(&record, 3_000), Some(600));
        assert_eq!(remaining_secs(&record, 4_000), None);
    }

    #[test]
    fn no_override_never_suppresses() {
        let record = IdleRecord::new("nb-1", 0);
        assert!(!is_suppressed(&record, 0));
    }

    #[test]
    fn window_end_in_minutes() {
        assert_eq!(window_end(1_000, 60), 4_600);
    }
}
