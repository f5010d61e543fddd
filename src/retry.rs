//! Retry policy - geometric backoff across separate invocations
//!
//! The policy never sleeps. A run asks whether an entry is due; the scheduler
//! re-invoking the batch is what actually realizes the delay.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::ledger::{LedgerEntry, NotificationStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    /// Attempt 0 is treated as attempt 1.
    pub fn next_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn is_exhausted(&self, attempt_number: u32) -> bool {
        attempt_number > self.max_attempts
    }

    /// Whether a pending entry should be attempted at `now`.
    ///
    /// Never-attempted entries (fresh, or left behind by a crash) are always due.
    pub fn is_due(&self, entry: &LedgerEntry, now: DateTime<Utc>) -> bool {
        if entry.notification_status != NotificationStatus::Pending {
            return false;
        }
        if self.is_exhausted(entry.retry_count + 1) {
            return false;
        }
        let Some(last) = entry.last_attempt_at else {
            return true;
        };
        if entry.retry_count == 0 {
            return true;
        }
        let Ok(delay) = chrono::Duration::from_std(self.next_delay(entry.retry_count)) else {
            return false;
        };
        match last.checked_add_signed(delay) {
            Some(due_at) => now >= due_at,
            None => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 1.5, Duration::from_secs(3600), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn policy(max_delay_secs: u64) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(5),
            1.5,
            Duration::from_secs(max_delay_secs),
            3,
        )
    }

    fn entry(retry_count: u32, last_attempt_at: Option<DateTime<Utc>>) -> LedgerEntry {
        let mut entry = LedgerEntry::new(Fingerprint::from_hex("ab".repeat(32)), "/srv/cdr/a.cdr");
        entry.retry_count = retry_count;
        entry.last_attempt_at = last_attempt_at;
        entry
    }

    #[test]
    fn test_backoff_growth() {
        let p = policy(3600);
        assert_eq!(p.next_delay(1), Duration::from_secs_f64(5.0));
        assert_eq!(p.next_delay(2), Duration::from_secs_f64(7.5));
        assert_eq!(p.next_delay(3), Duration::from_secs_f64(11.25));
        assert_eq!(p.next_delay(0), p.next_delay(1));
    }

    #[test]
    fn test_backoff_capped() {
        let p = policy(10);
        assert_eq!(p.next_delay(2), Duration::from_secs_f64(7.5));
        assert_eq!(p.next_delay(3), Duration::from_secs(10));
        assert_eq!(p.next_delay(1_000), Duration::from_secs(10));
        assert_eq!(p.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy(3600);
        assert!(!p.is_exhausted(1));
        assert!(!p.is_exhausted(3));
        assert!(p.is_exhausted(4));
    }

    #[test]
    fn test_never_attempted_entry_is_due() {
        let p = policy(3600);
        assert!(p.is_due(&entry(0, None), Utc::now()));
    }

    #[test]
    fn test_due_after_backoff_elapsed() {
        let p = policy(3600);
        let last = Utc::now();
        let e = entry(2, Some(last));

        // retry_count 2 -> wait next_delay(2) = 7.5s
        assert!(!p.is_due(&e, last + chrono::Duration::seconds(7)));
        assert!(p.is_due(&e, last + chrono::Duration::seconds(8)));
    }

    #[test]
    fn test_terminal_entries_never_due() {
        let p = policy(3600);
        let mut e = entry(0, None);
        e.notification_status = NotificationStatus::Notified;
        assert!(!p.is_due(&e, Utc::now()));

        e.notification_status = NotificationStatus::Exhausted;
        assert!(!p.is_due(&e, Utc::now()));

        // 预算用尽但状态仍是 pending（例如 max_attempts 被调小）
        let e = entry(3, None);
        assert!(!p.is_due(&e, Utc::now()));
    }
}
