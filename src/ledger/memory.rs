//! 内存账本（测试用）

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{unknown_fingerprint, AttemptOutcome, Ledger, LedgerEntry};
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;

pub struct MemoryLedger {
    entries: Mutex<HashMap<Fingerprint, LedgerEntry>>,
    max_attempts: u32,
}

impl MemoryLedger {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    fn with_entries<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce(&mut HashMap<Fingerprint, LedgerEntry>) -> Result<T>,
    {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| Error::Ledger(format!("ledger mutex poisoned: {}", e)))?;
        operation(&mut guard)
    }
}

impl Ledger for MemoryLedger {
    fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        self.with_entries(|entries| Ok(entries.get(fingerprint).cloned()))
    }

    fn insert_if_absent(
        &self,
        fingerprint: &Fingerprint,
        source_path: &str,
    ) -> Result<(LedgerEntry, bool)> {
        self.with_entries(|entries| {
            if let Some(existing) = entries.get(fingerprint) {
                return Ok((existing.clone(), false));
            }
            let entry = LedgerEntry::new(fingerprint.clone(), source_path);
            entries.insert(fingerprint.clone(), entry.clone());
            Ok((entry, true))
        })
    }

    fn record_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LedgerEntry> {
        let max_attempts = self.max_attempts;
        self.with_entries(|entries| {
            let entry = entries
                .get_mut(fingerprint)
                .ok_or_else(|| unknown_fingerprint(fingerprint))?;
            entry.apply_attempt(outcome, error, max_attempts, now);
            Ok(entry.clone())
        })
    }

    fn reset(&self, fingerprint: &Fingerprint) -> Result<Option<LedgerEntry>> {
        self.with_entries(|entries| {
            Ok(entries.get_mut(fingerprint).map(|entry| {
                entry.reset();
                entry.clone()
            }))
        })
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.with_entries(|entries| {
            let mut all: Vec<LedgerEntry> = entries.values().cloned().collect();
            all.sort_by_key(|e| e.first_seen_at);
            Ok(all)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;
    use crate::ledger::NotificationStatus;

    #[test]
    fn test_memory_ledger_matches_contract() {
        let ledger = MemoryLedger::new(2);
        let fp = fingerprint_bytes("a.cdr", b"a");

        assert!(ledger.lookup(&fp).unwrap().is_none());
        assert!(ledger.insert_if_absent(&fp, "a.cdr").unwrap().1);
        assert!(!ledger.insert_if_absent(&fp, "a.cdr").unwrap().1);

        ledger.record_attempt(&fp, AttemptOutcome::Failure, Some("x"), Utc::now()).unwrap();
        let e = ledger.record_attempt(&fp, AttemptOutcome::Failure, Some("y"), Utc::now()).unwrap();
        assert_eq!(e.notification_status, NotificationStatus::Exhausted);

        assert!(ledger.reset(&fingerprint_bytes("b.cdr", b"b")).unwrap().is_none());
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }
}
