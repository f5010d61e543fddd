//! Output formatting for CLI commands

use serde::Serialize;

use crate::ledger::LedgerEntry;
use crate::run::RunSummary;

/// Format output as JSON or table based on --json flag
pub fn format_output<T: Serialize + ?Sized>(
    data: &T,
    json: bool,
    table: impl FnOnce(&T) -> String,
) -> String {
    if json {
        serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
    } else {
        table(data)
    }
}

pub fn entries_table(entries: &[LedgerEntry]) -> String {
    if entries.is_empty() {
        return "Ledger is empty".to_string();
    }

    let mut out = format!(
        "{:<12}  {:<9}  {:>7}  {:<20}  {}\n",
        "FINGERPRINT", "STATUS", "RETRIES", "FIRST SEEN", "FILE"
    );
    for entry in entries {
        out.push_str(&format!(
            "{:<12}  {:<9}  {:>7}  {:<20}  {}\n",
            entry.fingerprint.short(),
            entry.notification_status.to_string(),
            entry.retry_count,
            entry.first_seen_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.source_path
        ));
        if let Some(error) = &entry.last_error {
            out.push_str(&format!("{:<12}  last error: {}\n", "", error));
        }
    }
    out.trim_end().to_string()
}

pub fn summary_line(summary: &RunSummary) -> String {
    let mut line = format!(
        "scanned {} | notified {} | failed {} | exhausted {} | skipped {} | unreadable {}",
        summary.scanned,
        summary.notified,
        summary.failed,
        summary.exhausted,
        summary.skipped,
        summary.unreadable
    );
    if summary.would_notify > 0 {
        line.push_str(&format!(" | would notify {}", summary.would_notify));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    #[test]
    fn test_entries_table() {
        assert_eq!(entries_table(&[]), "Ledger is empty");

        let mut entry = LedgerEntry::new(Fingerprint::from_hex("ab".repeat(32)), "/srv/cdr/a.cdr");
        entry.last_error = Some("chat: timeout".to_string());
        let table = entries_table(&[entry]);
        assert!(table.starts_with("FINGERPRINT"));
        assert!(table.contains("abababababab  pending"));
        assert!(table.contains("last error: chat: timeout"));
    }

    #[test]
    fn test_format_output_json() {
        let summary = RunSummary {
            scanned: 2,
            notified: 1,
            skipped: 1,
            ..Default::default()
        };
        let json = format_output(&summary, true, summary_line);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["notified"], 1);
        assert!(value.get("would_notify").is_none());

        assert_eq!(
            format_output(&summary, false, summary_line),
            "scanned 2 | notified 1 | failed 0 | exhausted 0 | skipped 1 | unreadable 0"
        );
    }
}
