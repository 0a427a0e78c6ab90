//! Bounded, human-readable event log for dashboards.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[hour]:[minute]:[second].[subsecond digits:3]");

/// Entries kept before the oldest are dropped.
pub const MAX_ENTRIES: usize = 500;

/// Shared log buffer of `[HH:MM:SS.mmm] message` lines.
///
/// Display only; nothing is persisted. Holds the newest [`MAX_ENTRIES`] lines.
/// Every entry is mirrored to `tracing`.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<RwLock<VecDeque<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let timestamp = OffsetDateTime::now_utc()
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_default();
        let entry = format!("[{timestamp}] {message}");
        tracing::info!(target: "tiersync::event_log", "{message}");
        let mut entries = self.entries.write();
        if entries.len() == MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Push to an optional log.
pub(crate) fn note(log: &Option<EventLog>, message: impl AsRef<str>) {
    if let Some(log) = log {
        log.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_timestamped_in_order() {
        let log = EventLog::new();
        log.push("first");
        log.push("second");

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with('['));
        assert!(entries[0].ends_with("] first"));
        assert!(entries[1].ends_with("] second"));
        // [HH:MM:SS.mmm]
        assert_eq!(entries[0].find(']'), Some(13));
    }

    #[test]
    fn test_clones_share_buffer() {
        let log = EventLog::new();
        let other = log.clone();
        other.push("shared");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_oldest_entries_are_dropped_past_capacity() {
        let log = EventLog::new();
        for i in 0..MAX_ENTRIES + 10 {
            log.push(format!("event {i}"));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert!(entries[0].ends_with("] event 10"));
        assert!(entries[MAX_ENTRIES - 1].ends_with(&format!("] event {}", MAX_ENTRIES + 9)));
    }
}
