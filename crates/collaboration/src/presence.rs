/// Presence tracking for collaborative editing
/// Shows who is online and which field each participant is working in
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{FieldKey, ParticipantId};

/// Caret location inside a report field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub key: FieldKey,
    pub caret: usize,
    /// End of a selection starting at `caret`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<usize>,
}

impl CursorPosition {
    pub fn new(key: FieldKey, caret: usize) -> Self {
        Self {
            key,
            caret,
            selection_end: None,
        }
    }
}

/// Presence of one participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub cursor: Option<CursorPosition>,
    /// Client timestamp of the cursor update currently stored
    #[serde(skip)]
    cursor_at: Option<DateTime<Utc>>,
}

impl PresenceEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            online: true,
            last_seen: now,
            cursor: None,
            cursor_at: None,
        }
    }

    /// No activity for `idle_after`
    pub fn is_idle(&self, now: DateTime<Utc>, idle_after: Duration) -> bool {
        let Ok(idle) = chrono::Duration::from_std(idle_after) else {
            return false;
        };
        now - self.last_seen > idle
    }
}

/// Per-session presence map
#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    entries: HashMap<ParticipantId, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Mark a participant online (new or returning)
    pub fn mark_online(&mut self, id: ParticipantId, now: DateTime<Utc>) {
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| PresenceEntry::new(now));
        entry.online = true;
        entry.last_seen = now;
    }

    /// Mark offline, keeping the entry for history. Returns whether it was online.
    pub fn mark_offline(&mut self, id: &ParticipantId, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                let was_online = entry.online;
                entry.online = false;
                entry.last_seen = now;
                entry.cursor = None;
                entry.cursor_at = None;
                was_online
            }
            None => false,
        }
    }

    pub fn touch(&mut self, id: &ParticipantId, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_seen = now;
        }
    }

    /// Record a cursor move stamped `at` by the client.
    ///
    /// Most-recent-wins: an update older than the stored one is ignored.
    /// Returns whether the stored cursor changed.
    pub fn update_cursor(
        &mut self,
        id: &ParticipantId,
        position: CursorPosition,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if !entry.online {
            return false;
        }
        if entry.cursor_at.is_some_and(|prev| at < prev) {
            return false;
        }
        entry.cursor = Some(position);
        entry.cursor_at = Some(at);
        entry.last_seen = now;
        true
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&PresenceEntry> {
        self.entries.get(id)
    }

    pub fn is_online(&self, id: &ParticipantId) -> bool {
        self.entries.get(id).is_some_and(|e| e.online)
    }

    pub fn online(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.entries
            .iter()
            .filter(|(_, e)| e.online)
            .map(|(id, _)| *id)
    }

    pub fn online_count(&self) -> usize {
        self.entries.values().filter(|e| e.online).count()
    }

    /// Participants whose cursor is in `key`
    pub fn in_field(&self, key: &FieldKey) -> Vec<ParticipantId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.online && e.cursor.as_ref().is_some_and(|c| &c.key == key))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Mark online participants idle for longer than `idle_after` as offline
    pub fn sweep_idle(&mut self, now: DateTime<Utc>, idle_after: Duration) -> Vec<ParticipantId> {
        let idle: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.online && e.is_idle(now, idle_after))
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            self.mark_offline(id, now);
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings() -> FieldKey {
        FieldKey::new("findings", "text")
    }

    #[test]
    fn cursor_updates_are_most_recent_wins() {
        let mut tracker = PresenceTracker::new();
        let id = ParticipantId::new();
        let now = Utc::now();
        tracker.mark_online(id, now);

        let later = now + chrono::Duration::milliseconds(50);
        assert!(tracker.update_cursor(&id, CursorPosition::new(findings(), 10), later, later));

        // stale update arriving late is dropped
        assert!(!tracker.update_cursor(&id, CursorPosition::new(findings(), 3), now, later));
        assert_eq!(tracker.get(&id).unwrap().cursor.as_ref().unwrap().caret, 10);
    }

    #[test]
    fn offline_keeps_entry_and_clears_cursor() {
        let mut tracker = PresenceTracker::new();
        let id = ParticipantId::new();
        let now = Utc::now();
        tracker.mark_online(id, now);
        tracker.update_cursor(&id, CursorPosition::new(findings(), 1), now, now);

        assert!(tracker.mark_offline(&id, now));
        assert!(!tracker.mark_offline(&id, now));
        let entry = tracker.get(&id).unwrap();
        assert!(!entry.online);
        assert!(entry.cursor.is_none());
        assert_eq!(tracker.online_count(), 0);
    }

    #[test]
    fn sweep_marks_idle_offline() {
        let mut tracker = PresenceTracker::new();
        let idle = ParticipantId::new();
        let active = ParticipantId::new();
        let now = Utc::now();
        tracker.mark_online(idle, now - chrono::Duration::seconds(600));
        tracker.mark_online(active, now);

        let swept = tracker.sweep_idle(now, Duration::from_secs(300));
        assert_eq!(swept, vec![idle]);
        assert!(tracker.is_online(&active));
        assert!(!tracker.is_online(&idle));
    }

    #[test]
    fn participants_in_field() {
        let mut tracker = PresenceTracker::new();
        let a = ParticipantId::new();
        let b = ParticipantId::new();
        let now = Utc::now();
        tracker.mark_online(a, now);
        tracker.mark_online(b, now);
        tracker.update_cursor(&a, CursorPosition::new(findings(), 0), now, now);
        let summary = CursorPosition::new(FieldKey::new("impression", "summary"), 0);
        tracker.update_cursor(&b, summary, now, now);

        assert_eq!(tracker.in_field(&findings()), vec![a]);
    }
}
