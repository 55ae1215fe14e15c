// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session flash: durable one-shot out-of-band messages addressed to a
//! specific session. Created once, acknowledged once; a second ack is
//! idempotent and returns the original delivery row.

use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// A flash message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFlash {
    /// Flash id.
    pub flash_id: String,
    /// Destination session.
    pub session_id: String,
    /// Flash kind (free-form routing tag, e.g. `context_update`).
    pub kind: String,
    /// Body text.
    pub text: String,
    /// Creation time.
    pub created_at_ms: u64,
}

/// Acknowledgement of a delivered flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashAck {
    /// The acknowledged flash.
    pub flash_id: String,
    /// Delivery time.
    pub delivered_at_ms: u64,
    /// Turn that surfaced the flash, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

/// Journal rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum FlashEntry {
    Create { flash: SessionFlash },
    Delivery { ack: FlashAck },
}

/// Read filters for [`SessionFlashStore::query`].
#[derive(Debug, Clone, Default)]
pub struct SessionFlashFilter {
    /// Restrict to one session.
    pub session_id: Option<String>,
    /// Restrict to one kind.
    pub kind: Option<String>,
    /// Substring match on the body.
    pub contains: Option<String>,
    /// `Some(true)` = pending only, `Some(false)` = delivered only.
    pub pending: Option<bool>,
}

/// Errors from flash operations.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Underlying journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Unknown flash id.
    #[error("unknown session flash {0}")]
    UnknownFlash(String),
}

/// The session flash store.
#[derive(Debug)]
pub struct SessionFlashStore {
    journal: JsonlJournal,
    flashes: Vec<SessionFlash>,
    acks: HashMap<String, FlashAck>,
}

impl SessionFlashStore {
    /// Open (and replay) the flash journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FlashError> {
        let journal = JsonlJournal::new(path);
        let rows: Vec<FlashEntry> = journal.load()?;
        let mut flashes = Vec::new();
        let mut acks = HashMap::new();
        for row in rows {
            match row {
                FlashEntry::Create { flash } => flashes.push(flash),
                FlashEntry::Delivery { ack } => {
                    acks.insert(ack.flash_id.clone(), ack);
                }
            }
        }
        Ok(Self {
            journal,
            flashes,
            acks,
        })
    }

    /// Create a flash.
    pub fn create(&mut self, flash: SessionFlash) -> Result<(), FlashError> {
        self.journal.append(&FlashEntry::Create {
            flash: flash.clone(),
        })?;
        self.flashes.push(flash);
        Ok(())
    }

    /// Acknowledge delivery. Idempotent: a second ack returns the original
    /// delivery row without writing.
    pub fn ack(
        &mut self,
        flash_id: &str,
        delivered_at_ms: u64,
        turn_id: Option<String>,
    ) -> Result<FlashAck, FlashError> {
        if !self.flashes.iter().any(|f| f.flash_id == flash_id) {
            return Err(FlashError::UnknownFlash(flash_id.to_string()));
        }
        if let Some(existing) = self.acks.get(flash_id) {
            return Ok(existing.clone());
        }
        let ack = FlashAck {
            flash_id: flash_id.to_string(),
            delivered_at_ms,
            turn_id,
        };
        self.journal.append(&FlashEntry::Delivery { ack: ack.clone() })?;
        self.acks.insert(flash_id.to_string(), ack.clone());
        Ok(ack)
    }

    /// Query flashes with the given filter, in creation order.
    pub fn query(&self, filter: &SessionFlashFilter) -> Vec<SessionFlash> {
        self.flashes
            .iter()
            .filter(|f| {
                filter
                    .session_id
                    .as_ref()
                    .is_none_or(|s| &f.session_id == s)
                    && filter.kind.as_ref().is_none_or(|k| &f.kind == k)
                    && filter
                        .contains
                        .as_ref()
                        .is_none_or(|needle| f.text.contains(needle.as_str()))
                    && filter
                        .pending
                        .is_none_or(|pending| self.acks.contains_key(&f.flash_id) != pending)
            })
            .cloned()
            .collect()
    }

    /// Pending flashes for one session.
    pub fn pending_for(&self, session_id: &str) -> Vec<SessionFlash> {
        self.query(&SessionFlashFilter {
            session_id: Some(session_id.to_string()),
            pending: Some(true),
            ..Default::default()
        })
    }

    /// The delivery row for a flash, if acknowledged.
    pub fn delivery(&self, flash_id: &str) -> Option<&FlashAck> {
        self.acks.get(flash_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flash(id: &str, session: &str, kind: &str, text: &str) -> SessionFlash {
        SessionFlash {
            flash_id: id.into(),
            session_id: session.into(),
            kind: kind.into(),
            text: text.into(),
            created_at_ms: 1,
        }
    }

    fn store() -> (tempfile::TempDir, SessionFlashStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = SessionFlashStore::open(dir.path().join("session_flash.jsonl")).unwrap();
        (dir, s)
    }

    #[test]
    fn create_and_query_filters() {
        let (_dir, mut s) = store();
        s.create(flash("f1", "sess-1", "context_update", "branch moved"))
            .unwrap();
        s.create(flash("f2", "sess-1", "note", "issue closed"))
            .unwrap();
        s.create(flash("f3", "sess-2", "note", "unrelated")).unwrap();

        assert_eq!(s.pending_for("sess-1").len(), 2);
        let notes = s.query(&SessionFlashFilter {
            kind: Some("note".into()),
            ..Default::default()
        });
        assert_eq!(notes.len(), 2);
        let hits = s.query(&SessionFlashFilter {
            contains: Some("closed".into()),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flash_id, "f2");
    }

    #[test]
    fn ack_is_idempotent() {
        let (_dir, mut s) = store();
        s.create(flash("f1", "sess-1", "note", "x")).unwrap();
        let first = s.ack("f1", 100, Some("turn-1".into())).unwrap();
        let second = s.ack("f1", 999, Some("turn-2".into())).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.delivered_at_ms, 100);
        assert_eq!(second.turn_id.as_deref(), Some("turn-1"));
        assert!(s.pending_for("sess-1").is_empty());
    }

    #[test]
    fn ack_unknown_flash_errors() {
        let (_dir, mut s) = store();
        assert!(matches!(
            s.ack("nope", 1, None),
            Err(FlashError::UnknownFlash(_))
        ));
    }

    #[test]
    fn replay_preserves_acks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_flash.jsonl");
        {
            let mut s = SessionFlashStore::open(&path).unwrap();
            s.create(flash("f1", "sess-1", "note", "x")).unwrap();
            s.create(flash("f2", "sess-1", "note", "y")).unwrap();
            s.ack("f1", 100, None).unwrap();
        }
        let s = SessionFlashStore::open(&path).unwrap();
        let pending = s.pending_for("sess-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flash_id, "f2");
        assert_eq!(s.delivery("f1").unwrap().delivered_at_ms, 100);
    }
}
