// SPDX-License-Identifier: MIT OR Apache-2.0
//! mu-attachments
#![deny(unsafe_code)]
//!
//! Content-addressed attachment storage. Blobs live at
//! `blobs/sha256/<xx>/<yy>/<sha>`; an append-only index journal records
//! metadata. Dedupe checks the channel file id first, then the content hash.
//! Expired entries are collected in bounded batches.

use mu_core::envelope::Channel;
use mu_core::{Clock, IdGen};
use mu_journal::{JournalError, JsonlJournal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

/// One indexed attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Attachment id.
    pub attachment_id: String,
    /// Source channel.
    pub channel: Channel,
    /// Channel-side file id, when the channel provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<String>,
    /// SHA-256 of the content, hex.
    pub content_sha256: String,
    /// Filename after sanitization.
    pub safe_filename: String,
    /// MIME type, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Content size in bytes.
    pub size_bytes: u64,
    /// Blob path relative to the blob root (`sha256/<xx>/<yy>/<sha>`).
    pub blob_relpath: String,
    /// Retention window.
    pub ttl_ms: u64,
    /// Absolute expiry time.
    pub expires_at_ms: u64,
}

/// Index journal rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum IndexEntry {
    Add { record: AttachmentRecord },
    Expire { attachment_id: String, at_ms: u64 },
}

/// Metadata supplied when storing an attachment.
#[derive(Debug, Clone)]
pub struct PutRequest {
    /// Source channel.
    pub channel: Channel,
    /// Channel-side file id, for first-stage dedupe.
    pub source_file_id: Option<String>,
    /// Original filename.
    pub filename: String,
    /// MIME type, if known.
    pub mime_type: Option<String>,
    /// Retention window.
    pub ttl_ms: u64,
}

/// Outcome of a put.
#[derive(Debug, Clone)]
pub enum PutOutcome {
    /// Content was new; a blob and index row were written.
    Stored(AttachmentRecord),
    /// An existing record matched (by file id or content hash).
    Deduplicated(AttachmentRecord),
}

impl PutOutcome {
    /// The record, regardless of dedupe.
    pub fn record(&self) -> &AttachmentRecord {
        match self {
            Self::Stored(r) | Self::Deduplicated(r) => r,
        }
    }
}

/// Errors from attachment operations.
#[derive(Debug, Error)]
pub enum AttachmentError {
    /// Index journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Blob filesystem failure.
    #[error("attachment blob io at {path}: {source}")]
    BlobIo {
        /// Blob path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Sanitize a channel-supplied filename: keep `[A-Za-z0-9._-]`, fold the
/// rest to `_`, bound the length, and never return an empty or dot-leading
/// name.
pub fn safe_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(128);
    let trimmed = out.trim_start_matches(['.', '_', '-']);
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The attachment store: blob CAS plus index journal.
#[derive(Debug)]
pub struct AttachmentStore {
    index: JsonlJournal,
    blob_root: PathBuf,
    records: Vec<AttachmentRecord>,
    by_file_id: HashMap<(Channel, String), usize>,
    by_sha: HashMap<String, usize>,
    expired: HashMap<String, u64>,
}

impl AttachmentStore {
    /// Open the store: `index_path` is the index journal, `blob_root` the
    /// blob directory root.
    pub fn open(
        index_path: impl Into<PathBuf>,
        blob_root: impl Into<PathBuf>,
    ) -> Result<Self, AttachmentError> {
        let index = JsonlJournal::new(index_path);
        let rows: Vec<IndexEntry> = index.load()?;
        let mut this = Self {
            index,
            blob_root: blob_root.into(),
            records: Vec::new(),
            by_file_id: HashMap::new(),
            by_sha: HashMap::new(),
            expired: HashMap::new(),
        };
        for row in rows {
            this.apply(row);
        }
        Ok(this)
    }

    fn apply(&mut self, entry: IndexEntry) {
        match entry {
            IndexEntry::Add { record } => {
                let idx = self.records.len();
                if let Some(fid) = &record.source_file_id {
                    self.by_file_id
                        .insert((record.channel, fid.clone()), idx);
                }
                self.by_sha.insert(record.content_sha256.clone(), idx);
                self.records.push(record);
            }
            IndexEntry::Expire {
                attachment_id,
                at_ms,
            } => {
                self.expired.insert(attachment_id, at_ms);
            }
        }
    }

    /// Store content, deduping by `source_file_id` first, then by hash.
    pub fn put(
        &mut self,
        content: &[u8],
        req: PutRequest,
        ids: &dyn IdGen,
        clock: &dyn Clock,
    ) -> Result<PutOutcome, AttachmentError> {
        // Dedupe stage 1: channel file id.
        if let Some(fid) = &req.source_file_id {
            if let Some(&idx) = self.by_file_id.get(&(req.channel, fid.clone())) {
                let record = self.records[idx].clone();
                if !self.expired.contains_key(&record.attachment_id) {
                    return Ok(PutOutcome::Deduplicated(record));
                }
            }
        }

        let sha = hex::encode(Sha256::digest(content));

        // Dedupe stage 2: content hash.
        if let Some(&idx) = self.by_sha.get(&sha) {
            let record = self.records[idx].clone();
            if !self.expired.contains_key(&record.attachment_id) {
                return Ok(PutOutcome::Deduplicated(record));
            }
        }

        let relpath = format!("sha256/{}/{}/{}", &sha[0..2], &sha[2..4], sha);
        let blob_path = self.blob_root.join(&relpath);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).map_err(|source| AttachmentError::BlobIo {
                path: blob_path.clone(),
                source,
            })?;
        }
        fs::write(&blob_path, content).map_err(|source| AttachmentError::BlobIo {
            path: blob_path.clone(),
            source,
        })?;

        let now = clock.now_ms();
        let record = AttachmentRecord {
            attachment_id: ids.next_id("att"),
            channel: req.channel,
            source_file_id: req.source_file_id,
            content_sha256: sha,
            safe_filename: safe_filename(&req.filename),
            mime_type: req.mime_type,
            size_bytes: content.len() as u64,
            blob_relpath: relpath,
            ttl_ms: req.ttl_ms,
            expires_at_ms: now + req.ttl_ms,
        };
        self.index.append(&IndexEntry::Add {
            record: record.clone(),
        })?;
        self.apply(IndexEntry::Add {
            record: record.clone(),
        });
        debug!(
            target: "mu.attachments",
            attachment_id = %record.attachment_id,
            size = record.size_bytes,
            "attachment stored"
        );
        Ok(PutOutcome::Stored(record))
    }

    /// Fetch a live record by id.
    pub fn get(&self, attachment_id: &str) -> Option<&AttachmentRecord> {
        if self.expired.contains_key(attachment_id) {
            return None;
        }
        self.records
            .iter()
            .find(|r| r.attachment_id == attachment_id)
    }

    /// Read a live attachment's content.
    pub fn read(&self, attachment_id: &str) -> Result<Option<Vec<u8>>, AttachmentError> {
        let Some(record) = self.get(attachment_id) else {
            return Ok(None);
        };
        let path = self.blob_root.join(&record.blob_relpath);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(AttachmentError::BlobIo { path, source }),
        }
    }

    /// Expire up to `batch` records past their TTL, deleting blobs no other
    /// live record references. Returns expired ids; call again next tick for
    /// the remainder.
    pub fn sweep_expired(
        &mut self,
        now_ms: u64,
        batch: usize,
    ) -> Result<Vec<String>, AttachmentError> {
        let due: Vec<AttachmentRecord> = self
            .records
            .iter()
            .filter(|r| r.expires_at_ms <= now_ms && !self.expired.contains_key(&r.attachment_id))
            .take(batch)
            .cloned()
            .collect();

        let mut swept = Vec::with_capacity(due.len());
        for record in due {
            self.index.append(&IndexEntry::Expire {
                attachment_id: record.attachment_id.clone(),
                at_ms: now_ms,
            })?;
            self.expired.insert(record.attachment_id.clone(), now_ms);

            let shared = self.records.iter().any(|r| {
                r.content_sha256 == record.content_sha256
                    && r.attachment_id != record.attachment_id
                    && !self.expired.contains_key(&r.attachment_id)
            });
            if !shared {
                let path = self.blob_root.join(&record.blob_relpath);
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(AttachmentError::BlobIo { path, source }),
                }
            }
            swept.push(record.attachment_id);
        }
        if !swept.is_empty() {
            info!(target: "mu.attachments", count = swept.len(), "attachments expired");
        }
        Ok(swept)
    }

    /// Count of live (unexpired) records.
    pub fn live_len(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !self.expired.contains_key(&r.attachment_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mu_core::{ManualClock, SeqIdGen};

    fn store() -> (tempfile::TempDir, AttachmentStore, SeqIdGen, ManualClock) {
        let dir = tempfile::tempdir().unwrap();
        let s = AttachmentStore::open(
            dir.path().join("index.jsonl"),
            dir.path().join("blobs"),
        )
        .unwrap();
        (dir, s, SeqIdGen::new(), ManualClock::at(1_000))
    }

    fn req(file_id: Option<&str>, name: &str) -> PutRequest {
        PutRequest {
            channel: Channel::Slack,
            source_file_id: file_id.map(String::from),
            filename: name.into(),
            mime_type: Some("text/plain".into()),
            ttl_ms: 10_000,
        }
    }

    #[test]
    fn safe_filename_rules() {
        assert_eq!(safe_filename("report.pdf"), "report.pdf");
        assert_eq!(safe_filename("../../etc/passwd"), "etc_passwd");
        assert_eq!(safe_filename("weird name!.txt"), "weird_name_.txt");
        assert_eq!(safe_filename(""), "attachment");
        assert_eq!(safe_filename("..."), "attachment");
        assert!(safe_filename(&"x".repeat(500)).len() <= 128);
    }

    #[test]
    fn blob_lands_at_sharded_path() {
        let (dir, mut s, ids, clock) = store();
        let out = s.put(b"hello", req(None, "a.txt"), &ids, &clock).unwrap();
        let record = out.record();
        assert!(record.blob_relpath.starts_with("sha256/"));
        let full = dir.path().join("blobs").join(&record.blob_relpath);
        assert_eq!(std::fs::read(full).unwrap(), b"hello");
        assert_eq!(record.expires_at_ms, 11_000);
        assert_eq!(s.read(&record.attachment_id).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn dedupe_prefers_file_id_then_sha() {
        let (_dir, mut s, ids, clock) = store();
        let first = s
            .put(b"hello", req(Some("F1"), "a.txt"), &ids, &clock)
            .unwrap();
        assert!(matches!(first, PutOutcome::Stored(_)));

        // Same file id, different bytes: still deduped on stage 1.
        let by_fid = s
            .put(b"different", req(Some("F1"), "b.txt"), &ids, &clock)
            .unwrap();
        assert!(matches!(by_fid, PutOutcome::Deduplicated(_)));
        assert_eq!(by_fid.record().attachment_id, first.record().attachment_id);

        // No file id, same bytes: deduped on stage 2.
        let by_sha = s.put(b"hello", req(None, "c.txt"), &ids, &clock).unwrap();
        assert!(matches!(by_sha, PutOutcome::Deduplicated(_)));
        assert_eq!(by_sha.record().attachment_id, first.record().attachment_id);
    }

    #[test]
    fn sweep_respects_batch_and_removes_blobs() {
        let (dir, mut s, ids, clock) = store();
        let mut recs = Vec::new();
        for n in 0..3 {
            let out = s
                .put(format!("blob-{n}").as_bytes(), req(None, "f"), &ids, &clock)
                .unwrap();
            recs.push(out.record().clone());
        }

        let swept = s.sweep_expired(50_000, 2).unwrap();
        assert_eq!(swept.len(), 2);
        let swept = s.sweep_expired(50_000, 2).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(s.live_len(), 0);
        for rec in &recs {
            assert!(!dir.path().join("blobs").join(&rec.blob_relpath).exists());
            assert!(s.get(&rec.attachment_id).is_none());
        }
    }

    #[test]
    fn unexpired_records_survive_sweep() {
        let (_dir, mut s, ids, clock) = store();
        let out = s.put(b"keep me", req(None, "f"), &ids, &clock).unwrap();
        let swept = s.sweep_expired(5_000, 64).unwrap();
        assert!(swept.is_empty());
        assert!(s.get(&out.record().attachment_id).is_some());
    }

    #[test]
    fn replay_preserves_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let ids = SeqIdGen::new();
        let clock = ManualClock::at(1_000);
        let id;
        {
            let mut s = AttachmentStore::open(
                dir.path().join("index.jsonl"),
                dir.path().join("blobs"),
            )
            .unwrap();
            id = s
                .put(b"x", req(None, "f"), &ids, &clock)
                .unwrap()
                .record()
                .attachment_id
                .clone();
            s.sweep_expired(50_000, 64).unwrap();
        }
        let s = AttachmentStore::open(
            dir.path().join("index.jsonl"),
            dir.path().join("blobs"),
        )
        .unwrap();
        assert!(s.get(&id).is_none());
        assert_eq!(s.live_len(), 0);
    }
}
