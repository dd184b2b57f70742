//! Object-store metadata reads and listing-file streaming.
//!
//! Both the transactional database driver and the real object-store client
//! are out of scope for this crate (§1) — only their interfaces matter here.
//! This crate defines those interfaces as traits plus a local,
//! filesystem-backed implementation usable for tests and for running the
//! engine without a cloud object store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("backend error reading {bucket}/{object}: {reason}")]
    Backend {
        bucket: String,
        object: String,
        reason: String,
    },
}

/// `{size, mtime, generation}` — absent is modeled as `Ok(None)` from `stat`,
/// distinct from a backend error.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub generation: i64,
}

#[async_trait]
pub trait ObjectMetadataReader: Send + Sync {
    async fn stat(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<Option<ObjectMetadata>, ObjectStoreError>;

    /// Convenience used by handlers attaching `FileIntegrity` semantics:
    /// an absent object's generation is `0` (§7, "Object-store absence").
    async fn generation_or_zero(&self, bucket: &str, object: &str) -> Result<i64, ObjectStoreError> {
        Ok(self.stat(bucket, object).await?.map(|m| m.generation).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingEntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub kind: ListingEntryKind,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingReadResult {
    pub entries: Vec<ListingEntry>,
    /// Byte offset to resume from on the next call.
    pub next_offset: u64,
    /// True once the reader has consumed the entire listing object.
    pub eof: bool,
}

#[async_trait]
pub trait ListingFileReader: Send + Sync {
    /// Reads up to `max_entries` ordered `(kind, path)` entries starting at
    /// `offset`, per the §6 listing-file line format: one `<kind>,<path>`
    /// entry per line, `f`/`d` kind markers, a single discarded `junkID`
    /// line at byte 0, `\n`-terminated lines.
    async fn read_from(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        max_entries: usize,
    ) -> Result<ListingReadResult, ObjectStoreError>;
}

/// Parses one read window of listing-file bytes per the §6 wire format.
/// Shared by the in-memory test double and any real backend so the parsing
/// rules live in exactly one place.
pub fn parse_listing_window(
    full_contents: &[u8],
    offset: u64,
    max_entries: usize,
) -> Result<ListingReadResult, ObjectStoreError> {
    let mut pos = offset as usize;
    let mut entries = Vec::new();

    // The junkID line occupies byte 0 only; if we're resuming mid-stream
    // (offset > 0) it has already been skipped by a prior call.
    if pos == 0 {
        if let Some(line_len) = line_len_at(full_contents, 0) {
            pos = line_len + 1;
        }
    }

    while entries.len() < max_entries && pos < full_contents.len() {
        let Some(line_len) = line_len_at(full_contents, pos) else {
            break;
        };
        let line = &full_contents[pos..pos + line_len];
        let line_str = String::from_utf8_lossy(line);
        if let Some((kind, path)) = line_str.split_once(',') {
            let kind = match kind {
                "f" => ListingEntryKind::File,
                "d" => ListingEntryKind::Dir,
                other => {
                    return Err(ObjectStoreError::Backend {
                        bucket: String::new(),
                        object: String::new(),
                        reason: format!("unrecognized listing-entry kind '{other}'"),
                    })
                }
            };
            entries.push(ListingEntry {
                kind,
                path: path.to_string(),
            });
        }
        pos += line_len + 1;
    }

    let eof = pos >= full_contents.len();
    Ok(ListingReadResult {
        entries,
        next_offset: pos as u64,
        eof,
    })
}

fn line_len_at(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    let rel_newline = buf[start..].iter().position(|&b| b == b'\n');
    Some(rel_newline.unwrap_or(buf.len() - start))
}

/// In-memory object store: bucket/object -> (bytes, metadata). Used by
/// tests and by the CLI in standalone/dev mode.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<(String, String), (Vec<u8>, ObjectMetadata)>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, object: &str, contents: Vec<u8>, generation: i64) {
        let metadata = ObjectMetadata {
            size: contents.len() as u64,
            mtime: Utc::now(),
            generation,
        };
        self.objects
            .lock()
            .expect("object store mutex poisoned")
            .insert((bucket.to_string(), object.to_string()), (contents, metadata));
    }
}

#[async_trait]
impl ObjectMetadataReader for MemoryObjectStore {
    async fn stat(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<Option<ObjectMetadata>, ObjectStoreError> {
        Ok(self
            .objects
            .lock()
            .expect("object store mutex poisoned")
            .get(&(bucket.to_string(), object.to_string()))
            .map(|(_, meta)| meta.clone()))
    }
}

#[async_trait]
impl ListingFileReader for MemoryObjectStore {
    async fn read_from(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        max_entries: usize,
    ) -> Result<ListingReadResult, ObjectStoreError> {
        let contents = self
            .objects
            .lock()
            .expect("object store mutex poisoned")
            .get(&(bucket.to_string(), object.to_string()))
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| ObjectStoreError::Backend {
                bucket: bucket.to_string(),
                object: object.to_string(),
                reason: "listing object not found".to_string(),
            })?;
        parse_listing_window(&contents, offset, max_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_junk_line_at_offset_zero() {
        let contents = b"junkID\nf,a.txt\nd,subdir\n";
        let result = parse_listing_window(contents, 0, 10).unwrap();
        assert_eq!(result.entries.len(), 2);
        assert_eq!(result.entries[0].kind, ListingEntryKind::File);
        assert_eq!(result.entries[0].path, "a.txt");
        assert_eq!(result.entries[1].kind, ListingEntryKind::Dir);
        assert!(result.eof);
    }

    #[test]
    fn resumes_from_nonzero_offset_without_reskipping_junk() {
        let contents = b"junkID\nf,a.txt\nd,subdir\n";
        let first = parse_listing_window(contents, 0, 1).unwrap();
        assert_eq!(first.entries.len(), 1);
        assert!(!first.eof);

        let second = parse_listing_window(contents, first.next_offset, 10).unwrap();
        assert_eq!(second.entries.len(), 1);
        assert_eq!(second.entries[0].path, "subdir");
        assert!(second.eof);
    }

    #[test]
    fn bounds_reads_by_max_entries() {
        let contents = b"junkID\nf,a\nf,b\nf,c\n";
        let result = parse_listing_window(contents, 0, 2).unwrap();
        assert_eq!(result.entries.len(), 2);
        assert!(!result.eof);
    }

    #[tokio::test]
    async fn memory_store_reports_absent_objects_as_none() {
        let store = MemoryObjectStore::new();
        assert!(store.stat("bucket", "missing").await.unwrap().is_none());
        assert_eq!(store.generation_or_zero("bucket", "missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_store_reads_listing_entries() {
        let store = MemoryObjectStore::new();
        store.put("bucket", "list", b"junkID\nf,a.txt\n".to_vec(), 1);
        let result = store.read_from("bucket", "list", 0, 10).await.unwrap();
        assert_eq!(result.entries.len(), 1);
    }
}
