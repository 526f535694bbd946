//! Write-ahead journal backing the persistent store.
//!
//! The journal is the store's only data file. Every schema upgrade and every
//! committed write transaction is appended as one frame:
//!
//! ```text
//! [len: u32 LE][rmp-serde payload][crc32: u32 LE]
//! ```
//!
//! On open the frames are replayed in order. A torn or corrupt frame ends the
//! replay and the file is truncated back to the last good frame, so a
//! transaction is either fully applied or not at all.

use crate::error::{Result, TrackerError};
use crate::store::{SchemaOp, TableDef, WriteOp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// Magic bytes for journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"MDJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Magic + version.
const HEADER_LEN: u64 = 5;

/// Sanity limit for a single frame.
const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// A single journal frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// One migration run, moving the schema from `from` to `to`.
    Upgrade {
        from: u32,
        to: u32,
        ops: Vec<SchemaOp>,
    },
    /// One committed write transaction.
    Commit { seq: u64, ops: Vec<WriteOp> },
    /// Full database image written by compaction.
    Snapshot {
        version: u32,
        seq: u64,
        tables: Vec<TableSnapshot>,
    },
}

/// Contents of one table inside a [`JournalEntry::Snapshot`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub def: TableDef,
    pub rows: Vec<(String, Value)>,
}

/// Append-only journal file.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    sync_on_append: bool,
    /// Set when a failed append could not be cut back off the file.
    poisoned: AtomicBool,
}

impl Journal {
    /// Create or open a journal, returning the entries that survived replay.
    pub fn open(path: impl AsRef<Path>, sync_on_append: bool) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let has_header = path.exists() && fs::metadata(&path)?.len() >= HEADER_LEN;
        let entries = if has_header {
            Self::replay(&path)?
        } else {
            // Missing or cut off before the header was complete.
            Self::write_fresh(&path, &[])?;
            Vec::new()
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok((
            Self {
                path,
                writer: Mutex::new(BufWriter::new(file)),
                sync_on_append,
                poisoned: AtomicBool::new(false),
            },
            entries,
        ))
    }

    /// Read every intact frame and drop whatever follows the last one.
    fn replay(path: &Path) -> Result<Vec<JournalEntry>> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        // Verify header
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(TrackerError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(TrackerError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut valid_len = HEADER_LEN;
        while valid_len < file_len {
            match Self::read_frame(&mut reader) {
                Ok((entry, frame_len)) => {
                    entries.push(entry);
                    valid_len += frame_len;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = valid_len,
                        discarded = file_len - valid_len,
                        error = %e,
                        "discarding torn journal tail"
                    );
                    break;
                }
            }
        }

        if valid_len < file_len {
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }

        debug!(path = %path.display(), frames = entries.len(), "replayed journal");
        Ok(entries)
    }

    /// Append one frame and flush it.
    ///
    /// On failure the file is truncated back to its previous length, so a
    /// later append never lands behind a partial frame.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let frame = Self::encode_frame(entry, MAX_FRAME_LEN)?;
        let sync = self.sync_on_append;
        self.write_guarded(|writer| {
            writer.write_all(&frame)?;
            writer.flush()?;
            if sync {
                writer.get_ref().sync_all()?;
            }
            Ok(())
        })
    }

    fn write_guarded<F>(&self, write: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(TrackerError::Corruption(
                "journal holds a partial frame from a failed append".into(),
            ));
        }

        let mut writer = self.writer.lock();
        writer.flush()?;
        let len = writer.get_ref().metadata()?.len();

        let Err(e) = write(&mut *writer) else {
            return Ok(());
        };
        if let Err(rollback) = self.roll_back(&mut *writer, len) {
            error!(
                path = %self.path.display(),
                error = %rollback,
                "could not truncate failed journal append"
            );
            self.poisoned.store(true, Ordering::Release);
        }
        Err(e.into())
    }

    /// Drop the buffered bytes of a failed frame and cut the file to `len`.
    fn roll_back(&self, writer: &mut BufWriter<File>, len: u64) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let failed = std::mem::replace(writer, BufWriter::new(file));
        let (failed, _unwritten) = failed.into_parts();
        failed.set_len(len)?;
        warn!(path = %self.path.display(), len, "rolled back failed journal append");
        Ok(())
    }

    /// Atomically replace the journal with `entries`.
    pub fn rewrite(&self, entries: &[JournalEntry]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let tmp = self.path.with_extension("log.tmp");
        Self::write_fresh(&tmp, entries)?;
        fs::rename(&tmp, &self.path)?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.poisoned.store(false, Ordering::Release);
        Ok(())
    }

    /// Current size of the journal file in bytes.
    pub fn size(&self) -> Result<u64> {
        self.writer.lock().flush()?;
        Ok(fs::metadata(&self.path)?.len())
    }

    fn write_fresh(path: &Path, entries: &[JournalEntry]) -> Result<()> {
        let mut writer = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        );

        writer.write_all(JOURNAL_MAGIC)?;
        writer.write_all(&[JOURNAL_VERSION])?;
        for entry in entries {
            writer.write_all(&Self::encode_frame(entry, MAX_FRAME_LEN)?)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn encode_frame(entry: &JournalEntry, max_len: usize) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec(entry)?;
        if encoded.len() > max_len {
            return Err(TrackerError::InvalidFormat(format!(
                "journal frame of {} bytes exceeds the {} byte limit",
                encoded.len(),
                max_len
            )));
        }

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
        Ok(frame)
    }

    /// Returns the entry and the number of bytes the frame occupied.
    fn read_frame<R: Read>(reader: &mut R) -> Result<(JournalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_LEN {
            return Err(TrackerError::Corruption("Journal frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);

        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(TrackerError::ChecksumMismatch { expected, got });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok((entry, 8 + len as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn commit(seq: u64, key: &str) -> JournalEntry {
        JournalEntry::Commit {
            seq,
            ops: vec![WriteOp::Put {
                table: "meta".into(),
                key: key.into(),
                value: json!({ "key": key, "value": seq }),
            }],
        }
    }

    #[test]
    fn test_journal_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (journal, entries) = Journal::open(&path, true).unwrap();
            assert!(entries.is_empty());
            journal.append(&commit(1, "a")).unwrap();
            journal.append(&commit(2, "b")).unwrap();
        }

        let (_journal, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries, vec![commit(1, "a"), commit(2, "b")]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (journal, _) = Journal::open(&path, true).unwrap();
            journal.append(&commit(1, "a")).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();

        // Half-written second frame.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&200u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let (journal, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries, vec![commit(1, "a")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        journal.append(&commit(2, "b")).unwrap();
        drop(journal);

        let (_journal, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_corrupt_frame_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (journal, _) = Journal::open(&path, true).unwrap();
            journal.append(&commit(1, "a")).unwrap();
            journal.append(&commit(2, "b")).unwrap();
        }

        // Flip the last byte of the second frame's checksum.
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let (_journal, entries) = Journal::open(&path, true).unwrap();
        assert_eq!(entries, vec![commit(1, "a")]);
    }

    #[test]
    fn test_invalid_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        fs::write(&path, b"NOPE\x01").unwrap();

        let result = Journal::open(&path, true);
        assert!(matches!(result, Err(TrackerError::InvalidFormat(_))));
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        let (journal, _) = Journal::open(&path, false).unwrap();
        for seq in 1..=10 {
            journal.append(&commit(seq, "k")).unwrap();
        }
        let before = journal.size().unwrap();

        journal.rewrite(&[commit(10, "k")]).unwrap();
        assert!(journal.size().unwrap() < before);

        journal.append(&commit(11, "k")).unwrap();
        drop(journal);

        let (_journal, entries) = Journal::open(&path, false).unwrap();
        assert_eq!(entries, vec![commit(10, "k"), commit(11, "k")]);
    }

    #[test]
    fn test_failed_append_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        let (journal, _) = Journal::open(&path, false).unwrap();
        journal.append(&commit(1, "a")).unwrap();
        let good_len = journal.size().unwrap();

        // Part of a frame reaches the file before the write fails.
        let frame = Journal::encode_frame(&commit(2, "lost"), MAX_FRAME_LEN).unwrap();
        let result = journal.write_guarded(|writer| {
            writer.write_all(&frame[..6])?;
            writer.flush()?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        });
        assert!(matches!(result, Err(TrackerError::Io(_))));
        assert_eq!(journal.size().unwrap(), good_len);

        journal.append(&commit(3, "b")).unwrap();
        drop(journal);

        let (_journal, entries) = Journal::open(&path, false).unwrap();
        assert_eq!(entries, vec![commit(1, "a"), commit(3, "b")]);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let entry = commit(1, "a");
        let small = Journal::encode_frame(&entry, MAX_FRAME_LEN).unwrap();
        let payload_len = small.len() - 8;

        assert!(Journal::encode_frame(&entry, payload_len).is_ok());
        assert!(matches!(
            Journal::encode_frame(&entry, payload_len - 1),
            Err(TrackerError::InvalidFormat(_))
        ));
    }
}
