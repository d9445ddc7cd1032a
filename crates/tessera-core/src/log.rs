//! The store file: header, batch appends and replay
//!
//! A store is one file:
//!
//! ```text
//! FileHeader (32 bytes) | batch | batch | ...
//! batch = Begin, (Put | Delete)*, Commit(sequence)
//! ```
//!
//! WRITE ORDERING: a batch is serialized completely in memory, appended with a
//! single write while the append lock is held, then durably synced. Only after
//! that does the caller apply it to RAM.
//!
//! Replay applies a batch only when its Commit entry is intact. A torn tail
//! stops replay at the last complete commit. A corrupt entry poisons the batch
//! it belongs to and replay resynchronises on the next intact entry header.
//! An entry that runs past end of file is only a torn tail when no intact
//! entry follows it; otherwise its length is corrupt.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::format::{deserialize_entry, entry_size, header_intact, LogEntry, Operation, HEADER_SIZE, MAGIC_ARRAY};
use crate::locks::{LockTable, APPEND_LOCK_OFFSET};
use crate::platform::{durable_sync, lock_byte, unlock_byte};

/// File header magic: "TSRF"
const FILE_MAGIC: [u8; 4] = [0x54, 0x53, 0x52, 0x46];

/// On-disk format version
const FORMAT_VERSION: u32 = 1;

/// Size of the file header; batches start here
pub const FILE_HEADER_SIZE: u64 = 32;

/// Files open in this process, keyed by canonical path.
///
/// POSIX releases every fcntl lock a process holds on a file when ANY of its
/// descriptors for that file is closed, so handles on the same path share one
/// descriptor and one lock table.
static OPEN_FILES: OnceLock<Mutex<HashMap<PathBuf, Weak<StoreFile>>>> = OnceLock::new();

/// One open store file, shared by every handle on the same path in this process.
pub struct StoreFile {
    file: File,
    path: PathBuf,
    hash_size: usize,
    locks: LockTable,
}

/// One committed batch read back from the file
#[derive(Debug)]
pub struct Batch {
    /// Put/Delete entries in write order
    pub ops: Vec<LogEntry>,
    /// Modification counter after this batch
    pub sequence: u64,
}

/// Result of replaying a region of the file
#[derive(Debug, Default)]
pub struct Replay {
    pub batches: Vec<Batch>,
    /// Offset just past the last Commit consumed (applied or discarded)
    pub end_offset: u64,
    /// Entries skipped because they were corrupt
    pub corrupt_entries: usize,
}

impl StoreFile {
    /// Open (creating if needed) the store file at `path`, sharing an existing
    /// in-process handle when one is live.
    ///
    /// `hash_size` only applies to a brand-new file; an existing file keeps the
    /// chain count recorded in its header.
    pub fn open_shared(path: &Path, hash_size: usize) -> StoreResult<Arc<StoreFile>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io(parent, e, "Failed to create store directory"))?;
            }
        }

        let canonical = canonical_path(path)?;

        let mut registry = OPEN_FILES.get_or_init(|| Mutex::new(HashMap::new())).lock();
        if let Some(existing) = registry.get(&canonical).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&canonical)
            .map_err(|e| StoreError::io(path, e, "Failed to open store file"))?;

        let hash_size = Self::init_header(&file, &canonical, hash_size)?;
        let shared = Arc::new(StoreFile {
            file,
            path: canonical.clone(),
            hash_size,
            locks: LockTable::new(hash_size),
        });
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(canonical, Arc::downgrade(&shared));
        Ok(shared)
    }

    /// Write the header of an empty file, or validate an existing one.
    /// Returns the file's chain count.
    fn init_header(file: &File, path: &Path, hash_size: usize) -> StoreResult<usize> {
        // Another process may be creating the file at the same moment.
        lock_byte(file, APPEND_LOCK_OFFSET, true)
            .map_err(|e| StoreError::io(path, e, "Failed to lock store file header"))?;
        let result = Self::init_header_locked(file, path, hash_size);
        if let Err(e) = unlock_byte(file, APPEND_LOCK_OFFSET) {
            warn!(path = %path.display(), error = %e, "failed to unlock store file header");
        }
        result
    }

    fn init_header_locked(file: &File, path: &Path, hash_size: usize) -> StoreResult<usize> {
        let len = file_len(file, path)?;
        if len == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE as usize];
            header[0..4].copy_from_slice(&FILE_MAGIC);
            header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
            header[8..12].copy_from_slice(&(hash_size as u32).to_le_bytes());
            let checksum = crc32c::crc32c(&header[0..12]);
            header[12..16].copy_from_slice(&checksum.to_le_bytes());

            let mut writer = file;
            writer
                .write_all(&header)
                .map_err(|e| StoreError::io(path, e, "Failed to write store file header"))?;
            durable_sync(file).map_err(|e| StoreError::io(path, e, "Failed to sync store file header"))?;
            debug!(path = %path.display(), hash_size, "created store file");
            return Ok(hash_size);
        }

        if len < FILE_HEADER_SIZE {
            return Err(StoreError::LogCorrupted {
                path: path.to_path_buf(),
                offset: 0,
                reason: format!("File header truncated: {} of {} bytes", len, FILE_HEADER_SIZE),
            });
        }

        let header = read_range(file, path, 0, FILE_HEADER_SIZE as usize)?;
        if header[0..4] != FILE_MAGIC {
            return Err(StoreError::NoMagicFound {
                path: path.to_path_buf(),
                offset: 0,
                found_bytes: [header[0], header[1], header[2], header[3]],
            });
        }
        let expected = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let actual = crc32c::crc32c(&header[0..12]);
        if expected != actual {
            return Err(StoreError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                actual,
                offset: 0,
            });
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(StoreError::LogCorrupted {
                path: path.to_path_buf(),
                offset: 4,
                reason: format!("Unsupported format version {}", version),
            });
        }
        let stored = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if stored == 0 {
            return Err(StoreError::LogCorrupted {
                path: path.to_path_buf(),
                offset: 8,
                reason: "Header records zero hash chains".to_string(),
            });
        }
        if stored != hash_size {
            debug!(path = %path.display(), configured = hash_size, stored, "using chain count from file header");
        }
        Ok(stored)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub(crate) fn raw(&self) -> &File {
        &self.file
    }

    /// Current file length in bytes
    pub(crate) fn size(&self) -> StoreResult<u64> {
        file_len(&self.file, &self.path)
    }

    /// Append a serialized batch. The caller must hold the append lock.
    ///
    /// Returns the file offset just past the batch. On failure the file is
    /// truncated back to its previous length (best effort); replay would
    /// discard the partial batch anyway because it has no Commit entry.
    pub fn append_batch(&self, batch: &[u8], sync: bool) -> StoreResult<u64> {
        let start = self.size()?;

        let mut writer = &self.file;
        let result = writer
            .write_all(batch)
            .map_err(|e| StoreError::io(&self.path, e, "Store write failed"))
            .and_then(|_| {
                if sync {
                    durable_sync(&self.file).map_err(|e| StoreError::io(&self.path, e, "Store durable_sync failed"))
                } else {
                    Ok(())
                }
            });

        if let Err(e) = result {
            if let Err(trunc) = self.file.set_len(start) {
                warn!(path = %self.path.display(), error = %trunc, "failed to truncate partial batch");
            }
            return Err(e);
        }
        Ok(start + batch.len() as u64)
    }

    /// Cut off a torn tail. The caller must hold the append lock and have
    /// replayed up to `len`, so nothing past it belongs to a committed batch.
    pub fn truncate_to(&self, len: u64) -> StoreResult<()> {
        let size = self.size()?;
        if size <= len {
            return Ok(());
        }
        warn!(path = %self.path.display(), offset = len, bytes = size - len, "truncating torn tail");
        self.file
            .set_len(len)
            .map_err(|e| StoreError::io(&self.path, e, "Failed to truncate torn tail"))
    }

    /// Flush everything appended so far to persistent storage.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| StoreError::io(&self.path, e, "Store sync failed"))
    }

    /// Read and replay every batch from `from` to the current end of file.
    pub fn replay_from(&self, from: u64) -> StoreResult<Replay> {
        let len = self.size()?;
        if len <= from {
            return Ok(Replay { end_offset: from, ..Replay::default() });
        }
        let buffer = read_range(&self.file, &self.path, from, (len - from) as usize)?;
        Ok(replay(&buffer, from, &self.path))
    }
}

/// Parse batches out of `buffer`, which starts at file offset `base`.
pub fn replay(buffer: &[u8], base: u64, path: &Path) -> Replay {
    let mut out = Replay { end_offset: base, ..Replay::default() };
    // None while outside a batch or inside a damaged one
    let mut pending: Option<Vec<LogEntry>> = None;
    let mut offset = 0usize;

    while offset + HEADER_SIZE <= buffer.len() {
        if !header_intact(&buffer[offset..]) {
            warn!(offset = base + offset as u64, "bad entry header in store file, scanning for next entry");
            out.corrupt_entries += 1;
            pending = None;
            match find_next_entry(buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        let size = match entry_size(&buffer[offset..]) {
            Some(size) => size,
            None => break,
        };
        if offset + size > buffer.len() {
            if let Some(next) = find_next_entry(buffer, offset + 1) {
                warn!(
                    offset = base + offset as u64,
                    claimed = size,
                    "entry overruns later entries, skipping batch"
                );
                out.corrupt_entries += 1;
                pending = None;
                offset = next;
                continue;
            }
            // Torn write or a batch another writer is still appending.
            debug!(
                offset = base + offset as u64,
                need = size,
                have = buffer.len() - offset,
                "incomplete entry at end of store file"
            );
            break;
        }

        let entry = match deserialize_entry(&buffer[offset..offset + size], path, base + offset as u64) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(offset = base + offset as u64, error = %e, "corrupt entry in store file, skipping batch");
                out.corrupt_entries += 1;
                pending = None;
                match find_next_entry(buffer, offset + 1) {
                    Some(next) => {
                        offset = next;
                        continue;
                    }
                    None => break,
                }
            }
        };
        offset += size;

        match entry.operation {
            Operation::Begin => {
                if pending.as_ref().is_some_and(|ops| !ops.is_empty()) {
                    warn!(offset = base + offset as u64, "discarding unfinished batch");
                }
                pending = Some(Vec::new());
            }
            Operation::Put | Operation::Delete => {
                if let Some(ops) = pending.as_mut() {
                    ops.push(entry);
                }
            }
            Operation::Commit => {
                let sequence = entry.commit_sequence();
                match (pending.take(), sequence) {
                    (Some(ops), Some(sequence)) => {
                        out.batches.push(Batch { ops, sequence });
                    }
                    _ => {
                        warn!(offset = base + offset as u64, "discarding damaged batch");
                    }
                }
                out.end_offset = base + offset as u64;
            }
        }
    }

    out
}

/// Scan forward in buffer for the next entry with an intact header.
fn find_next_entry(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(HEADER_SIZE - 1))
        .find(|&i| buffer[i..i + 4] == MAGIC_ARRAY && header_intact(&buffer[i..]))
}

/// Canonical form of a store path whose final component may not exist yet.
fn canonical_path(path: &Path) -> StoreResult<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        StoreError::InvalidState(format!("Store path {} has no file name", path.display()))
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let parent = std::fs::canonicalize(parent)
        .map_err(|e| StoreError::io(parent, e, "Failed to resolve store directory"))?;
    Ok(parent.join(name))
}

fn file_len(file: &File, path: &Path) -> StoreResult<u64> {
    file.metadata()
        .map(|m| m.len())
        .map_err(|e| StoreError::io(path, e, "Failed to stat store file"))
}

#[cfg(unix)]
fn read_range(file: &File, path: &Path, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
    use std::os::unix::fs::FileExt;

    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| StoreError::io(path, e, "Failed to read store file"))?;
    Ok(buf)
}

#[cfg(windows)]
fn read_range(file: &File, path: &Path, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
    use std::os::windows::fs::FileExt;

    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file
            .seek_read(&mut buf[filled..], offset + filled as u64)
            .map_err(|e| StoreError::io(path, e, "Failed to read store file"))?;
        if n == 0 {
            return Err(StoreError::io(
                path,
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
                "Store file shrank during read",
            ));
        }
        filled += n;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::serialize_batch;
    use tempfile::TempDir;

    fn put(key: &[u8], value: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
        (key.to_vec(), Some(value.to_vec()))
    }

    #[test]
    fn test_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let file = StoreFile::open_shared(&temp.path().join("a.tdb"), 17).unwrap();

        let b1 = serialize_batch(&[put(b"k1", b"v1"), put(b"k2", b"v2")], 2).unwrap();
        let b2 = serialize_batch(&[(b"k1".to_vec(), None)], 3).unwrap();
        file.append_batch(&b1, true).unwrap();
        let end = file.append_batch(&b2, true).unwrap();

        let replay = file.replay_from(FILE_HEADER_SIZE).unwrap();
        assert_eq!(replay.batches.len(), 2);
        assert_eq!(replay.batches[0].ops.len(), 2);
        assert_eq!(replay.batches[1].ops[0].operation, Operation::Delete);
        assert_eq!(replay.batches[1].sequence, 3);
        assert_eq!(replay.end_offset, end);
    }

    #[test]
    fn test_uncommitted_tail_is_ignored() {
        let temp = TempDir::new().unwrap();
        let file = StoreFile::open_shared(&temp.path().join("b.tdb"), 17).unwrap();

        let good = serialize_batch(&[put(b"keep", b"1")], 1).unwrap();
        let end = file.append_batch(&good, true).unwrap();

        // Crash mid-batch: Begin + Put made it, Commit did not.
        let mut partial = serialize_batch(&[put(b"lost", b"2")], 2).unwrap();
        partial.truncate(partial.len() - 10);
        file.append_batch(&partial, true).unwrap();

        let replay = file.replay_from(FILE_HEADER_SIZE).unwrap();
        assert_eq!(replay.batches.len(), 1);
        assert_eq!(replay.batches[0].ops[0].key, b"keep");
        assert_eq!(replay.end_offset, end);
    }

    #[test]
    fn test_corrupt_entry_poisons_only_its_batch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("c.tdb");
        let file = StoreFile::open_shared(&path, 17).unwrap();

        let b1 = serialize_batch(&[put(b"a", b"1")], 1).unwrap();
        let b2 = serialize_batch(&[put(b"b", b"2")], 2).unwrap();
        let b3 = serialize_batch(&[put(b"c", b"3")], 3).unwrap();
        let end1 = file.append_batch(&b1, true).unwrap();
        file.append_batch(&b2, true).unwrap();
        file.append_batch(&b3, true).unwrap();

        // Flip a byte inside b2's Put payload (past its Begin entry + header).
        let mut data = std::fs::read(&path).unwrap();
        let target = end1 as usize + HEADER_SIZE + 8 + HEADER_SIZE + 9;
        data[target] ^= 0xFF;

        let replay = replay(&data[FILE_HEADER_SIZE as usize..], FILE_HEADER_SIZE, &path);
        let keys: Vec<&[u8]> = replay.batches.iter().map(|b| b.ops[0].key.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"c"[..]]);
        assert_eq!(replay.corrupt_entries, 1);
    }

    #[test]
    fn test_corrupt_length_resyncs_instead_of_stopping() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("g.tdb");
        let file = StoreFile::open_shared(&path, 17).unwrap();

        let b1 = serialize_batch(&[put(b"a", b"1")], 1).unwrap();
        let b2 = serialize_batch(&[put(b"b", b"2")], 2).unwrap();
        let b3 = serialize_batch(&[put(b"c", b"3")], 3).unwrap();
        let end1 = file.append_batch(&b1, true).unwrap();
        file.append_batch(&b2, true).unwrap();
        let end3 = file.append_batch(&b3, true).unwrap();

        // High byte of the length field of b2's Put entry.
        let mut data = std::fs::read(&path).unwrap();
        let target = end1 as usize + HEADER_SIZE + 8 + 7;
        data[target] = 0x7F;

        let replay = replay(&data[FILE_HEADER_SIZE as usize..], FILE_HEADER_SIZE, &path);
        let keys: Vec<&[u8]> = replay.batches.iter().map(|b| b.ops[0].key.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], &b"c"[..]]);
        assert_eq!(replay.end_offset, end3);
    }

    #[test]
    fn test_handles_share_one_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("d.tdb");
        let a = StoreFile::open_shared(&path, 17).unwrap();
        let b = StoreFile::open_shared(&path, 99).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.hash_size(), 17);
    }

    #[test]
    fn test_reopen_keeps_header_chain_count() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("e.tdb");
        drop(StoreFile::open_shared(&path, 23).unwrap());
        let reopened = StoreFile::open_shared(&path, 131).unwrap();
        assert_eq!(reopened.hash_size(), 23);
    }

    #[test]
    fn test_bad_header_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f.tdb");
        std::fs::write(&path, [0u8; 40]).unwrap();
        assert!(matches!(StoreFile::open_shared(&path, 17), Err(StoreError::NoMagicFound { .. })));
    }
}
