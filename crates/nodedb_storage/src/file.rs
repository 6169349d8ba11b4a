//! File-based embedded store.
//!
//! The store lives in a directory:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK          # Advisory lock for single-process access
//! └─ records.log   # Append-only record log
//! ```
//!
//! Every mutation appends one frame to the log. Opening the store replays the
//! log into an in-memory index; a torn frame at the tail (from a crash during
//! append) is cut off.
//!
//! Frame layout (little endian):
//!
//! ```text
//! | op: u8 | id_len: u32 | id | payload_len: u32 | payload |
//! ```

use crate::embedded::EmbeddedStore;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "records.log";
const LOG_TEMP: &str = "records.log.tmp";

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_SEQUENCE: u8 = 3;

/// A durable embedded store backed by an append-only log file.
///
/// # Thread Safety
///
/// Reads are served from the in-memory index. Appends are serialized by an
/// internal mutex.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    _lock_file: File,
    log: Mutex<File>,
    records: RwLock<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    sync_on_write: bool,
}

impl FileStore {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the store,
    /// or an I/O error.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Self::open_with_sync(path, false)
    }

    /// Opens a store that syncs the log after every appended frame.
    ///
    /// # Errors
    ///
    /// Same as [`FileStore::open`].
    pub fn open_with_sync(path: &Path, sync_on_write: bool) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOG_FILE))?;

        let (records, next_id, valid_len) = replay(&mut log)?;
        let file_len = log.metadata()?.len();
        if valid_len < file_len {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "truncating torn frame at end of record log"
            );
            log.set_len(valid_len)?;
        }
        log.seek(SeekFrom::End(0))?;

        tracing::debug!(path = %path.display(), records = records.len(), "opened file store");

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
            log: Mutex::new(log),
            records: RwLock::new(records),
            next_id: AtomicU64::new(next_id),
            sync_on_write,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log so it contains only live records.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the rewritten log cannot be installed.
    pub fn compact(&self) -> StorageResult<()> {
        let mut log = self.log.lock();
        let records = self.records.read();

        let temp_path = self.path.join(LOG_TEMP);
        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let next = self.next_id.load(Ordering::SeqCst);
        temp.write_all(&encode_frame(OP_SEQUENCE, &next.to_string(), &[]))?;
        for (id, payload) in records.iter() {
            temp.write_all(&encode_frame(OP_PUT, id, payload))?;
        }
        temp.sync_all()?;
        drop(temp);

        fs::rename(&temp_path, self.path.join(LOG_FILE))?;

        let mut reopened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path.join(LOG_FILE))?;
        reopened.seek(SeekFrom::End(0))?;
        *log = reopened;

        tracing::info!(path = %self.path.display(), records = records.len(), "compacted record log");
        Ok(())
    }

    fn append(&self, op: u8, id: &str, payload: &[u8]) -> StorageResult<()> {
        let frame = encode_frame(op, id, payload);
        let mut log = self.log.lock();
        log.write_all(&frame)?;
        if self.sync_on_write {
            log.sync_data()?;
        }
        Ok(())
    }
}

impl EmbeddedStore for FileStore {
    fn get(&self, id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn insert(&self, id: &str, record: &[u8]) -> StorageResult<()> {
        if self.records.read().contains_key(id) {
            return Err(StorageError::DuplicateId(id.to_string()));
        }
        self.append(OP_PUT, id, record)?;
        self.records.write().insert(id.to_string(), record.to_vec());
        Ok(())
    }

    fn update(&self, id: &str, record: &[u8]) -> StorageResult<()> {
        self.append(OP_PUT, id, record)?;
        self.records.write().insert(id.to_string(), record.to_vec());
        Ok(())
    }

    fn delete(&self, id: &str) -> StorageResult<()> {
        if !self.records.read().contains_key(id) {
            return Ok(());
        }
        self.append(OP_DELETE, id, &[])?;
        self.records.write().remove(id);
        Ok(())
    }

    fn next_id(&self) -> StorageResult<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        // Persist the high-water mark so ids are never reissued after restart.
        self.append(OP_SEQUENCE, &(id + 1).to_string(), &[])?;
        Ok(id.to_string())
    }

    fn flush(&self) -> StorageResult<()> {
        let log = self.log.lock();
        log.sync_data()?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

fn encode_frame(op: u8, id: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9 + id.len() + payload.len());
    frame.push(op);
    frame.extend_from_slice(&(id.len() as u32).to_le_bytes());
    frame.extend_from_slice(id.as_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Replays the log, returning the live records, the next id and the length
/// of the valid prefix.
fn replay(log: &mut File) -> StorageResult<(HashMap<String, Vec<u8>>, u64, u64)> {
    let mut bytes = Vec::new();
    log.seek(SeekFrom::Start(0))?;
    log.read_to_end(&mut bytes)?;

    let mut records = HashMap::new();
    let mut next_id = 1u64;
    let mut pos = 0usize;

    while pos < bytes.len() {
        let Some((op, id, payload, consumed)) = decode_frame(&bytes[pos..]) else {
            break;
        };
        let id = String::from_utf8(id.to_vec())
            .map_err(|_| StorageError::corrupted(format!("non UTF-8 id at offset {pos}")))?;

        match op {
            OP_PUT => {
                if let Ok(numeric) = id.parse::<u64>() {
                    next_id = next_id.max(numeric + 1);
                }
                records.insert(id, payload.to_vec());
            }
            OP_DELETE => {
                records.remove(&id);
            }
            OP_SEQUENCE => {
                let mark = id.parse::<u64>().map_err(|_| {
                    StorageError::corrupted(format!("bad sequence mark at offset {pos}"))
                })?;
                next_id = next_id.max(mark);
            }
            other => {
                return Err(StorageError::corrupted(format!(
                    "unknown frame op {other} at offset {pos}"
                )));
            }
        }
        pos += consumed;
    }

    Ok((records, next_id, pos as u64))
}

fn decode_frame(buf: &[u8]) -> Option<(u8, &[u8], &[u8], usize)> {
    let op = *buf.first()?;
    let id_len = u32::from_le_bytes(buf.get(1..5)?.try_into().ok()?) as usize;
    let id_end = 5 + id_len;
    let id = buf.get(5..id_end)?;
    let payload_len =
        u32::from_le_bytes(buf.get(id_end..id_end + 4)?.try_into().ok()?) as usize;
    let payload_start = id_end + 4;
    let payload = buf.get(payload_start..payload_start + payload_len)?;
    Some((op, id, payload, payload_start + payload_len))
}
