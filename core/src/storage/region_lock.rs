//! Region allocation atomicity lock.
//!
//! A tiny write-ahead log for file growth. Before the main storage file is extended, the range
//! being added is recorded as "in progress" in a sibling lock file and fsync'd. Once the extension
//! completes the record is resolved. A record still in progress on the next open means the
//! process died mid-growth and the range's bytes can't be trusted.
//!
//! ## Record format
//!
//! ```text
//! +--------+--------+----------+----------+--------+----------+
//! | magic  | state  | offset   | length   | crc32  | reserved |
//! | 4B     | 4B     | 8B       | 8B       | 4B     | 4B       |
//! +--------+--------+----------+----------+--------+----------+
//! ```
//!
//! All integers are little-endian. The checksum covers magic, offset and length; the state word
//! is rewritten in place when a record is resolved. When no record is left in progress the file
//! is truncated to zero length.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StorageResult;

/// Record magic: "RGNL"
const RECORD_MAGIC: u32 = u32::from_be_bytes(*b"RGNL");

/// Size of one on-disk record.
const RECORD_SIZE: usize = 32;

const STATE_IN_PROGRESS: u32 = 1;
const STATE_RESOLVED: u32 = 2;

/// Suffix appended to the storage file name to get the lock file name.
pub const LOCK_FILE_SUFFIX: &str = ".alloc-lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegionRecord {
    slot: u64,
    offset: u64,
    length: u64,
    in_progress: bool,
}

impl RegionRecord {
    fn checksum(offset: u64, length: u64) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&RECORD_MAGIC.to_le_bytes());
        hasher.update(&offset.to_le_bytes());
        hasher.update(&length.to_le_bytes());
        hasher.finalize()
    }

    fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let state = if self.in_progress {
            STATE_IN_PROGRESS
        } else {
            STATE_RESOLVED
        };
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&state.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.length.to_le_bytes());
        buf[24..28].copy_from_slice(&Self::checksum(self.offset, self.length).to_le_bytes());
        buf
    }

    /// Decode one record; `None` for torn or foreign bytes.
    fn from_bytes(slot: u64, buf: &[u8]) -> Option<Self> {
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let dword = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        if word(0) != RECORD_MAGIC {
            return None;
        }
        let offset = dword(8);
        let length = dword(16);
        if word(24) != Self::checksum(offset, length) {
            return None;
        }
        Some(Self {
            slot,
            offset,
            length,
            // Anything but an explicit resolution counts as unfinished
            in_progress: word(4) != STATE_RESOLVED,
        })
    }

    fn overlaps(&self, offset: u64, length: u64) -> bool {
        ranges_overlap(self.offset, self.length, offset, length)
    }
}

fn ranges_overlap(a_offset: u64, a_length: u64, b_offset: u64, b_length: u64) -> bool {
    a_length > 0
        && b_length > 0
        && a_offset < b_offset.saturating_add(b_length)
        && b_offset < a_offset.saturating_add(a_length)
}

#[derive(Debug, Default)]
struct LockState {
    /// Opened lazily by the first `start()`.
    file: Option<File>,
    records: Vec<RegionRecord>,
}

/// Persistent record of in-progress region allocations for one storage file.
#[derive(Debug)]
pub struct RegionAllocationAtomicityLock {
    lock_path: PathBuf,
    state: Mutex<LockState>,
    #[cfg(test)]
    fail_next_finish: std::sync::atomic::AtomicBool,
}

impl RegionAllocationAtomicityLock {
    /// Get the lock associated with `storage_path`, loading any records left by a previous run.
    pub fn default_lock<P: AsRef<Path>>(storage_path: P) -> StorageResult<Self> {
        let lock_path = Self::lock_path_for(storage_path.as_ref());
        let records = Self::load_records(&lock_path)?;

        let unfinished = records.iter().filter(|r| r.in_progress).count();
        if unfinished > 0 {
            warn!(
                path = %lock_path.display(),
                unfinished,
                "found unfinished region allocations"
            );
        }

        Ok(Self {
            lock_path,
            state: Mutex::new(LockState {
                file: None,
                records,
            }),
            #[cfg(test)]
            fail_next_finish: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Path of the lock file that accompanies `storage_path`.
    pub fn lock_path_for(storage_path: &Path) -> PathBuf {
        let mut name = storage_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(LOCK_FILE_SUFFIX);
        storage_path.with_file_name(name)
    }

    fn load_records(lock_path: &Path) -> StorageResult<Vec<RegionRecord>> {
        let mut bytes = Vec::new();
        match File::open(lock_path) {
            Ok(mut file) => {
                file.read_to_end(&mut bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        // A trailing partial record is a torn start(): the main file was never touched for it
        Ok(bytes
            .chunks_exact(RECORD_SIZE)
            .enumerate()
            .filter_map(|(slot, chunk)| RegionRecord::from_bytes(slot as u64, chunk))
            .collect())
    }

    /// Get a handle for the byte range `[offset, offset + length)`.
    pub fn region(&self, offset: u64, length: u64) -> Region<'_> {
        Region {
            lock: self,
            offset,
            length,
        }
    }

    /// All regions whose allocation was started but never finished.
    pub fn unfinished_regions(&self) -> Vec<(u64, u64)> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.in_progress)
            .map(|r| (r.offset, r.length))
            .collect()
    }

    /// Path of the lock file.
    pub fn lock_file_path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove the lock file and forget all records.
    pub fn delete(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.file = None;
        state.records.clear();
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_file<'s>(lock_path: &Path, slot: &'s mut Option<File>) -> StorageResult<&'s mut File> {
        if slot.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(lock_path)?;
            *slot = Some(file);
        }
        slot.as_mut()
            .ok_or_else(|| std::io::Error::other("lock file unavailable").into())
    }

    fn start(&self, offset: u64, length: u64) -> StorageResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let file = Self::lock_file(&self.lock_path, &mut state.file)?;

        // Compact: nothing in flight means every stored record is dead weight
        if state.records.iter().all(|r| !r.in_progress) {
            file.set_len(0)?;
            state.records.clear();
        }

        // Append after everything on disk, corrupt records included; a torn tail is overwritten
        let slot = file.metadata()?.len() / RECORD_SIZE as u64;
        let record = RegionRecord {
            slot,
            offset,
            length,
            in_progress: true,
        };
        file.seek(SeekFrom::Start(record.slot * RECORD_SIZE as u64))?;
        file.write_all(&record.to_bytes())?;
        file.sync_data()?;

        state.records.push(record);
        debug!(offset, length, "region allocation started");
        Ok(())
    }

    /// Make the next `finish()` fail with an I/O error before touching the lock file.
    #[cfg(test)]
    pub(crate) fn fail_next_finish(&self) {
        self.fail_next_finish
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_finish_failure(&self) -> StorageResult<()> {
        if self
            .fail_next_finish
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(std::io::Error::other("lock file write failed").into());
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[inline]
    fn injected_finish_failure(&self) -> StorageResult<()> {
        Ok(())
    }

    fn finish(&self, offset: u64, length: u64) -> StorageResult<()> {
        self.injected_finish_failure()?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let resolved: Vec<usize> = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.in_progress && r.overlaps(offset, length))
            .map(|(i, _)| i)
            .collect();
        if resolved.is_empty() {
            return Ok(());
        }

        let remaining = state
            .records
            .iter()
            .filter(|r| r.in_progress)
            .count()
            - resolved.len();

        // Records may have been loaded from a previous run without the file being opened yet
        let file = Self::lock_file(&self.lock_path, &mut state.file)?;

        if remaining == 0 {
            file.set_len(0)?;
            file.sync_data()?;
            state.records.clear();
        } else {
            for &i in &resolved {
                let record = &mut state.records[i];
                record.in_progress = false;
                file.seek(SeekFrom::Start(record.slot * RECORD_SIZE as u64 + 4))?;
                file.write_all(&STATE_RESOLVED.to_le_bytes())?;
            }
            file.sync_data()?;
        }

        debug!(offset, length, remaining, "region allocation finished");
        Ok(())
    }

    fn is_unfinished(&self, offset: u64, length: u64) -> bool {
        self.state
            .lock()
            .records
            .iter()
            .any(|r| r.in_progress && r.overlaps(offset, length))
    }
}

/// One allocation attempt over `[offset, offset + length)`.
///
/// Dropping a started region without calling [`Region::finish`] leaves it marked in progress,
/// exactly as a crash would.
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    lock: &'a RegionAllocationAtomicityLock,
    offset: u64,
    length: u64,
}

impl Region<'_> {
    /// Durably mark this region's allocation as begun.
    pub fn start(&self) -> StorageResult<()> {
        self.lock.start(self.offset, self.length)
    }

    /// Mark this region, and any earlier unfinished attempt overlapping it, as resolved.
    pub fn finish(&self) -> StorageResult<()> {
        self.lock.finish(self.offset, self.length)
    }

    /// Whether an unresolved allocation overlaps this region.
    pub fn is_unfinished(&self) -> bool {
        self.lock.is_unfinished(self.offset, self.length)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}
