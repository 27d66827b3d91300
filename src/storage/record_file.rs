//! # Fixed-Record Mapped Files
//!
//! This module implements `RecordFile`, the lowest storage building block:
//! a memory-mapped file holding a count header followed by fixed-size
//! records. Every table catalog, element store, and variant catalog in a
//! database directory is a `RecordFile` with a different record size.
//!
//! ## File Format
//!
//! ```text
//! offset 0              : uint64 live-count (little-endian)
//! offset 8              : record 0 (record_size bytes)
//! offset 8 + k * size   : record k
//! trailing bytes        : unused capacity
//! ```
//!
//! New files start at 4096 bytes. When an append would exceed capacity the
//! file is flushed, extended to `max(size * 2, 8 + record_size)`, and
//! remapped. Compacted files are written at exactly `8 + count * size`;
//! growth resumes by doubling from that size.
//!
//! ## Soft Delete
//!
//! Records are never removed; `tombstone()` overwrites the full record with
//! 0xFF bytes and `iter_live()` skips such records. The sentinel is
//! unambiguous because a live composite record always carries at least one
//! null-bitmap byte whose unused high bits are zero, and null slots are
//! zeroed, so no live record can be all-ones.
//!
//! ## Safety Considerations
//!
//! Remapping invalidates every outstanding slice into the map. Like the
//! rest of the storage layer, `RecordFile` leans on the borrow checker
//! rather than runtime guards: `read()` borrows `&self`, while `append()`
//! and the other mutating calls take `&mut self`, so the compiler rejects
//! any record reference held across a growth.
//!
//! ## Ordering
//!
//! Appends flush the data region before publishing the new count, so a
//! same-process reader never observes a count that points at uninitialised
//! bytes. There is a window where the last append is durable but invisible;
//! that is the documented trade.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::{COUNT_HEADER_SIZE, INITIAL_FILE_SIZE};

#[derive(Debug)]
pub struct RecordFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    record_size: usize,
    count: u64,
    capacity: u64,
}

impl RecordFile {
    /// Creates a new record file of `INITIAL_FILE_SIZE` bytes with a zero
    /// count header.
    pub fn create<P: AsRef<Path>>(path: P, record_size: usize) -> Result<Self> {
        let path = path.as_ref();

        ensure!(record_size > 0, "record size must be non-zero");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create directory '{}'", parent.display()))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create record file '{}'", path.display()))?;

        file.set_len(INITIAL_FILE_SIZE as u64)
            .wrap_err_with(|| format!("failed to size '{}'", path.display()))?;

        // SAFETY: MmapMut::map_mut is unsafe because externally-modified
        // files invalidate the mapping. This is safe because:
        // 1. The file was just created with truncate and exclusive r/w access
        // 2. One engine owns a data directory at a time (enforced upstream)
        // 3. The mmap's lifetime is tied to this RecordFile
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let capacity = ((INITIAL_FILE_SIZE - COUNT_HEADER_SIZE) / record_size) as u64;

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            record_size,
            count: 0,
            capacity,
        })
    }

    /// Opens an existing record file, validating the header against the
    /// record size derived from the schema.
    pub fn open<P: AsRef<Path>>(path: P, record_size: usize) -> Result<Self> {
        let path = path.as_ref();

        ensure!(record_size > 0, "record size must be non-zero");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open record file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size >= COUNT_HEADER_SIZE as u64,
            "record file '{}' is shorter than its header ({} bytes)",
            path.display(),
            file_size
        );

        // SAFETY: see create(); additionally the size was validated above so
        // header reads below stay in bounds.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let count = u64::from_le_bytes(mmap[..COUNT_HEADER_SIZE].try_into().unwrap());
        let capacity = (file_size - COUNT_HEADER_SIZE as u64) / record_size as u64;

        ensure!(
            count <= capacity,
            "record file '{}' header claims {} records but capacity is {}",
            path.display(),
            count,
            capacity
        );

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            record_size,
            count,
            capacity,
        })
    }

    /// Opens `path` if it exists, otherwise creates it.
    pub fn open_or_create<P: AsRef<Path>>(path: P, record_size: usize) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path, record_size)
        } else {
            Self::create(path, record_size)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_offset(&self, index: u64) -> usize {
        COUNT_HEADER_SIZE + index as usize * self.record_size
    }

    fn grow(&mut self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let current = self.file.metadata()?.len();
        let new_size = (current * 2).max((COUNT_HEADER_SIZE + self.record_size) as u64);

        self.file.set_len(new_size).wrap_err_with(|| {
            format!("failed to extend '{}' to {} bytes", self.path.display(), new_size)
        })?;

        // SAFETY: grow takes &mut self, so no record slice can outlive the
        // old mapping; the old map was flushed and the file extended before
        // the remap, and the old map drops on assignment.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?
        };

        self.capacity = (new_size - COUNT_HEADER_SIZE as u64) / self.record_size as u64;
        Ok(())
    }

    fn publish_count(&mut self, count: u64) -> Result<()> {
        self.count = count;
        self.mmap[..COUNT_HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
        self.mmap
            .flush_range(0, COUNT_HEADER_SIZE)
            .wrap_err("failed to flush count header")
    }

    /// Appends one record and returns its index.
    pub fn append(&mut self, record: &[u8]) -> Result<u64> {
        ensure!(
            record.len() == self.record_size,
            "record is {} bytes, expected {} in '{}'",
            record.len(),
            self.record_size,
            self.path.display()
        );

        if self.count == self.capacity {
            self.grow()?;
        }

        let index = self.count;
        let offset = self.record_offset(index);
        self.mmap[offset..offset + self.record_size].copy_from_slice(record);
        self.mmap
            .flush_range(offset, self.record_size)
            .wrap_err("failed to flush appended record")?;

        self.publish_count(index + 1)?;
        Ok(index)
    }

    /// Appends `bytes.len() / record_size` records contiguously and returns
    /// the starting index. The count is published once, after the whole run
    /// is flushed.
    pub fn append_many(&mut self, bytes: &[u8]) -> Result<u64> {
        ensure!(
            bytes.len() % self.record_size == 0,
            "run of {} bytes is not a multiple of record size {} in '{}'",
            bytes.len(),
            self.record_size,
            self.path.display()
        );

        let n = (bytes.len() / self.record_size) as u64;
        if n == 0 {
            return Ok(self.count);
        }

        while self.count + n > self.capacity {
            self.grow()?;
        }

        let start = self.count;
        let offset = self.record_offset(start);
        self.mmap[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.mmap
            .flush_range(offset, bytes.len())
            .wrap_err("failed to flush appended run")?;

        self.publish_count(start + n)?;
        Ok(start)
    }

    /// Borrows the record at `index`.
    pub fn read(&self, index: u64) -> Result<&[u8]> {
        ensure!(
            index < self.count,
            "record {} out of bounds (count={}) in '{}'",
            index,
            self.count,
            self.path.display()
        );

        let offset = self.record_offset(index);
        Ok(&self.mmap[offset..offset + self.record_size])
    }

    /// Rewrites the record at `index` in place.
    pub fn overwrite(&mut self, index: u64, record: &[u8]) -> Result<()> {
        ensure!(
            record.len() == self.record_size,
            "record is {} bytes, expected {} in '{}'",
            record.len(),
            self.record_size,
            self.path.display()
        );
        ensure!(
            index < self.count,
            "record {} out of bounds (count={}) in '{}'",
            index,
            self.count,
            self.path.display()
        );

        let offset = self.record_offset(index);
        self.mmap[offset..offset + self.record_size].copy_from_slice(record);
        self.mmap
            .flush_range(offset, self.record_size)
            .wrap_err("failed to flush overwritten record")
    }

    /// Soft-deletes the record at `index` by overwriting it with 0xFF.
    /// The count header is never decremented.
    pub fn tombstone(&mut self, index: u64) -> Result<()> {
        ensure!(
            index < self.count,
            "record {} out of bounds (count={}) in '{}'",
            index,
            self.count,
            self.path.display()
        );

        let offset = self.record_offset(index);
        self.mmap[offset..offset + self.record_size].fill(0xFF);
        self.mmap
            .flush_range(offset, self.record_size)
            .wrap_err("failed to flush tombstone")
    }

    /// True when the entire record equals 0xFF.
    pub fn is_tombstoned(&self, index: u64) -> Result<bool> {
        Ok(self.read(index)?.iter().all(|&b| b == 0xFF))
    }

    /// Iterates `(index, bytes)` over every live (non-tombstoned) record.
    pub fn iter_live(&self) -> impl Iterator<Item = (u64, &[u8])> {
        (0..self.count).filter_map(move |index| {
            let offset = self.record_offset(index);
            let bytes = &self.mmap[offset..offset + self.record_size];
            if bytes.iter().all(|&b| b == 0xFF) {
                None
            } else {
                Some((index, bytes))
            }
        })
    }

    pub fn file_size(&self) -> u64 {
        (COUNT_HEADER_SIZE + self.capacity as usize * self.record_size) as u64
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to flush record file")
    }
}

impl Drop for RecordFile {
    fn drop(&mut self) {
        let _ = self.mmap.flush();
    }
}
