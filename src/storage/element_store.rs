//! # Element Stores
//!
//! An `ElementStore` is a `RecordFile` whose records are single elements of
//! one component type: characters for every string, bytes for every uint8
//! array, run pairs for every nested array, indices for every array of
//! composites. One store per element type serves the whole database, so the
//! slot `(start, length)` of any array, string, set, or dictionary field is
//! a run inside the store shared by every other field with the same element
//! type.
//!
//! Runs are append-only. The empty run is `(0, 0)` and consumes no space.
//! Replaced runs become garbage that only compaction reclaims.

use std::path::Path;

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::RecordFile;

/// On-disk `(start, length)` pair referencing a run in an element store.
///
/// This is both the slot encoding for array/string/set/dictionary fields
/// and the record format of stores whose elements are themselves
/// variable-length (e.g. the `string` store backing `string[]`).
#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct RunRef {
    start: U32,
    len: U32,
}

pub const RUN_REF_SIZE: usize = 8;

const _: () = assert!(std::mem::size_of::<RunRef>() == RUN_REF_SIZE);

impl RunRef {
    pub fn new(start: u32, len: u32) -> Self {
        Self {
            start: U32::new(start),
            len: U32::new(len),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    pub fn start(&self) -> u32 {
        self.start.get()
    }

    pub fn len(&self) -> u32 {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    pub fn from_slot(slot: &[u8]) -> Result<Self> {
        let run = Self::read_from_bytes(&slot[..RUN_REF_SIZE])
            .map_err(|e| eyre::eyre!("malformed run slot: {:?}", e))?;
        Ok(run)
    }
}

#[derive(Debug)]
pub struct ElementStore {
    file: RecordFile,
}

impl ElementStore {
    pub fn open_or_create<P: AsRef<Path>>(path: P, element_width: usize) -> Result<Self> {
        Ok(Self {
            file: RecordFile::open_or_create(path, element_width)?,
        })
    }

    pub fn element_width(&self) -> usize {
        self.file.record_size()
    }

    pub fn count(&self) -> u64 {
        self.file.count()
    }

    /// Appends a contiguous run of elements and returns its `RunRef`.
    pub fn insert_run(&mut self, bytes: &[u8]) -> Result<RunRef> {
        if bytes.is_empty() {
            return Ok(RunRef::empty());
        }

        let start = self.file.append_many(bytes)?;
        let len = bytes.len() / self.element_width();

        ensure!(
            start <= u32::MAX as u64 && len <= u32::MAX as usize,
            "element store '{}' overflowed the 32-bit run address space",
            self.file.path().display()
        );

        Ok(RunRef::new(start as u32, len as u32))
    }

    /// Copies the run's raw bytes out of the store.
    pub fn read_run(&self, run: RunRef) -> Result<Vec<u8>> {
        if run.is_empty() {
            return Ok(Vec::new());
        }

        let end = run.start() as u64 + run.len() as u64;
        ensure!(
            end <= self.file.count(),
            "run ({}, {}) reaches past element count {} in '{}'",
            run.start(),
            run.len(),
            self.file.count(),
            self.file.path().display()
        );

        let width = self.element_width();
        let mut bytes = Vec::with_capacity(run.len() as usize * width);
        for i in 0..run.len() as u64 {
            bytes.extend_from_slice(self.file.read(run.start() as u64 + i)?);
        }
        Ok(bytes)
    }

    /// Borrows a single element record.
    pub fn read_at(&self, index: u64) -> Result<&[u8]> {
        self.file.read(index)
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}
