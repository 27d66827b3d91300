//! # Storage Layer
//!
//! Memory-mapped fixed-record files and the per-directory file registry.
//!
//! - [`RecordFile`]: count header + fixed-size records, 2x growth,
//!   tombstone soft-delete.
//! - [`ElementStore`]: a record file of unit-width elements addressed by
//!   `(start, length)` runs.
//! - [`StoreSet`]: lazily opens and caches every table catalog, element
//!   store, and variant catalog under one data directory.

pub mod element_store;
pub mod record_file;
pub mod store_set;

pub use element_store::{ElementStore, RunRef, RUN_REF_SIZE};
pub use record_file::RecordFile;
pub use store_set::StoreSet;

/// Initial size of every newly created record file, in bytes.
pub const INITIAL_FILE_SIZE: usize = 4096;

/// Size of the live-count header at the start of every record file.
pub const COUNT_HEADER_SIZE: usize = 8;
