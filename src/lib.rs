//! # Typed Tables
//!
//! A file-backed, single-process, structured database organised around a
//! user-defined type system. Each type occupies its own fixed-record
//! binary file; composite records inline primitive values and keep
//! indirect references for variable-length data (strings, arrays, sets,
//! dictionaries, big integers, fractions, payload-bearing enum variants).
//!
//! ## Quick Start
//!
//! ```no_run
//! use typed_tables::{Database, FieldDef, TypeDef, Value};
//!
//! let mut db = Database::create("./people")?;
//! db.register_type(TypeDef::composite(
//!     "Person",
//!     vec![FieldDef::new("name", "string"), FieldDef::new("age", "uint8")],
//! ))?;
//!
//! let idx = db.insert(
//!     "Person",
//!     vec![("name", Value::Str("Ada".into())), ("age", Value::UInt(36))],
//! )?;
//! assert_eq!(
//!     db.read("Person", idx)?.field("name"),
//!     Some(&Value::Str("Ada".into()))
//! );
//! # eyre::Result::<()>::Ok(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Public API (Database, scopes)        │
//! ├──────────────────────┬──────────────────────┤
//! │   Schema Registry    │  Reference Resolver  │
//! │  (types, metadata)   │  (value <-> slot)    │
//! ├──────────────────────┴──────────────────────┤
//! │   Record Layout (null bitmap + slots)       │
//! ├─────────────────────────────────────────────┤
//! │   Store Set (catalogs, element stores,      │
//! │   variant catalogs, big-numeric stores)     │
//! ├─────────────────────────────────────────────┤
//! │   Record Files (mmap, 2x growth, tombstones)│
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Compaction ([`compact`]) rebuilds a directory gap-free with every
//! reference remapped; archiving ([`archive`]) bundles the compacted
//! result into a single file.
//!
//! ## Data Directory
//!
//! ```text
//! people/
//! ├── _metadata.json     # schema document
//! ├── Person.bin         # one table catalog per composite
//! ├── character.bin      # element stores, shared per element type
//! ├── Shape/Circle.bin   # variant catalogs for payload enums
//! └── bigint.bin         # arbitrary-precision byte stores
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: memory-mapped record files, element stores, store set
//! - [`schema`]: type definitions, registry, metadata persistence
//! - [`types`]: runtime [`Value`]s and arbitrary-precision numerics
//! - [`engine`]: the database facade, record layout, the resolver, scopes
//! - [`compact`]: gap-free rebuild with global reference remapping
//! - [`archive`]: single-file bundles and restore

pub mod archive;
pub mod compact;
pub mod engine;
pub mod schema;
pub mod storage;
pub mod types;

pub use archive::{restore, ArchiveStats};
pub use compact::CompactStats;
pub use engine::{purge_temporary_databases, Database, DatabaseBuilder, FacetHit, ScopeCtx};
pub use schema::{FieldDef, OverflowPolicy, PrimitiveType, SchemaRegistry, TypeDef, VariantSpec};
pub use types::{BigNum, Value};
