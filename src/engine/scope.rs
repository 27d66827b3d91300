//! # Scopes and Tags
//!
//! Cyclic references between composites are built with reserve-then-fill:
//! a scope binds tag names to reserved record indices, so a record under
//! construction can be referenced before its fields are written. Tags are
//! case-sensitive, unique within their scope, and die with it.
//!
//! ```no_run
//! # use typed_tables::{Database, Value};
//! # let mut db = Database::create("db").unwrap();
//! db.scope(|sc| {
//!     let a = sc.reserve("A", "N")?;
//!     let b = sc.insert(
//!         "N",
//!         vec![("name", Value::Str("B".into())), ("next", a.clone())],
//!     )?;
//!     sc.fill(
//!         "A",
//!         vec![
//!             ("name", Value::Str("A".into())),
//!             ("next", Value::reference("N", b)),
//!         ],
//!     )
//! }).unwrap();
//! ```

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::engine::layout::RecordLayout;
use crate::engine::resolver;
use crate::types::Value;

use super::Database;

/// A per-scope environment mapping tags to reserved records.
pub struct ScopeCtx<'a> {
    db: &'a mut Database,
    tags: HashMap<String, (String, u32)>,
}

impl Database {
    /// Runs `f` inside a fresh scope. Tags created inside are destroyed
    /// when the closure returns, on success and error alike.
    pub fn scope<R>(&mut self, f: impl FnOnce(&mut ScopeCtx) -> Result<R>) -> Result<R> {
        let mut ctx = ScopeCtx {
            db: self,
            tags: HashMap::new(),
        };
        f(&mut ctx)
    }
}

impl ScopeCtx<'_> {
    /// Reserves an index in `type_name`'s catalog and binds `tag` to it.
    /// The reserved record is all-null until `fill` overwrites it.
    pub fn reserve(&mut self, tag: &str, type_name: &str) -> Result<Value> {
        ensure!(
            !self.tags.contains_key(tag),
            "tag '{}' is already defined in this scope",
            tag
        );

        let (registry, stores) = self.db.split_mut();
        let layout = RecordLayout::for_composite(registry, type_name)?;
        let table = stores.table(type_name, layout.record_size)?;
        let index = table.append(&layout.null_record())?;
        ensure!(
            index <= u32::MAX as u64,
            "table '{}' overflowed the 32-bit index space",
            type_name
        );

        self.tags
            .insert(tag.to_string(), (type_name.to_string(), index as u32));
        Ok(Value::reference(type_name, index as u32))
    }

    /// The reference bound to `tag`.
    pub fn tag_ref(&self, tag: &str) -> Result<Value> {
        let (type_name, index) = self
            .tags
            .get(tag)
            .ok_or_else(|| eyre::eyre!("tag '{}' is not defined in this scope", tag))?;
        Ok(Value::reference(type_name.clone(), *index))
    }

    /// Fills the record reserved under `tag` with its field values.
    pub fn fill(&mut self, tag: &str, fields: Vec<(&str, Value)>) -> Result<()> {
        let (type_name, index) = self
            .tags
            .get(tag)
            .cloned()
            .ok_or_else(|| eyre::eyre!("tag '{}' is not defined in this scope", tag))?;

        let owned: Vec<(String, Value)> = fields
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect();

        let (registry, stores) = self.db.split_mut();
        let layout = RecordLayout::for_composite(registry, &type_name)?;
        let record = resolver::build_record(registry, stores, &layout, &owned)?;
        let table = stores.table(&type_name, layout.record_size)?;
        table.overwrite(index as u64, &record)
    }

    /// Plain insert, available inside the scope for untagged records.
    pub fn insert(&mut self, type_name: &str, fields: Vec<(&str, Value)>) -> Result<u32> {
        self.db.insert(type_name, fields)
    }

    pub fn read(&self, type_name: &str, index: u32) -> Result<Value> {
        self.db.read(type_name, index)
    }
}
