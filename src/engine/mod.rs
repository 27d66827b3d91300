//! # Database Engine
//!
//! `Database` is the public handle over one data directory: the schema
//! registry, the store set, and the engine operations (schema mutation,
//! CRUD, scopes, faceted queries). Exactly one live engine may own a data
//! directory at a time; a process-wide registry enforces it. Directories
//! flagged temporary are tracked on a session list and deleted when their
//! engine drops.
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
//! let person = db.read("Person", idx)?;
//! # eyre::Result::<()>::Ok(())
//! ```

pub mod layout;
pub mod overflow;
pub mod resolver;
pub mod scope;

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::schema::{
    self, load_metadata, metadata_path, save_metadata, SchemaRegistry, TypeDef, TypeKind,
};
use crate::storage::store_set::{BIGINT_STORE, BIGUINT_STORE, FRAC_DEN_STORE, FRAC_NUM_STORE};
use crate::storage::StoreSet;
use crate::types::Value;

use layout::{element_store_key, RecordLayout};
pub use resolver::FacetHit;
pub use scope::ScopeCtx;

/// Data directories currently owned by a live engine in this process.
static OPEN_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Temporary directories created this session, deleted at teardown.
static TEMP_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    path: Option<PathBuf>,
    temporary: bool,
}

impl DatabaseBuilder {
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Marks the directory temporary: it is tracked on the session list
    /// and removed when the engine drops.
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn create(self) -> Result<Database> {
        let path = self.path.ok_or_else(|| eyre::eyre!("builder needs a path"))?;
        Database::create_inner(&path, self.temporary)
    }

    pub fn open(self) -> Result<Database> {
        let path = self.path.ok_or_else(|| eyre::eyre!("builder needs a path"))?;
        Database::open_inner(&path, self.temporary)
    }

    pub fn open_or_create(self) -> Result<Database> {
        let path = self.path.ok_or_else(|| eyre::eyre!("builder needs a path"))?;
        if metadata_path(&path).exists() {
            Database::open_inner(&path, self.temporary)
        } else {
            Database::create_inner(&path, self.temporary)
        }
    }
}

#[derive(Debug)]
pub struct Database {
    registry: SchemaRegistry,
    stores: StoreSet,
    path: PathBuf,
    temporary: bool,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Creates a fresh database directory with an empty (builtins-only)
    /// schema.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_inner(path.as_ref(), false)
    }

    /// Opens an existing database directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_inner(path.as_ref(), false)
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open_or_create()
    }

    fn create_inner(path: &Path, temporary: bool) -> Result<Self> {
        ensure!(
            !metadata_path(path).exists(),
            "database already exists at '{}'",
            path.display()
        );

        let stores = StoreSet::attach(path)?;
        let canonical = acquire_dir(path)?;

        let registry = SchemaRegistry::new();
        save_metadata(&registry, path)?;

        if temporary {
            TEMP_DIRS.lock().push(canonical.clone());
        }

        info!(path = %path.display(), temporary, "created database");
        Ok(Self {
            registry,
            stores,
            path: canonical,
            temporary,
        })
    }

    fn open_inner(path: &Path, temporary: bool) -> Result<Self> {
        ensure!(
            metadata_path(path).exists(),
            "no database at '{}' (missing {})",
            path.display(),
            schema::METADATA_FILE
        );

        let registry = load_metadata(path)?;
        let stores = StoreSet::attach(path)?;
        let canonical = acquire_dir(path)?;

        if temporary {
            TEMP_DIRS.lock().push(canonical.clone());
        }

        let mut db = Self {
            registry,
            stores,
            path: canonical,
            temporary,
        };
        db.open_existing_stores()?;
        info!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// Eagerly opens every file the schema can name that already exists on
    /// disk, so the read path never has to mutate the store set.
    fn open_existing_stores(&mut self) -> Result<()> {
        for name in self.registry.sorted_names() {
            let def = self.registry.get(&name)?.clone();
            match &def.kind {
                TypeKind::Composite { .. } => {
                    if self.registry.effective_fields(&name)?.is_empty() {
                        continue;
                    }
                    let layout = RecordLayout::for_composite(&self.registry, &name)?;
                    self.stores
                        .open_table_if_exists(&name, layout.record_size)?;
                }
                TypeKind::Primitive(p) => {
                    self.stores.open_element_if_exists(p.name(), p.width())?;
                }
                TypeKind::StringType => {
                    self.stores.open_element_if_exists("character", 4)?;
                    self.stores.open_element_if_exists("string", 8)?;
                }
                TypeKind::Array { element } | TypeKind::Set { element } => {
                    let (key, width) = element_store_key(&self.registry, element)?;
                    self.stores.open_element_if_exists(&key, width)?;
                    // This type may itself be someone's element.
                    self.stores.open_element_if_exists(&name, 8)?;
                }
                TypeKind::Dictionary { .. } => {
                    self.stores.open_element_if_exists("uint32", 4)?;
                }
                TypeKind::Interface { .. } => {
                    self.stores.open_element_if_exists(&name, 6)?;
                }
                TypeKind::Enum { variants, .. } => {
                    for variant in variants {
                        if variant.fields.is_empty() {
                            continue;
                        }
                        let layout =
                            RecordLayout::for_variant(&self.registry, &name, &variant.name)?;
                        self.stores.open_variant_if_exists(
                            &name,
                            &variant.name,
                            layout.record_size,
                        )?;
                    }
                    let width = def.element_width()?;
                    self.stores.open_element_if_exists(&name, width)?;
                }
                TypeKind::BigInt => self.stores.open_element_if_exists(BIGINT_STORE, 1)?,
                TypeKind::BigUInt => self.stores.open_element_if_exists(BIGUINT_STORE, 1)?,
                TypeKind::Fraction => {
                    self.stores.open_element_if_exists(FRAC_NUM_STORE, 1)?;
                    self.stores.open_element_if_exists(FRAC_DEN_STORE, 1)?;
                }
                TypeKind::Alias { .. } | TypeKind::Stub => {}
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub(crate) fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub(crate) fn split_mut(&mut self) -> (&SchemaRegistry, &mut StoreSet) {
        (&self.registry, &mut self.stores)
    }

    // -- schema mutation ---------------------------------------------------

    /// Registers a type and re-persists the metadata document. While
    /// forward stubs are outstanding the save is deferred; it happens on
    /// the registration that populates the last stub.
    pub fn register_type(&mut self, def: TypeDef) -> Result<()> {
        self.registry.register(def)?;
        self.commit_metadata()
    }

    /// Declares a forward stub, to be populated by a later registration.
    pub fn register_stub(&mut self, name: &str) -> Result<()> {
        self.registry.register_stub(name)
    }

    pub fn define_alias(&mut self, name: &str, target: &str) -> Result<()> {
        self.register_type(TypeDef::alias(name, target))
    }

    /// Gets or registers `element[]`.
    pub fn array_type(&mut self, element: &str) -> Result<String> {
        let name = self.registry.ensure_array(element)?;
        self.commit_metadata()?;
        Ok(name)
    }

    /// Gets or registers `set<element>`.
    pub fn set_type(&mut self, element: &str) -> Result<String> {
        let name = self.registry.ensure_set(element)?;
        self.commit_metadata()?;
        Ok(name)
    }

    /// Gets or registers `dictionary<key,value>` and its entry composite.
    pub fn dictionary_type(&mut self, key: &str, value: &str) -> Result<String> {
        let name = self.registry.ensure_dictionary(key, value)?;
        self.commit_metadata()?;
        Ok(name)
    }

    /// Drops a composite: the definition and its table catalog go away;
    /// shared element stores persist.
    pub fn drop_type(&mut self, name: &str) -> Result<()> {
        self.registry.drop_composite(name)?;
        self.stores.drop_table(name)?;
        self.commit_metadata()
    }

    fn commit_metadata(&mut self) -> Result<()> {
        if !self.registry.unpopulated_stubs().is_empty() {
            debug!("metadata commit deferred; forward stubs outstanding");
            return Ok(());
        }
        save_metadata(&self.registry, &self.path)
    }

    /// Explicit schema commit; fails while stubs are unpopulated.
    pub fn commit_schema(&mut self) -> Result<()> {
        save_metadata(&self.registry, &self.path)
    }

    // -- record operations -------------------------------------------------

    /// Inserts a record and returns its index in the type's catalog.
    pub fn insert(&mut self, type_name: &str, fields: Vec<(&str, Value)>) -> Result<u32> {
        let def = self.registry.get(type_name)?;
        ensure!(
            !def.is_interface(),
            "cannot instantiate interface '{}'",
            type_name
        );
        let owned: Vec<(String, Value)> = fields
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect();
        let (registry, stores) = (&self.registry, &mut self.stores);
        resolver::intern_record(registry, stores, type_name, &owned)
    }

    /// Reads a live record; composite- and interface-typed fields come
    /// back as references.
    pub fn read(&self, type_name: &str, index: u32) -> Result<Value> {
        resolver::read_record(&self.registry, &self.stores, type_name, index)
    }

    /// Applies field changes in place. Variable-length values re-intern at
    /// the element-store tail; the record keeps its index.
    pub fn update(&mut self, type_name: &str, index: u32, changes: Vec<(&str, Value)>) -> Result<()> {
        let layout = RecordLayout::for_composite(&self.registry, type_name)?;

        let mut record = {
            let table = self
                .stores
                .table_ref(type_name)
                .ok_or_else(|| eyre::eyre!("no records of type '{}'", type_name))?;
            ensure!(
                !table.is_tombstoned(index as u64)?,
                "record {} in '{}' is deleted",
                index,
                type_name
            );
            table.read(index as u64)?.to_vec()
        };

        let owned: Vec<(String, Value)> = changes
            .into_iter()
            .map(|(n, v)| (n.to_string(), v))
            .collect();
        let (registry, stores) = (&self.registry, &mut self.stores);
        resolver::apply_changes(registry, stores, &layout, &mut record, &owned)?;

        let table = self.stores.table(type_name, layout.record_size)?;
        table.overwrite(index as u64, &record)
    }

    /// Soft-deletes a record. Its index stays allocated; `iter_live` and
    /// `scan` skip it until compaction drops it for good.
    pub fn delete(&mut self, type_name: &str, index: u32) -> Result<()> {
        ensure!(
            self.registry.get(type_name)?.is_composite(),
            "'{}' is not a composite",
            type_name
        );
        let table = self
            .stores
            .table_ref(type_name)
            .ok_or_else(|| eyre::eyre!("no records of type '{}'", type_name))?;
        ensure!(
            (index as u64) < table.count(),
            "record {} out of bounds (count={}) in '{}'",
            index,
            table.count(),
            type_name
        );
        let layout = RecordLayout::for_composite(&self.registry, type_name)?;
        let table = self.stores.table(type_name, layout.record_size)?;
        table.tombstone(index as u64)
    }

    /// All live records of a type, in index order.
    pub fn scan(&self, type_name: &str) -> Result<Vec<(u32, Value)>> {
        ensure!(
            self.registry.get(type_name)?.is_composite(),
            "'{}' is not a composite",
            type_name
        );
        let Some(table) = self.stores.table_ref(type_name) else {
            return Ok(Vec::new());
        };
        let indices: Vec<u64> = table.iter_live().map(|(i, _)| i).collect();
        indices
            .into_iter()
            .map(|i| Ok((i as u32, self.read(type_name, i as u32)?)))
            .collect()
    }

    /// Total record slots in a type's catalog, tombstones included.
    pub fn record_count(&self, type_name: &str) -> u64 {
        self.stores
            .table_ref(type_name)
            .map(|t| t.count())
            .unwrap_or(0)
    }

    /// Live records only.
    pub fn live_count(&self, type_name: &str) -> u64 {
        self.stores
            .table_ref(type_name)
            .map(|t| t.iter_live().count() as u64)
            .unwrap_or(0)
    }

    // -- queries -----------------------------------------------------------

    /// Every live projection of a non-composite type across all
    /// composites: `(composite, index, field, value)`.
    pub fn values_of(&self, type_name: &str) -> Result<Vec<FacetHit>> {
        resolver::values_of(&self.registry, &self.stores, type_name)
    }

    /// Every `(owner, field)` in the schema whose type is or contains
    /// `type_name`.
    pub fn usages_of(&self, type_name: &str) -> Vec<(String, String)> {
        self.registry.references_to(type_name)
    }

    pub fn implementers_of(&self, interface: &str) -> Result<Vec<String>> {
        self.registry.implementers_of(interface)
    }

    pub fn flush(&self) -> Result<()> {
        self.stores.flush_all()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.stores.flush_all();
        release_dir(&self.path);
        if self.temporary {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                debug!(path = %self.path.display(), error = %e, "failed to remove temporary database");
            }
            TEMP_DIRS.lock().retain(|p| p != &self.path);
        }
    }
}

fn acquire_dir(path: &Path) -> Result<PathBuf> {
    let canonical = std::fs::canonicalize(path)
        .wrap_err_with(|| format!("failed to canonicalise '{}'", path.display()))?;
    let mut open = OPEN_DIRS.lock();
    if open.contains(&canonical) {
        bail!(
            "data directory '{}' is already owned by a live engine",
            canonical.display()
        );
    }
    open.push(canonical.clone());
    Ok(canonical)
}

fn release_dir(path: &Path) {
    OPEN_DIRS.lock().retain(|p| p != path);
}

/// Deletes every temporary database directory still present that is not
/// currently owned by a live engine. Returns the number removed.
pub fn purge_temporary_databases() -> usize {
    let open = OPEN_DIRS.lock().clone();
    let mut temps = TEMP_DIRS.lock();
    let mut removed = 0;
    temps.retain(|path| {
        if open.contains(path) {
            return true;
        }
        if path.exists() && std::fs::remove_dir_all(path).is_ok() {
            removed += 1;
        }
        false
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_round_trips_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let mut db = Database::create(&path).unwrap();
            db.register_type(TypeDef::composite(
                "Person",
                vec![FieldDef::new("name", "string")],
            ))
            .unwrap();
            db.insert("Person", vec![("name", Value::Str("Ada".into()))])
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert!(db.registry().contains("Person"));
        let person = db.read("Person", 0).unwrap();
        assert_eq!(person.field("name"), Some(&Value::Str("Ada".into())));
    }

    #[test]
    fn second_engine_on_same_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let _db = Database::create(&path).unwrap();
        let err = Database::open(&path).unwrap_err();
        assert!(err.to_string().contains("already owned"));
    }

    #[test]
    fn directory_is_reusable_after_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let _db = Database::create(&path).unwrap();
        }
        let _db = Database::open(&path).unwrap();
    }

    #[test]
    fn temporary_databases_vanish_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch");
        {
            let _db = Database::builder().path(&path).temporary(true).create().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn cannot_instantiate_interface() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::interface(
            "Named",
            vec![FieldDef::new("name", "string")],
            vec![],
        ))
        .unwrap();

        let err = db
            .insert("Named", vec![("name", Value::Str("x".into()))])
            .unwrap_err();
        assert!(err.to_string().contains("cannot instantiate interface"));
    }

    #[test]
    fn update_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::composite(
            "P",
            vec![FieldDef::new("name", "string"), FieldDef::new("age", "uint8")],
        ))
        .unwrap();

        let idx = db
            .insert(
                "P",
                vec![("name", Value::Str("Ada".into())), ("age", Value::UInt(36))],
            )
            .unwrap();
        db.update(
            "P",
            idx,
            vec![("name", Value::Str("Grace".into())), ("age", Value::Null)],
        )
        .unwrap();

        let record = db.read("P", idx).unwrap();
        assert_eq!(record.field("name"), Some(&Value::Str("Grace".into())));
        assert_eq!(record.field("age"), Some(&Value::Null));
        assert_eq!(db.record_count("P"), 1);
    }

    #[test]
    fn delete_hides_record_from_scan() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::composite("P", vec![FieldDef::new("n", "uint8")]))
            .unwrap();

        for i in 0..10u8 {
            db.insert("P", vec![("n", Value::UInt(i as u128))]).unwrap();
        }
        db.delete("P", 3).unwrap();
        db.delete("P", 7).unwrap();

        let live = db.scan("P").unwrap();
        assert_eq!(live.len(), 8);
        assert_eq!(db.record_count("P"), 10);
        assert_eq!(db.live_count("P"), 8);
        assert!(db.read("P", 3).is_err());

        let indices: Vec<u32> = live.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 4, 5, 6, 8, 9]);
    }

    #[test]
    fn scope_builds_cycles_with_tags() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::composite(
            "N",
            vec![FieldDef::new("name", "string"), FieldDef::new("next", "N")],
        ))
        .unwrap();

        db.scope(|sc| {
            let a = sc.reserve("A", "N")?;
            let b = sc.insert(
                "N",
                vec![("name", Value::Str("B".into())), ("next", a.clone())],
            )?;
            sc.fill(
                "A",
                vec![
                    ("name", Value::Str("A".into())),
                    ("next", Value::reference("N", b)),
                ],
            )
        })
        .unwrap();

        let a = db.read("N", 0).unwrap();
        let b = db.read("N", 1).unwrap();
        assert_eq!(a.field("next"), Some(&Value::reference("N", 1)));
        assert_eq!(b.field("next"), Some(&Value::reference("N", 0)));
    }

    #[test]
    fn duplicate_tags_are_rejected_and_tags_die_with_scope() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::composite("N", vec![FieldDef::new("next", "N")]))
            .unwrap();

        db.scope(|sc| {
            sc.reserve("A", "N")?;
            let err = sc.reserve("A", "N").unwrap_err();
            assert!(err.to_string().contains("already defined"));
            // Tags are case-sensitive.
            sc.reserve("a", "N")?;
            Ok(())
        })
        .unwrap();

        db.scope(|sc| {
            assert!(sc.tag_ref("A").is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn drop_type_removes_catalog_but_not_element_stores() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let mut db = Database::create(&path).unwrap();
        db.register_type(TypeDef::composite("P", vec![FieldDef::new("n", "string")]))
            .unwrap();
        db.insert("P", vec![("n", Value::Str("hi".into()))]).unwrap();

        db.drop_type("P").unwrap();
        assert!(!path.join("P.bin").exists());
        assert!(path.join("character.bin").exists());
        assert!(!db.registry().contains("P"));
    }

    #[test]
    fn usages_and_implementers_are_exposed() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::interface("I1", vec![], vec![])).unwrap();
        db.register_type(TypeDef::interface("I2", vec![], vec!["I1".into()]))
            .unwrap();
        db.register_type(TypeDef::composite_with(
            "T",
            vec![FieldDef::new("x", "uint8")],
            None,
            vec!["I2".into()],
        ))
        .unwrap();

        assert_eq!(db.implementers_of("I1").unwrap(), vec!["T".to_string()]);
        assert_eq!(
            db.usages_of("uint8"),
            vec![("T".to_string(), "x".to_string())]
        );
    }
}
