//! # Per-Directory Store Registry
//!
//! `StoreSet` owns every open file under one data directory and maps type
//! names to them. The layout follows the file-per-type convention:
//!
//! ```text
//! data_dir/
//! ├── _metadata.json        # schema document (written by the schema layer)
//! ├── Person.bin            # table catalog, one per composite
//! ├── character.bin         # element store, one per element type
//! ├── string.bin            # run-pair store backing string[] and friends
//! ├── uint32.bin            # shared index store (composite & dict entries)
//! ├── Shape/Circle.bin      # variant catalog, one file per enum variant
//! ├── bigint.bin            # signed big-integer byte store
//! ├── biguint.bin           # unsigned big-integer byte store
//! ├── _frac_num.bin         # fraction numerator bytes
//! └── _frac_den.bin         # fraction denominator bytes
//! ```
//!
//! Files open lazily on first touch and stay open for the life of the
//! engine. Mutating accessors create missing files; read accessors only
//! see what is already open, so the engine eagerly opens every file that
//! exists on disk when a directory is attached.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::debug;

use super::{ElementStore, RecordFile};

/// Store keys for the dedicated big-numeric byte stores.
pub const BIGINT_STORE: &str = "bigint";
pub const BIGUINT_STORE: &str = "biguint";
pub const FRAC_NUM_STORE: &str = "_frac_num";
pub const FRAC_DEN_STORE: &str = "_frac_den";

#[derive(Debug)]
pub struct StoreSet {
    data_dir: PathBuf,
    tables: HashMap<String, RecordFile>,
    elements: HashMap<String, ElementStore>,
    variants: HashMap<String, RecordFile>,
}

impl StoreSet {
    pub fn attach<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .wrap_err_with(|| format!("failed to create data directory '{}'", data_dir.display()))?;
        Ok(Self {
            data_dir,
            tables: HashMap::new(),
            elements: HashMap::new(),
            variants: HashMap::new(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn table_path(&self, type_name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.bin", type_name))
    }

    pub fn variant_path(&self, enum_name: &str, variant: &str) -> PathBuf {
        self.data_dir.join(enum_name).join(format!("{}.bin", variant))
    }

    fn variant_key(enum_name: &str, variant: &str) -> String {
        format!("{}::{}", enum_name, variant)
    }

    /// Opens (creating if missing) the table catalog for a composite.
    pub fn table(&mut self, type_name: &str, record_size: usize) -> Result<&mut RecordFile> {
        if !self.tables.contains_key(type_name) {
            let path = self.table_path(type_name);
            debug!(table = type_name, path = %path.display(), "opening table catalog");
            let file = RecordFile::open_or_create(&path, record_size)?;
            self.tables.insert(type_name.to_string(), file);
        }
        let file = self.tables.get_mut(type_name).unwrap();
        ensure!(
            file.record_size() == record_size,
            "table '{}' has record size {} but the schema computes {}",
            type_name,
            file.record_size(),
            record_size
        );
        Ok(file)
    }

    /// The already-open catalog, if any. `None` also covers composites that
    /// were never materialised on disk.
    pub fn table_ref(&self, type_name: &str) -> Option<&RecordFile> {
        self.tables.get(type_name)
    }

    /// Opens a catalog only when its file already exists.
    pub fn open_table_if_exists(&mut self, type_name: &str, record_size: usize) -> Result<()> {
        if !self.tables.contains_key(type_name) && self.table_path(type_name).exists() {
            self.table(type_name, record_size)?;
        }
        Ok(())
    }

    /// Opens (creating if missing) an element store.
    pub fn element(&mut self, key: &str, element_width: usize) -> Result<&mut ElementStore> {
        if !self.elements.contains_key(key) {
            let path = self.data_dir.join(format!("{}.bin", key));
            debug!(store = key, path = %path.display(), "opening element store");
            let store = ElementStore::open_or_create(&path, element_width)?;
            self.elements.insert(key.to_string(), store);
        }
        let store = self.elements.get_mut(key).unwrap();
        ensure!(
            store.element_width() == element_width,
            "element store '{}' has width {} but the schema computes {}",
            key,
            store.element_width(),
            element_width
        );
        Ok(store)
    }

    pub fn element_ref(&self, key: &str) -> Option<&ElementStore> {
        self.elements.get(key)
    }

    pub fn open_element_if_exists(&mut self, key: &str, element_width: usize) -> Result<()> {
        if !self.elements.contains_key(key) && self.data_dir.join(format!("{}.bin", key)).exists() {
            self.element(key, element_width)?;
        }
        Ok(())
    }

    /// Opens (creating if missing) the per-variant catalog of a payload
    /// enum. The file lives in a directory named after the enum.
    pub fn variant(
        &mut self,
        enum_name: &str,
        variant: &str,
        record_size: usize,
    ) -> Result<&mut RecordFile> {
        let key = Self::variant_key(enum_name, variant);
        if !self.variants.contains_key(&key) {
            let path = self.variant_path(enum_name, variant);
            debug!(variant = %key, path = %path.display(), "opening variant catalog");
            let file = RecordFile::open_or_create(&path, record_size)?;
            self.variants.insert(key.clone(), file);
        }
        let file = self.variants.get_mut(&key).unwrap();
        ensure!(
            file.record_size() == record_size,
            "variant catalog '{}' has record size {} but the schema computes {}",
            key,
            file.record_size(),
            record_size
        );
        Ok(file)
    }

    pub fn variant_ref(&self, enum_name: &str, variant: &str) -> Option<&RecordFile> {
        self.variants.get(&Self::variant_key(enum_name, variant))
    }

    pub fn open_variant_if_exists(
        &mut self,
        enum_name: &str,
        variant: &str,
        record_size: usize,
    ) -> Result<()> {
        let key = Self::variant_key(enum_name, variant);
        if !self.variants.contains_key(&key) && self.variant_path(enum_name, variant).exists() {
            self.variant(enum_name, variant, record_size)?;
        }
        Ok(())
    }

    /// Closes and removes a composite's catalog file. Element stores are
    /// shared across types and always survive.
    pub fn drop_table(&mut self, type_name: &str) -> Result<()> {
        self.tables.remove(type_name);
        let path = self.table_path(type_name);
        if path.exists() {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove '{}'", path.display()))?;
        }
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        for table in self.tables.values() {
            table.flush()?;
        }
        for store in self.elements.values() {
            store.flush()?;
        }
        for variant in self.variants.values() {
            variant.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn table_files_are_named_after_types() {
        let dir = tempdir().unwrap();
        let mut stores = StoreSet::attach(dir.path()).unwrap();
        stores.table("Person", 16).unwrap();
        assert!(dir.path().join("Person.bin").exists());
    }

    #[test]
    fn variant_files_nest_under_enum_directory() {
        let dir = tempdir().unwrap();
        let mut stores = StoreSet::attach(dir.path()).unwrap();
        stores.variant("Shape", "Circle", 9).unwrap();
        assert!(dir.path().join("Shape").join("Circle.bin").exists());
    }

    #[test]
    fn record_size_mismatch_is_detected() {
        let dir = tempdir().unwrap();
        let mut stores = StoreSet::attach(dir.path()).unwrap();
        stores.table("Person", 16).unwrap();
        assert!(stores.table("Person", 8).is_err());
    }

    #[test]
    fn read_accessors_see_only_open_files() {
        let dir = tempdir().unwrap();
        let mut stores = StoreSet::attach(dir.path()).unwrap();
        assert!(stores.table_ref("Person").is_none());
        stores.table("Person", 4).unwrap();
        assert!(stores.table_ref("Person").is_some());
    }

    #[test]
    fn open_if_exists_skips_missing_files() {
        let dir = tempdir().unwrap();
        let mut stores = StoreSet::attach(dir.path()).unwrap();
        stores.open_table_if_exists("Ghost", 4).unwrap();
        assert!(stores.table_ref("Ghost").is_none());
        assert!(!dir.path().join("Ghost.bin").exists());
    }

    #[test]
    fn drop_table_removes_the_catalog_file() {
        let dir = tempdir().unwrap();
        let mut stores = StoreSet::attach(dir.path()).unwrap();
        stores.table("Doomed", 4).unwrap();
        stores.drop_table("Doomed").unwrap();
        assert!(!dir.path().join("Doomed.bin").exists());
        assert!(stores.table_ref("Doomed").is_none());
    }
}
