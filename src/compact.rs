//! # Compaction
//!
//! Builds a fresh database directory in which every catalog is gap-free
//! and every cross-table reference is remapped to its new index. The
//! metadata document is copied byte-identically; tombstones are dropped;
//! dangling references become explicit nulls; element-store garbage is
//! left behind by re-laying out only the runs actually reachable from
//! live records, back-to-back in first-encounter order.
//!
//! Output files are written at exactly `8 + live_count * record_size`
//! bytes, so compaction is also the size floor: a second compaction of
//! the output differs only by directory name.
//!
//! Aborting mid-compaction leaves the destination partially written; the
//! caller must treat an incomplete destination as garbage and delete it.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{info, warn};
use zerocopy::IntoBytes;

use crate::engine::layout::{element_store_key, RecordLayout, SlotShape};
use crate::engine::resolver::NO_PAYLOAD;
use crate::engine::Database;
use crate::schema::{metadata_path, SchemaRegistry, TypeKind};
use crate::storage::store_set::{BIGINT_STORE, BIGUINT_STORE, FRAC_DEN_STORE, FRAC_NUM_STORE};
use crate::storage::{RunRef, StoreSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Record slots in the source catalogs, tombstones included.
    pub records_before: u64,
    /// Live records written to the destination catalogs.
    pub records_after: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl Database {
    /// Compacts this database into `dest`, which must not pre-exist.
    pub fn compact_to<P: AsRef<Path>>(&self, dest: P) -> Result<CompactStats> {
        compact(self, dest.as_ref())
    }
}

pub fn compact(db: &Database, dest: &Path) -> Result<CompactStats> {
    ensure!(
        !dest.exists(),
        "compaction target '{}' already exists",
        dest.display()
    );
    db.flush()?;

    info!(src = %db.path().display(), dest = %dest.display(), "compacting database");

    let mut compactor = Compactor::new(db.registry(), db.stores());
    compactor.build_index_maps()?;
    compactor.rewrite_tables()?;
    compactor.rewrite_variants()?;
    let stats = compactor.write_output(db.path(), dest)?;

    info!(
        records_before = stats.records_before,
        records_after = stats.records_after,
        bytes_before = stats.bytes_before,
        bytes_after = stats.bytes_after,
        "compaction complete"
    );
    Ok(stats)
}

/// A destination file accumulated in memory and written at exact size.
#[derive(Debug)]
struct OutFile {
    record_size: usize,
    data: Vec<u8>,
}

impl OutFile {
    fn new(record_size: usize) -> Self {
        Self {
            record_size,
            data: Vec::new(),
        }
    }

    fn count(&self) -> u64 {
        (self.data.len() / self.record_size) as u64
    }

    fn append(&mut self, record: &[u8]) -> u64 {
        debug_assert_eq!(record.len(), self.record_size);
        let index = self.count();
        self.data.extend_from_slice(record);
        index
    }

    fn append_run(&mut self, bytes: &[u8]) -> u64 {
        debug_assert_eq!(bytes.len() % self.record_size, 0);
        let start = self.count();
        self.data.extend_from_slice(bytes);
        start
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create '{}'", parent.display()))?;
        }
        let mut bytes = Vec::with_capacity(8 + self.data.len());
        bytes.extend_from_slice(&self.count().to_le_bytes());
        bytes.extend_from_slice(&self.data);
        std::fs::write(path, bytes)
            .wrap_err_with(|| format!("failed to write '{}'", path.display()))
    }
}

struct Compactor<'a> {
    registry: &'a SchemaRegistry,
    stores: &'a StoreSet,
    table_maps: HashMap<String, Vec<Option<u32>>>,
    variant_maps: HashMap<(String, String), Vec<Option<u32>>>,
    out_tables: HashMap<String, OutFile>,
    out_variants: HashMap<(String, String), OutFile>,
    out_elements: HashMap<String, OutFile>,
    /// `(semantic key, old start, len) -> new start`, first-encounter.
    run_memo: HashMap<(String, u32, u32), u32>,
}

impl<'a> Compactor<'a> {
    fn new(registry: &'a SchemaRegistry, stores: &'a StoreSet) -> Self {
        Self {
            registry,
            stores,
            table_maps: HashMap::new(),
            variant_maps: HashMap::new(),
            out_tables: HashMap::new(),
            out_variants: HashMap::new(),
            out_elements: HashMap::new(),
            run_memo: HashMap::new(),
        }
    }

    /// Numbers live records 0..M-1 in ascending old-index order, for every
    /// catalog and every variant file.
    fn build_index_maps(&mut self) -> Result<()> {
        for name in self.registry.sorted_names() {
            let def = self.registry.get(&name)?;
            if def.is_composite() {
                if let Some(table) = self.stores.table_ref(&name) {
                    self.table_maps.insert(name.clone(), live_numbering(table)?);
                }
            }
            if let TypeKind::Enum { variants, .. } = &def.kind {
                for variant in variants {
                    if variant.fields.is_empty() {
                        continue;
                    }
                    if let Some(file) = self.stores.variant_ref(&name, &variant.name) {
                        self.variant_maps
                            .insert((name.clone(), variant.name.clone()), live_numbering(file)?);
                    }
                }
            }
        }
        Ok(())
    }

    fn rewrite_tables(&mut self) -> Result<()> {
        for name in self.registry.sorted_names() {
            if !self.registry.get(&name)?.is_composite() {
                continue;
            }
            let Some(table) = self.stores.table_ref(&name) else {
                continue;
            };
            let layout = RecordLayout::for_composite(self.registry, &name)?;
            let live: Vec<Vec<u8>> = table
                .iter_live()
                .map(|(_, bytes)| bytes.to_vec())
                .collect();

            let mut out = OutFile::new(layout.record_size);
            for mut record in live {
                self.rewrite_record(&layout, &mut record)?;
                out.append(&record);
            }
            self.out_tables.insert(name.clone(), out);
        }
        Ok(())
    }

    fn rewrite_variants(&mut self) -> Result<()> {
        let keys: Vec<(String, String)> = self.variant_maps.keys().cloned().collect();
        let mut sorted = keys;
        sorted.sort();
        for (enum_name, variant_name) in sorted {
            let layout = RecordLayout::for_variant(self.registry, &enum_name, &variant_name)?;
            let file = self
                .stores
                .variant_ref(&enum_name, &variant_name)
                .expect("variant map built from an open file");
            let live: Vec<Vec<u8>> = file.iter_live().map(|(_, b)| b.to_vec()).collect();

            let mut out = OutFile::new(layout.record_size);
            for mut record in live {
                self.rewrite_record(&layout, &mut record)?;
                out.append(&record);
            }
            self.out_variants.insert((enum_name, variant_name), out);
        }
        Ok(())
    }

    /// Rewrites every slot of one record through the index and run remaps.
    /// A dangling reference becomes an explicit null: bitmap bit set, slot
    /// zeroed. Compaction never aborts on dangling data.
    fn rewrite_record(&mut self, layout: &RecordLayout, record: &mut [u8]) -> Result<()> {
        for i in 0..layout.slots.len() {
            if layout.is_null(record, i) {
                continue;
            }
            let slot = layout.slots[i].clone();
            let bytes = layout.slot_bytes(record, i).to_vec();

            let rewritten: Option<Vec<u8>> = match &slot.shape {
                SlotShape::Primitive(_) | SlotShape::BareEnum { .. } => Some(bytes),
                SlotShape::Str => self
                    .migrate_run("character", RunRef::from_slot(&bytes)?)?
                    .map(|run| run.as_bytes().to_vec()),
                SlotShape::Run { element, .. } => self
                    .migrate_run(element, RunRef::from_slot(&bytes)?)?
                    .map(|run| run.as_bytes().to_vec()),
                SlotShape::Dict { entry, .. } => self
                    .migrate_run(entry, RunRef::from_slot(&bytes)?)?
                    .map(|run| run.as_bytes().to_vec()),
                SlotShape::CompositeRef { target } => {
                    let index = u32::from_le_bytes(bytes[..4].try_into().unwrap());
                    self.remap_index(target, index)
                        .map(|new| new.to_le_bytes().to_vec())
                }
                SlotShape::InterfaceRef { .. } => {
                    let type_id = u16::from_le_bytes(bytes[..2].try_into().unwrap());
                    let index = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
                    match self.registry.type_name_by_id(type_id) {
                        Some(concrete) => self.remap_index(concrete, index).map(|new| {
                            let mut slot = Vec::with_capacity(6);
                            // Type-id table carries over verbatim.
                            slot.extend_from_slice(&type_id.to_le_bytes());
                            slot.extend_from_slice(&new.to_le_bytes());
                            slot
                        }),
                        None => {
                            warn!(type_id, "unknown type-id during compaction; nulling slot");
                            None
                        }
                    }
                }
                SlotShape::PayloadEnum {
                    enum_name,
                    disc_width,
                } => {
                    let mut disc_buf = [0u8; 4];
                    disc_buf[..*disc_width].copy_from_slice(&bytes[..*disc_width]);
                    let disc = u32::from_le_bytes(disc_buf);
                    let index =
                        u32::from_le_bytes(bytes[*disc_width..*disc_width + 4].try_into().unwrap());
                    self.remap_variant(enum_name, disc, index).map(|new| {
                        let mut slot = bytes.clone();
                        slot[*disc_width..*disc_width + 4].copy_from_slice(&new.to_le_bytes());
                        slot
                    })
                }
                SlotShape::BigInt { signed } => {
                    let key = if *signed { BIGINT_STORE } else { BIGUINT_STORE };
                    self.migrate_byte_run(key, RunRef::from_slot(&bytes)?)?
                        .map(|run| run.as_bytes().to_vec())
                }
                SlotShape::Fraction => {
                    let num = self.migrate_byte_run(FRAC_NUM_STORE, RunRef::from_slot(&bytes[..8])?)?;
                    let den = self.migrate_byte_run(FRAC_DEN_STORE, RunRef::from_slot(&bytes[8..])?)?;
                    match (num, den) {
                        (Some(num), Some(den)) => {
                            let mut slot = Vec::with_capacity(16);
                            slot.extend_from_slice(num.as_bytes());
                            slot.extend_from_slice(den.as_bytes());
                            Some(slot)
                        }
                        _ => None,
                    }
                }
            };

            match rewritten {
                Some(new_bytes) => {
                    let out = layout.slot_bytes_mut(record, i);
                    out.copy_from_slice(&new_bytes);
                }
                None => layout.set_null(record, i),
            }
        }
        Ok(())
    }

    fn remap_index(&self, target: &str, index: u32) -> Option<u32> {
        let new = self
            .table_maps
            .get(target)
            .and_then(|map| map.get(index as usize))
            .copied()
            .flatten();
        if new.is_none() {
            warn!(table = target, index, "dangling reference during compaction; nulling");
        }
        new
    }

    fn remap_variant(&self, enum_name: &str, disc: u32, index: u32) -> Option<u32> {
        if index == NO_PAYLOAD {
            return Some(NO_PAYLOAD);
        }
        let def = self.registry.get(enum_name).ok()?;
        let variant = def.variant_by_discriminant(disc)?;
        let new = self
            .variant_maps
            .get(&(enum_name.to_string(), variant.name.clone()))
            .and_then(|map| map.get(index as usize))
            .copied()
            .flatten();
        if new.is_none() {
            warn!(enum_name, disc, index, "dangling variant record; nulling");
        }
        new
    }

    /// Migrates one reachable run into the destination store, rewriting
    /// elements that are themselves references or nested runs. Returns
    /// `None` when the source run is unreadable (dangling).
    fn migrate_run(&mut self, element_type: &str, run: RunRef) -> Result<Option<RunRef>> {
        if run.is_empty() {
            return Ok(Some(RunRef::empty()));
        }

        let memo_key = (element_type.to_string(), run.start(), run.len());
        if let Some(&new_start) = self.run_memo.get(&memo_key) {
            return Ok(Some(RunRef::new(new_start, run.len())));
        }

        let (store_key, width) = element_store_key(self.registry, element_type)?;
        let Some(store) = self.stores.element_ref(&store_key) else {
            warn!(element_type, "run references a missing element store; nulling");
            return Ok(None);
        };
        let Ok(bytes) = store.read_run(run) else {
            warn!(
                element_type,
                start = run.start(),
                len = run.len(),
                "out-of-bounds run during compaction; nulling"
            );
            return Ok(None);
        };

        let resolved = self.registry.resolve(element_type)?.clone();
        let mut out_bytes = Vec::with_capacity(bytes.len());

        match &resolved.kind {
            TypeKind::Primitive(_) => out_bytes = bytes,
            TypeKind::StringType => {
                for chunk in bytes.chunks_exact(width) {
                    let inner = RunRef::from_slot(chunk)?;
                    let migrated = self
                        .migrate_run("character", inner)?
                        .unwrap_or_else(RunRef::empty);
                    out_bytes.extend_from_slice(migrated.as_bytes());
                }
            }
            TypeKind::Array { element: inner } | TypeKind::Set { element: inner } => {
                let inner = inner.clone();
                for chunk in bytes.chunks_exact(width) {
                    let inner_run = RunRef::from_slot(chunk)?;
                    let migrated = self
                        .migrate_run(&inner, inner_run)?
                        .unwrap_or_else(RunRef::empty);
                    out_bytes.extend_from_slice(migrated.as_bytes());
                }
            }
            TypeKind::Composite { .. } => {
                for chunk in bytes.chunks_exact(width) {
                    let index = u32::from_le_bytes(chunk[..4].try_into().unwrap());
                    let new = if index == NO_PAYLOAD {
                        NO_PAYLOAD
                    } else {
                        self.remap_index(&resolved.name, index).unwrap_or(NO_PAYLOAD)
                    };
                    out_bytes.extend_from_slice(&new.to_le_bytes());
                }
            }
            TypeKind::Interface { .. } => {
                for chunk in bytes.chunks_exact(width) {
                    let type_id = u16::from_le_bytes(chunk[..2].try_into().unwrap());
                    let index = u32::from_le_bytes(chunk[2..6].try_into().unwrap());
                    let new = self
                        .registry
                        .type_name_by_id(type_id)
                        .and_then(|concrete| self.remap_index(concrete, index))
                        .unwrap_or(NO_PAYLOAD);
                    out_bytes.extend_from_slice(&type_id.to_le_bytes());
                    out_bytes.extend_from_slice(&new.to_le_bytes());
                }
            }
            TypeKind::Enum { .. } => {
                let disc_width = resolved.discriminant_width()?;
                if resolved.has_payload() {
                    for chunk in bytes.chunks_exact(width) {
                        let mut disc_buf = [0u8; 4];
                        disc_buf[..disc_width].copy_from_slice(&chunk[..disc_width]);
                        let disc = u32::from_le_bytes(disc_buf);
                        let index = u32::from_le_bytes(
                            chunk[disc_width..disc_width + 4].try_into().unwrap(),
                        );
                        let new = self
                            .remap_variant(&resolved.name, disc, index)
                            .unwrap_or(NO_PAYLOAD);
                        out_bytes.extend_from_slice(&chunk[..disc_width]);
                        out_bytes.extend_from_slice(&new.to_le_bytes());
                    }
                } else {
                    out_bytes = bytes;
                }
            }
            _ => {
                warn!(element_type, "unexpected element kind during compaction; nulling");
                return Ok(None);
            }
        }

        let out = self
            .out_elements
            .entry(store_key)
            .or_insert_with(|| OutFile::new(width));
        let new_start = out.append_run(&out_bytes);
        ensure!(
            new_start <= u32::MAX as u64,
            "compacted element store overflowed the 32-bit run address space"
        );

        self.run_memo.insert(memo_key, new_start as u32);
        Ok(Some(RunRef::new(new_start as u32, run.len())))
    }

    fn migrate_byte_run(&mut self, store_key: &str, run: RunRef) -> Result<Option<RunRef>> {
        if run.is_empty() {
            return Ok(Some(RunRef::empty()));
        }

        let memo_key = (format!("bytes:{}", store_key), run.start(), run.len());
        if let Some(&new_start) = self.run_memo.get(&memo_key) {
            return Ok(Some(RunRef::new(new_start, run.len())));
        }

        let Some(store) = self.stores.element_ref(store_key) else {
            warn!(store_key, "byte run references a missing store; nulling");
            return Ok(None);
        };
        let Ok(bytes) = store.read_run(run) else {
            warn!(store_key, start = run.start(), "out-of-bounds byte run; nulling");
            return Ok(None);
        };

        let out = self
            .out_elements
            .entry(store_key.to_string())
            .or_insert_with(|| OutFile::new(1));
        let new_start = out.append_run(&bytes);
        ensure!(
            new_start <= u32::MAX as u64,
            "compacted byte store overflowed the 32-bit run address space"
        );

        self.run_memo.insert(memo_key, new_start as u32);
        Ok(Some(RunRef::new(new_start as u32, run.len())))
    }

    fn write_output(&self, src: &Path, dest: &Path) -> Result<CompactStats> {
        std::fs::create_dir_all(dest)
            .wrap_err_with(|| format!("failed to create '{}'", dest.display()))?;

        // The schema document carries over byte-identically.
        std::fs::copy(metadata_path(src), metadata_path(dest))
            .wrap_err("failed to copy metadata document")?;

        let mut records_before = 0;
        let mut records_after = 0;

        for (name, out) in sorted_entries(&self.out_tables) {
            let source_count = self
                .stores
                .table_ref(name)
                .map(|t| t.count())
                .unwrap_or(0);
            records_before += source_count;
            records_after += out.count();
            out.write_to(&dest.join(format!("{}.bin", name)))?;
        }

        for ((enum_name, variant), out) in sorted_entries(&self.out_variants) {
            out.write_to(&dest.join(enum_name).join(format!("{}.bin", variant)))?;
        }

        for (key, out) in sorted_entries(&self.out_elements) {
            out.write_to(&dest.join(format!("{}.bin", key)))?;
        }

        Ok(CompactStats {
            records_before,
            records_after,
            bytes_before: dir_size(src)?,
            bytes_after: dir_size(dest)?,
        })
    }
}

fn live_numbering(file: &crate::storage::RecordFile) -> Result<Vec<Option<u32>>> {
    let mut map = vec![None; file.count() as usize];
    let mut next = 0u32;
    for (index, _) in file.iter_live() {
        map[index as usize] = Some(next);
        next += 1;
    }
    Ok(map)
}

fn sorted_entries<K: Ord + Clone, V>(map: &HashMap<K, V>) -> Vec<(&K, &V)> {
    let mut entries: Vec<(&K, &V)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, TypeDef};
    use crate::types::Value;
    use tempfile::tempdir;

    #[test]
    fn compacted_files_are_exact_size() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::composite("P", vec![FieldDef::new("n", "uint8")]))
            .unwrap();
        for i in 0..10u8 {
            db.insert("P", vec![("n", Value::UInt(i as u128))]).unwrap();
        }
        db.delete("P", 3).unwrap();
        db.delete("P", 7).unwrap();

        let out = dir.path().join("compacted");
        let stats = db.compact_to(&out).unwrap();
        assert_eq!(stats.records_before, 10);
        assert_eq!(stats.records_after, 8);

        // record = 1 bitmap byte + 1 slot byte
        let size = std::fs::metadata(out.join("P.bin")).unwrap().len();
        assert_eq!(size, 8 + 8 * 2);
    }

    #[test]
    fn compaction_target_must_not_exist() {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("db")).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        assert!(db.compact_to(&out).is_err());
    }

    #[test]
    fn metadata_is_copied_byte_identically() {
        let dir = tempdir().unwrap();
        let mut db = Database::create(dir.path().join("db")).unwrap();
        db.register_type(TypeDef::composite("P", vec![FieldDef::new("n", "string")]))
            .unwrap();

        let out = dir.path().join("compacted");
        db.compact_to(&out).unwrap();

        let src = std::fs::read(metadata_path(&dir.path().join("db"))).unwrap();
        let dst = std::fs::read(metadata_path(&out)).unwrap();
        assert_eq!(src, dst);
    }
}
