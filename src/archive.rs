//! # Archive Bundles
//!
//! An archive is a compacted database serialised into one file. The source
//! is first compacted into a scratch directory, then every file is laid
//! into a bundle:
//!
//! ```text
//! magic    : 8 ascii bytes "TTARCHV\0"
//! version  : u32 little-endian
//! entries  : u32 little-endian count
//! entry[k] : name_len u16 | name bytes | length u64 | offset u64
//! data     : raw file bytes, concatenated in offset order
//! ```
//!
//! Offsets are absolute file positions. Entry names are `/`-separated
//! relative paths, so variant catalogs restore into their enum
//! directories. A `.gz` suffix selects transparent gzip on write; restore
//! sniffs the 1F 8B magic instead of trusting the extension. The
//! `.ttar[.gz]` extension is advisory.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::engine::Database;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"TTARCHV\0";
pub const ARCHIVE_VERSION: u32 = 1;

const HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BundleHeader {
    magic: [u8; 8],
    version: U32,
    entry_count: U32,
}

const _: () = assert!(std::mem::size_of::<BundleHeader>() == HEADER_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub file_count: u32,
    pub total_bytes: u64,
}

impl Database {
    /// Compacts this database and bundles the result into `out_file`.
    pub fn archive_to<P: AsRef<Path>>(&self, out_file: P) -> Result<ArchiveStats> {
        let out_file = out_file.as_ref();
        let scratch = tempfile::tempdir().wrap_err("failed to create scratch directory")?;
        let compacted = scratch.path().join("compacted");
        self.compact_to(&compacted)?;

        let gzip = out_file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
        let stats = write_bundle(&compacted, out_file, gzip)?;
        info!(
            file = %out_file.display(),
            files = stats.file_count,
            bytes = stats.total_bytes,
            "archived database"
        );
        Ok(stats)
    }
}

/// Files under `dir`, as sorted `/`-separated relative names.
fn collect_files(dir: &Path) -> Result<Vec<String>> {
    fn walk(root: &Path, current: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.metadata()?.is_dir() {
                walk(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .expect("walk stays under root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(rel);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    files.sort();
    Ok(files)
}

/// Bundles every file under `src_dir` into `out_file`.
pub fn write_bundle(src_dir: &Path, out_file: &Path, gzip: bool) -> Result<ArchiveStats> {
    let names = collect_files(src_dir)?;
    ensure!(
        names.len() <= u32::MAX as usize,
        "too many files to archive"
    );

    let mut entry_bytes = Vec::new();
    let mut lengths = Vec::with_capacity(names.len());
    for name in &names {
        let len = std::fs::metadata(src_dir.join(name.replace('/', std::path::MAIN_SEPARATOR_STR)))?
            .len();
        lengths.push(len);
    }

    // Entries carry absolute offsets, so their total size comes first.
    let entries_size: usize = names.iter().map(|n| 2 + n.len() + 16).sum();
    let mut offset = (HEADER_SIZE + entries_size) as u64;
    for (name, len) in names.iter().zip(&lengths) {
        ensure!(
            name.len() <= u16::MAX as usize,
            "archived file name '{}' is too long",
            name
        );
        entry_bytes.extend_from_slice(&(name.len() as u16).to_le_bytes());
        entry_bytes.extend_from_slice(name.as_bytes());
        entry_bytes.extend_from_slice(&len.to_le_bytes());
        entry_bytes.extend_from_slice(&offset.to_le_bytes());
        offset += len;
    }

    let header = BundleHeader {
        magic: *ARCHIVE_MAGIC,
        version: U32::new(ARCHIVE_VERSION),
        entry_count: U32::new(names.len() as u32),
    };

    let mut bundle = Vec::with_capacity(offset as usize);
    bundle.extend_from_slice(header.as_bytes());
    bundle.extend_from_slice(&entry_bytes);
    for name in &names {
        let path = src_dir.join(name.replace('/', std::path::MAIN_SEPARATOR_STR));
        let bytes = std::fs::read(&path)
            .wrap_err_with(|| format!("failed to read '{}'", path.display()))?;
        bundle.extend_from_slice(&bytes);
    }

    if let Some(parent) = out_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    if gzip {
        let file = std::fs::File::create(out_file)
            .wrap_err_with(|| format!("failed to create '{}'", out_file.display()))?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&bundle)?;
        encoder.finish()?;
    } else {
        std::fs::write(out_file, &bundle)
            .wrap_err_with(|| format!("failed to write '{}'", out_file.display()))?;
    }

    Ok(ArchiveStats {
        file_count: names.len() as u32,
        total_bytes: std::fs::metadata(out_file)?.len(),
    })
}

/// Restores an archive into `dest_dir`, which must not pre-exist. The
/// directory tree is recreated and every file written verbatim.
pub fn restore<P: AsRef<Path>, Q: AsRef<Path>>(archive_file: P, dest_dir: Q) -> Result<()> {
    let archive_file = archive_file.as_ref();
    let dest_dir = dest_dir.as_ref();
    ensure!(
        !dest_dir.exists(),
        "restore target '{}' already exists",
        dest_dir.display()
    );

    let raw = std::fs::read(archive_file)
        .wrap_err_with(|| format!("failed to read '{}'", archive_file.display()))?;

    // Gzip is detected by magic, not extension.
    let bundle = if raw.starts_with(&[0x1F, 0x8B]) {
        let mut decoded = Vec::new();
        GzDecoder::new(&raw[..])
            .read_to_end(&mut decoded)
            .wrap_err("failed to decompress archive")?;
        decoded
    } else {
        raw
    };

    ensure!(bundle.len() >= HEADER_SIZE, "archive is truncated");
    let header = BundleHeader::ref_from_bytes(&bundle[..HEADER_SIZE])
        .map_err(|e| eyre::eyre!("malformed archive header: {:?}", e))?;
    ensure!(&header.magic == ARCHIVE_MAGIC, "not a typed-tables archive");
    ensure!(
        header.version.get() == ARCHIVE_VERSION,
        "unsupported archive version {}",
        header.version.get()
    );

    let mut cursor = HEADER_SIZE;
    let mut entries = Vec::with_capacity(header.entry_count.get() as usize);
    for _ in 0..header.entry_count.get() {
        ensure!(bundle.len() >= cursor + 2, "archive entry table is truncated");
        let name_len = u16::from_le_bytes(bundle[cursor..cursor + 2].try_into().unwrap()) as usize;
        cursor += 2;
        ensure!(
            bundle.len() >= cursor + name_len + 16,
            "archive entry table is truncated"
        );
        let name = std::str::from_utf8(&bundle[cursor..cursor + name_len])
            .wrap_err("archive entry name is not UTF-8")?
            .to_string();
        cursor += name_len;
        let length = u64::from_le_bytes(bundle[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
        let file_offset = u64::from_le_bytes(bundle[cursor..cursor + 8].try_into().unwrap());
        cursor += 8;
        entries.push((name, length, file_offset));
    }

    std::fs::create_dir_all(dest_dir)?;
    for (name, length, file_offset) in entries {
        let rel: PathBuf = name.split('/').collect();
        ensure!(
            rel.components()
                .all(|c| matches!(c, std::path::Component::Normal(_))),
            "archive entry '{}' escapes the restore directory",
            name
        );

        let start = file_offset as usize;
        let end = start
            .checked_add(length as usize)
            .ok_or_else(|| eyre::eyre!("archive entry '{}' overflows", name))?;
        if end > bundle.len() {
            bail!("archive entry '{}' reaches past the bundle", name);
        }

        let path = dest_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &bundle[start..end])
            .wrap_err_with(|| format!("failed to write '{}'", path.display()))?;
    }

    info!(archive = %archive_file.display(), dest = %dest_dir.display(), "restored archive");
    Ok(())
}
