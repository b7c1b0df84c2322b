//! On-disk placement of attribute records and block payloads.
//!
//! Every file is published with write-to-temp + rename, so readers only ever
//! observe a complete record or a complete payload. Temp files are hidden
//! (`.<id>.<pid>.<seq>.tmp`) and never parse as identifiers.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::ident::BlockId;
use crate::record::BlockAttributeRecord;
use crate::{BlockError, IoResultExt, Result};

/// Store descriptor, kept in the attribute directory.
pub const DESCRIPTOR_FILE: &str = ".cowstore.json";

/// Owner lock, kept in the attribute directory.
pub const LOCK_FILE: &str = ".cowstore.lock";

pub const FORMAT_VERSION: u32 = 1;

const TEMP_SUFFIX: &str = ".tmp";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Parameters fixed when a store is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub format_version: u32,
    pub block_size: u64,
    pub fanout: bool,
}

/// Path arithmetic and file I/O for the two store directories.
#[derive(Debug, Clone)]
pub struct BlockLayout {
    attribute_dir: PathBuf,
    data_dir: PathBuf,
    fanout: bool,
    sync: bool,
}

impl BlockLayout {
    pub fn new(attribute_dir: PathBuf, data_dir: PathBuf, fanout: bool, sync: bool) -> Self {
        Self {
            attribute_dir,
            data_dir,
            fanout,
            sync,
        }
    }

    pub fn attribute_dir(&self) -> &Path {
        &self.attribute_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn fanout(&self) -> bool {
        self.fanout
    }

    pub fn sync(&self) -> bool {
        self.sync
    }

    pub(crate) fn set_fanout(&mut self, fanout: bool) {
        self.fanout = fanout;
    }

    pub fn attribute_path(&self, id: &BlockId) -> PathBuf {
        self.place(&self.attribute_dir, id)
    }

    pub fn data_path(&self, id: &BlockId) -> PathBuf {
        self.place(&self.data_dir, id)
    }

    fn place(&self, dir: &Path, id: &BlockId) -> PathBuf {
        if self.fanout {
            dir.join(id.fanout_prefix()).join(id.to_hex())
        } else {
            dir.join(id.to_hex())
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.attribute_dir).at(&self.attribute_dir)?;
        fs::create_dir_all(&self.data_dir).at(&self.data_dir)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attribute records
    // ------------------------------------------------------------------

    /// Read the record for `id`; `None` if it does not exist.
    pub fn read_record(&self, id: &BlockId) -> Result<Option<BlockAttributeRecord>> {
        let path = self.attribute_path(id);
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        BlockAttributeRecord::decode(&bytes)
            .map(Some)
            .map_err(|source| BlockError::CorruptRecord { id: *id, source })
    }

    pub fn write_record(&self, id: &BlockId, record: &BlockAttributeRecord) -> Result<()> {
        self.write_atomic(&self.attribute_path(id), &record.encode())
    }

    pub fn remove_record(&self, id: &BlockId) -> Result<bool> {
        remove_if_exists(&self.attribute_path(id))
    }

    // ------------------------------------------------------------------
    // Payloads
    // ------------------------------------------------------------------

    pub fn write_data(&self, id: &BlockId, data: &[u8]) -> Result<()> {
        self.write_atomic(&self.data_path(id), data)
    }

    pub fn read_data(&self, id: &BlockId) -> Result<Option<Vec<u8>>> {
        read_if_exists(&self.data_path(id))
    }

    pub fn data_len(&self, id: &BlockId) -> Result<Option<u64>> {
        let path = self.data_path(id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).at(&path),
        }
    }

    pub fn remove_data(&self, id: &BlockId) -> Result<bool> {
        remove_if_exists(&self.data_path(id))
    }

    // ------------------------------------------------------------------
    // Descriptor
    // ------------------------------------------------------------------

    pub fn descriptor_path(&self) -> PathBuf {
        self.attribute_dir.join(DESCRIPTOR_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.attribute_dir.join(LOCK_FILE)
    }

    pub fn load_descriptor(&self) -> Result<Option<StoreDescriptor>> {
        let path = self.descriptor_path();
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            BlockError::InvalidConfiguration(format!(
                "unreadable store descriptor {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn write_descriptor(&self, descriptor: &StoreDescriptor) -> Result<()> {
        let path = self.descriptor_path();
        let bytes = serde_json::to_vec_pretty(descriptor)
            .map_err(io::Error::other)
            .at(&path)?;
        self.write_atomic(&path, &bytes)
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Identifiers that have an attribute record (live or awaiting reclamation).
    pub fn record_ids(&self) -> impl Iterator<Item = Result<BlockId>> + '_ {
        self.ids_in(&self.attribute_dir)
    }

    /// Identifiers that have a payload file.
    pub fn data_ids(&self) -> impl Iterator<Item = Result<BlockId>> + '_ {
        self.ids_in(&self.data_dir)
    }

    fn ids_in<'a>(&self, dir: &'a Path) -> impl Iterator<Item = Result<BlockId>> + 'a {
        let depth = if self.fanout { 2 } else { 1 };
        WalkDir::new(dir)
            .min_depth(depth)
            .max_depth(depth)
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        return None;
                    }
                    let name = entry.file_name().to_str()?;
                    BlockId::from_hex(name).ok().map(Ok)
                }
                Err(e) => Some(Err(walk_error(e, dir))),
            })
    }

    /// Leftover temp files in either directory, with the pid that wrote them.
    pub fn temp_files(&self) -> Result<Vec<(PathBuf, Option<u32>)>> {
        let mut found = Vec::new();
        for dir in [&self.attribute_dir, &self.data_dir] {
            for entry in WalkDir::new(dir).min_depth(1).max_depth(2) {
                let entry = entry.map_err(|e| walk_error(e, dir))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                        found.push((entry.path().to_path_buf(), temp_owner(name)));
                    }
                }
            }
        }
        Ok(found)
    }

    /// Remove fan-out prefix directories that no longer hold any entry.
    /// Returns how many were removed; a no-op for flat layouts.
    pub fn prune_empty_prefixes(&self) -> Result<u64> {
        if !self.fanout {
            return Ok(0);
        }
        let mut removed = 0;
        for dir in [&self.attribute_dir, &self.data_dir] {
            for entry in fs::read_dir(dir).at(dir)? {
                let entry = entry.at(dir)?;
                let path = entry.path();
                let is_prefix = entry.file_name().to_str().is_some_and(is_prefix_name);
                if !is_prefix || !entry.file_type().at(&path)?.is_dir() {
                    continue;
                }
                if fs::read_dir(&path).at(&path)?.next().is_some() {
                    continue;
                }
                match fs::remove_dir(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    // refilled since the check
                    Err(_) if path.is_dir() => {}
                    Err(e) => return Err(e).at(&path),
                }
            }
        }
        Ok(removed)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if self.fanout {
            fs::create_dir_all(dir).at(dir)?;
        }

        let temp = temp_path(path);
        let written = (|| -> io::Result<()> {
            let mut file = match File::create(&temp) {
                // a sweep may have pruned the prefix directory in between
                Err(e) if self.fanout && e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir_all(dir)?;
                    File::create(&temp)?
                }
                other => other?,
            };
            file.write_all(bytes)?;
            if self.sync {
                file.sync_all()?;
            }
            fs::rename(&temp, path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e).at(path);
        }

        if self.sync {
            sync_dir(dir).at(dir)?;
        }
        Ok(())
    }
}

fn is_prefix_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.{}{}",
        name,
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed),
        TEMP_SUFFIX
    ))
}

/// Writer pid encoded in a temp file name.
fn temp_owner(name: &str) -> Option<u32> {
    let stem = name.strip_prefix('.')?.strip_suffix(TEMP_SUFFIX)?;
    let mut parts = stem.rsplitn(3, '.');
    let _seq = parts.next()?;
    parts.next()?.parse().ok()
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).at(path),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).at(path),
    }
}

fn walk_error(e: walkdir::Error, dir: &Path) -> BlockError {
    let path = e.path().unwrap_or(dir).to_path_buf();
    BlockError::StorageIo {
        path,
        source: io::Error::from(e),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest;
    use tempfile::TempDir;

    fn layout(temp: &TempDir, fanout: bool) -> BlockLayout {
        let layout = BlockLayout::new(
            temp.path().join("attr"),
            temp.path().join("data"),
            fanout,
            false,
        );
        layout.create_dirs().unwrap();
        layout
    }

    #[test]
    fn test_flat_paths() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, false);
        let id = digest(b"123456789");

        assert_eq!(
            layout.attribute_path(&id),
            temp.path().join("attr").join("995dc9bbdf1939fa")
        );
        assert_eq!(
            layout.data_path(&id),
            temp.path().join("data").join("995dc9bbdf1939fa")
        );
    }

    #[test]
    fn test_fanout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, true);
        let id = digest(b"123456789");

        assert_eq!(
            layout.data_path(&id),
            temp.path().join("data").join("99").join("995dc9bbdf1939fa")
        );
    }

    #[test]
    fn test_prune_empty_prefixes() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, true);
        let kept = digest(b"kept");
        let gone = (0..=255u8)
            .map(|i| digest(&[i]))
            .find(|id| id.fanout_prefix() != kept.fanout_prefix())
            .unwrap();

        layout.write_data(&kept, b"x").unwrap();
        layout.write_data(&gone, b"y").unwrap();
        layout.remove_data(&gone).unwrap();
        fs::create_dir(temp.path().join("data").join("zz")).unwrap();

        assert_eq!(layout.prune_empty_prefixes().unwrap(), 1);
        assert!(!temp.path().join("data").join(gone.fanout_prefix()).exists());
        assert!(layout.data_path(&kept).exists());
        // not a prefix directory
        assert!(temp.path().join("data").join("zz").exists());

        // writes recreate a pruned prefix
        layout.write_data(&gone, b"y").unwrap();
        assert!(layout.data_path(&gone).exists());
        let flat = BlockLayout::new(temp.path().join("attr"), temp.path().join("data"), false, false);
        assert_eq!(flat.prune_empty_prefixes().unwrap(), 0);
    }

    #[test]
    fn test_record_roundtrip_and_missing() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, false);
        let id = digest(b"record");

        assert!(layout.read_record(&id).unwrap().is_none());

        let record = BlockAttributeRecord::new(4096);
        layout.write_record(&id, &record).unwrap();
        assert_eq!(layout.read_record(&id).unwrap(), Some(record));

        assert!(layout.remove_record(&id).unwrap());
        assert!(!layout.remove_record(&id).unwrap());
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, false);
        let id = digest(b"corrupt");

        fs::write(layout.attribute_path(&id), b"not a record").unwrap();
        let err = layout.read_record(&id).unwrap_err();
        assert!(matches!(err, BlockError::CorruptRecord { id: got, .. } if got == id));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, true);
        let id = digest(b"payload");

        layout.write_data(&id, b"payload").unwrap();
        assert_eq!(layout.read_data(&id).unwrap().unwrap(), b"payload");
        assert_eq!(layout.data_len(&id).unwrap(), Some(7));
        assert!(layout.temp_files().unwrap().is_empty());
    }

    #[test]
    fn test_enumeration_skips_foreign_files() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, false);
        let a = digest(b"a");
        let b = digest(b"b");
        layout.write_record(&a, &BlockAttributeRecord::new(1)).unwrap();
        layout.write_record(&b, &BlockAttributeRecord::new(1)).unwrap();

        fs::write(layout.attribute_dir().join("README"), b"hi").unwrap();
        fs::write(layout.attribute_dir().join("0001ABCDEF1099FF"), b"").unwrap();
        fs::write(
            layout
                .attribute_dir()
                .join(format!(".{}.1.0.tmp", a.to_hex())),
            b"",
        )
        .unwrap();

        let mut ids: Vec<String> = layout
            .record_ids()
            .map(|r| r.unwrap().to_hex())
            .collect();
        ids.sort();
        let mut expected = vec![a.to_hex(), b.to_hex()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_temp_files_report_owner() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, false);
        let stale = layout.data_dir().join(".995dc9bbdf1939fa.4242.7.tmp");
        fs::write(&stale, b"partial").unwrap();

        let found = layout.temp_files().unwrap();
        assert_eq!(found, vec![(stale, Some(4242))]);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let temp = TempDir::new().unwrap();
        let layout = layout(&temp, false);
        assert!(layout.load_descriptor().unwrap().is_none());

        let descriptor = StoreDescriptor {
            format_version: FORMAT_VERSION,
            block_size: 4096,
            fanout: true,
        };
        layout.write_descriptor(&descriptor).unwrap();
        assert_eq!(layout.load_descriptor().unwrap(), Some(descriptor));
    }
}
