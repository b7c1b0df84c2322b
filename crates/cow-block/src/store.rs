//! Allocation, lookup and dereference of content-addressed blocks.

use std::borrow::Cow;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use dashmap::DashSet;
use fs2::FileExt;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::digest::digest;
use crate::ident::BlockId;
use crate::layout::{BlockLayout, StoreDescriptor, FORMAT_VERSION};
use crate::lock::{LockTable, PinTable};
use crate::record::{BlockAttributeRecord, BlockFlags};
use crate::{BlockError, IntegrityFault, IoResultExt, Result};

/// Construction parameters for a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    attribute_dir: PathBuf,
    data_dir: PathBuf,
    block_size: u64,
    fanout: bool,
    sync: bool,
    immediate_reclaim: bool,
}

impl StoreOptions {
    pub fn new(
        attribute_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        block_size: u64,
    ) -> Self {
        Self {
            attribute_dir: attribute_dir.into(),
            data_dir: data_dir.into(),
            block_size,
            fanout: false,
            sync: true,
            immediate_reclaim: true,
        }
    }

    /// Split both directories by the first two hex characters of the id.
    /// Only honoured when the store is created; afterwards the persisted
    /// layout wins.
    pub fn fanout(mut self, fanout: bool) -> Self {
        self.fanout = fanout;
        self
    }

    /// fsync payloads, records and their directories before publishing.
    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Reclaim a block inside `release` when its lock is uncontended.
    /// When off, zero-count blocks wait for [`Store::reclaim_pending`].
    pub fn immediate_reclaim(mut self, immediate: bool) -> Self {
        self.immediate_reclaim = immediate;
        self
    }

    pub fn open(self) -> Result<Store> {
        Store::open(self)
    }

    fn validate(&self) -> Result<usize> {
        if self.block_size == 0 {
            return Err(invalid("block_size must be greater than zero"));
        }
        if self.attribute_dir.as_os_str().is_empty() {
            return Err(invalid("attribute_dir is empty"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(invalid("data_dir is empty"));
        }
        if self.attribute_dir == self.data_dir {
            return Err(invalid("attribute_dir and data_dir must be different directories"));
        }
        usize::try_from(self.block_size)
            .map_err(|_| invalid(format!("block_size {} is not addressable", self.block_size)))
    }
}

fn invalid(msg: impl Into<String>) -> BlockError {
    BlockError::InvalidConfiguration(msg.into())
}

/// Content-addressed block store bound to an attribute and a data directory.
///
/// A `Store` owns its directories exclusively for its lifetime; share it
/// between threads with `Arc<Store>`.
pub struct Store {
    pub(crate) layout: BlockLayout,
    block_size: usize,
    zero_id: BlockId,
    pub(crate) locks: LockTable,
    pub(crate) pins: PinTable,
    pub(crate) pending: DashSet<BlockId>,
    immediate_reclaim: bool,
    _owner: File,
}

impl Store {
    /// Open (creating if needed) a store with default options.
    pub fn new(
        attribute_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        block_size: u64,
    ) -> Result<Self> {
        StoreOptions::new(attribute_dir, data_dir, block_size).open()
    }

    pub fn open(options: StoreOptions) -> Result<Self> {
        let block_size = options.validate()?;
        let mut layout = BlockLayout::new(
            options.attribute_dir,
            options.data_dir,
            options.fanout,
            options.sync,
        );
        layout.create_dirs()?;
        check_disjoint(layout.attribute_dir(), layout.data_dir())?;
        let owner = acquire_owner_lock(&layout.lock_path())?;

        match layout.load_descriptor()? {
            Some(descriptor) => {
                if descriptor.format_version != FORMAT_VERSION {
                    return Err(invalid(format!(
                        "unsupported store format version {}",
                        descriptor.format_version
                    )));
                }
                if descriptor.block_size != options.block_size {
                    return Err(invalid(format!(
                        "store was created with block_size {}, requested {}",
                        descriptor.block_size, options.block_size
                    )));
                }
                if descriptor.fanout != layout.fanout() {
                    warn!(
                        component = "STORE",
                        fanout = descriptor.fanout,
                        "ignoring requested fan-out, keeping the layout the store was created with"
                    );
                    layout.set_fanout(descriptor.fanout);
                }
            }
            None => layout.write_descriptor(&StoreDescriptor {
                format_version: FORMAT_VERSION,
                block_size: options.block_size,
                fanout: layout.fanout(),
            })?,
        }

        let zero_id = digest(&vec![0u8; block_size]);
        let store = Self {
            layout,
            block_size,
            zero_id,
            locks: LockTable::default(),
            pins: PinTable::default(),
            pending: DashSet::new(),
            immediate_reclaim: options.immediate_reclaim,
            _owner: owner,
        };
        store.allocate_block()?;

        info!(
            component = "STORE",
            attribute_dir = %store.layout.attribute_dir().display(),
            data_dir = %store.layout.data_dir().display(),
            block_size,
            zero_block = %zero_id,
            "block store opened"
        );
        Ok(store)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Identifier of the all-zero block of this store's block size.
    pub fn zero_block_id(&self) -> BlockId {
        self.zero_id
    }

    pub fn attribute_dir(&self) -> &Path {
        self.layout.attribute_dir()
    }

    pub fn data_dir(&self) -> &Path {
        self.layout.data_dir()
    }

    /// Store a block, returning its identifier.
    ///
    /// Buffers shorter than the block size are zero-padded. Storing content
    /// that is already present only takes another reference to it.
    #[instrument(skip(self, data), fields(len = data.len()), level = "debug")]
    pub fn put(&self, data: &[u8]) -> Result<BlockId> {
        if data.len() > self.block_size {
            return Err(BlockError::InvalidBlockSize {
                expected: self.block_size as u64,
                actual: data.len() as u64,
            });
        }

        if data.iter().all(|&b| b == 0) {
            self.add_reference(self.zero_id, || Cow::Owned(vec![0u8; self.block_size]))?;
            return Ok(self.zero_id);
        }

        let block = self.pad(data);
        let id = digest(&block);
        self.add_reference(id, || block)?;
        Ok(id)
    }

    /// Store many blocks in parallel. Results are in input order.
    pub fn put_batch<B>(&self, blocks: &[B]) -> Vec<Result<BlockId>>
    where
        B: AsRef<[u8]> + Sync,
    {
        blocks.par_iter().map(|b| self.put(b.as_ref())).collect()
    }

    /// Fetch a block, verifying it against its identifier.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, id: &BlockId) -> Result<Vec<u8>> {
        let _pin = self
            .pins
            .pin(*id)
            .ok_or(BlockError::BlockNotFound { id: *id })?;

        match self.layout.read_record(id)? {
            Some(record) if record.is_live() => {}
            _ => return Err(BlockError::BlockNotFound { id: *id }),
        }

        let data = self
            .layout
            .read_data(id)?
            .ok_or_else(|| self.integrity(id, IntegrityFault::MissingData))?;
        if data.len() != self.block_size {
            return Err(self.integrity(
                id,
                IntegrityFault::SizeMismatch {
                    expected: self.block_size as u64,
                    actual: data.len() as u64,
                },
            ));
        }
        let actual = digest(&data);
        if actual != *id {
            return Err(self.integrity(id, IntegrityFault::DigestMismatch { actual }));
        }

        Ok(data)
    }

    /// Drop one reference, returning the number that remain.
    ///
    /// A block that reaches zero is queued for reclamation and, unless its
    /// lock is contended or a reader still holds it, removed right away.
    #[instrument(skip(self), level = "debug")]
    pub fn release(&self, id: &BlockId) -> Result<u64> {
        let remaining = {
            let _guard = self.locks.lock(*id);
            let mut record = match self.layout.read_record(id)? {
                Some(record) if record.is_live() => record,
                _ => return Err(self.underflow(id, "block has no outstanding references")),
            };
            if record.flags.contains(BlockFlags::STANDING) && record.reference_count == 1 {
                return Err(self.underflow(id, "only the store's standing reference remains"));
            }
            record.reference_count -= 1;
            self.layout.write_record(id, &record)?;
            record.reference_count
        };
        debug!(component = "STORE", block = %id, remaining, "reference released");

        if remaining == 0 {
            self.pending.insert(*id);
            if self.immediate_reclaim {
                // The release itself is durable; a failed sweep leaves the
                // block queued for the next pass.
                if let Err(e) = self.reclaim_one(id, false) {
                    warn!(component = "RECLAIM", block = %id, error = %e, "deferred reclamation");
                }
            }
        }
        Ok(remaining)
    }

    /// Make sure the zero block exists and carries the store's standing
    /// reference. Safe to call any number of times.
    pub fn allocate_block(&self) -> Result<()> {
        let id = self.zero_id;
        let _guard = self.locks.lock(id);

        let existing = self.layout.read_record(&id)?.filter(|r| r.is_live());
        let intact = self.layout.data_len(&id)? == Some(self.block_size as u64);
        if !intact {
            self.layout.write_data(&id, &vec![0u8; self.block_size])?;
        }

        let record = match existing {
            Some(record) if record.flags.contains(BlockFlags::STANDING) => {
                if !intact {
                    warn!(component = "STORE", block = %id, "rewrote missing zero block payload");
                }
                return Ok(());
            }
            Some(mut record) => {
                record.flags.insert(BlockFlags::STANDING);
                record.reference_count += 1;
                record
            }
            None => {
                let mut record = BlockAttributeRecord::new(self.block_size as u64);
                record.flags.insert(BlockFlags::STANDING);
                if self.layout.sync() {
                    record.flags.insert(BlockFlags::SYNCED);
                }
                record
            }
        };
        self.layout.write_record(&id, &record)?;
        self.pending.remove(&id);
        debug!(component = "STORE", block = %id, "zero block allocated");
        Ok(())
    }

    /// Attribute record for `id`, if one exists (including zero-count
    /// records awaiting reclamation).
    pub fn record(&self, id: &BlockId) -> Result<Option<BlockAttributeRecord>> {
        self.layout.read_record(id)
    }

    /// Current reference count; zero for unknown identifiers.
    pub fn reference_count(&self, id: &BlockId) -> Result<u64> {
        Ok(self
            .layout
            .read_record(id)?
            .map(|r| r.reference_count)
            .unwrap_or(0))
    }

    pub fn contains(&self, id: &BlockId) -> Result<bool> {
        Ok(self.reference_count(id)? > 0)
    }

    /// Identifiers of all live blocks.
    pub fn iter(&self) -> impl Iterator<Item = Result<BlockId>> + '_ {
        self.layout.record_ids().filter_map(move |res| match res {
            Ok(id) => match self.layout.read_record(&id) {
                Ok(Some(record)) if record.is_live() => Some(Ok(id)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            block_size: self.block_size as u64,
            ..StoreStats::default()
        };
        for id in self.layout.record_ids() {
            let id = id?;
            match self.layout.read_record(&id)? {
                Some(record) if record.is_live() => {
                    stats.block_count += 1;
                    stats.total_references += record.reference_count;
                    stats.physical_bytes += record.size_bytes;
                    stats.logical_bytes += record.size_bytes * record.reference_count;
                }
                Some(_) => stats.pending_reclaim += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    fn add_reference<'a>(
        &self,
        id: BlockId,
        block: impl FnOnce() -> Cow<'a, [u8]>,
    ) -> Result<u64> {
        let _guard = self.locks.lock(id);

        if let Some(mut record) = self.layout.read_record(&id)? {
            if record.is_live() {
                record.reference_count += 1;
                self.layout.write_record(&id, &record)?;
                debug!(component = "STORE", block = %id, refs = record.reference_count, "dedup hit");
                return Ok(record.reference_count);
            }
        }

        // Miss, or a zero-count record whose payload may already be gone:
        // the payload is republished before the count becomes nonzero.
        self.layout.write_data(&id, &block())?;
        let mut record = BlockAttributeRecord::new(self.block_size as u64);
        if self.layout.sync() {
            record.flags.insert(BlockFlags::SYNCED);
        }
        self.layout.write_record(&id, &record)?;
        self.pending.remove(&id);
        debug!(component = "STORE", block = %id, "block allocated");
        Ok(1)
    }

    fn pad<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        if data.len() == self.block_size {
            Cow::Borrowed(data)
        } else {
            let mut block = Vec::with_capacity(self.block_size);
            block.extend_from_slice(data);
            block.resize(self.block_size, 0);
            Cow::Owned(block)
        }
    }

    fn integrity(&self, id: &BlockId, fault: IntegrityFault) -> BlockError {
        error!(component = "STORE", block = %id, %fault, "integrity violation");
        BlockError::IntegrityViolation { id: *id, fault }
    }

    fn underflow(&self, id: &BlockId, reason: &'static str) -> BlockError {
        error!(component = "STORE", block = %id, reason, "reference count underflow");
        BlockError::Underflow { id: *id, reason }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("attribute_dir", &self.layout.attribute_dir())
            .field("data_dir", &self.layout.data_dir())
            .field("block_size", &self.block_size)
            .field("fanout", &self.layout.fanout())
            .field("zero_block", &self.zero_id)
            .finish()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        match self.reclaim_pending() {
            Ok(reclaimed) => debug!(component = "RECLAIM", reclaimed, "drained on close"),
            Err(e) => warn!(component = "RECLAIM", error = %e, "pending blocks left for the next sweep"),
        }
    }
}

/// Both directories resolved; neither may be or contain the other.
fn check_disjoint(attribute_dir: &Path, data_dir: &Path) -> Result<()> {
    let attribute = fs::canonicalize(attribute_dir).at(attribute_dir)?;
    let data = fs::canonicalize(data_dir).at(data_dir)?;
    if attribute == data {
        return Err(invalid(format!(
            "attribute_dir and data_dir both resolve to {}",
            attribute.display()
        )));
    }
    if attribute.starts_with(&data) || data.starts_with(&attribute) {
        return Err(invalid(format!(
            "attribute_dir {} and data_dir {} are nested",
            attribute.display(),
            data.display()
        )));
    }
    Ok(())
}

fn acquire_owner_lock(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .at(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(BlockError::StoreLocked {
                path: path.to_path_buf(),
            })
        }
        Err(e) => Err(e).at(path),
    }
}

/// Occupancy of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub block_size: u64,
    /// Distinct live blocks (one payload file each)
    pub block_count: u64,
    /// Sum of reference counts over live blocks
    pub total_references: u64,
    /// Bytes actually stored
    pub physical_bytes: u64,
    /// Bytes as seen by the referencing layer
    pub logical_bytes: u64,
    /// Zero-count records not yet reclaimed
    pub pending_reclaim: u64,
}

impl StoreStats {
    /// Logical over physical bytes; 1.0 for an empty store.
    pub fn dedup_ratio(&self) -> f64 {
        if self.physical_bytes == 0 {
            1.0
        } else {
            self.logical_bytes as f64 / self.physical_bytes as f64
        }
    }
}
