//! Reclamation of unreferenced blocks and crash-recovery sweeps.
//!
//! Removal order is payload first, attribute record last. A crash between
//! the two leaves a zero-count record with no payload, which the next
//! [`Store::sweep`] finishes off; a crash while publishing a new block leaves
//! at most an orphaned payload or a temp file, which the sweep also removes.

use std::fs;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::ident::BlockId;
use crate::store::Store;
use crate::{BlockError, IntegrityFault, IoResultExt, Result};

/// Outcome of a consistency sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Zero-count blocks removed
    pub reclaimed: u64,
    /// Zero-count blocks skipped because a reader still holds them
    pub deferred: u64,
    /// Payload files that had no attribute record
    pub orphaned_data: u64,
    /// Temp files left by an earlier process
    pub stale_temp_files: u64,
    /// Fan-out prefix directories left empty
    pub empty_dirs: u64,
}

/// Outcome of re-verifying every live block.
#[derive(Debug, Clone, Default)]
pub struct ScrubReport {
    pub checked: u64,
    pub corrupt: Vec<BlockId>,
    pub missing: Vec<BlockId>,
}

impl ScrubReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.missing.is_empty()
    }
}

impl Store {
    /// Try to remove a zero-count block. With `wait == false` a contended
    /// identifier is left queued instead of blocking.
    pub(crate) fn reclaim_one(&self, id: &BlockId, wait: bool) -> Result<bool> {
        let guard = if wait {
            Some(self.locks.lock(*id))
        } else {
            self.locks.try_lock(*id)
        };
        let Some(_guard) = guard else {
            debug!(component = "RECLAIM", block = %id, "contended, left queued");
            return Ok(false);
        };

        match self.layout.read_record(id)? {
            Some(record) if !record.is_live() => {}
            _ => {
                // re-referenced or already gone
                self.pending.remove(id);
                return Ok(false);
            }
        }

        let Some(_claim) = self.pins.begin_reclaim(*id) else {
            debug!(component = "RECLAIM", block = %id, "pinned by a reader, left queued");
            return Ok(false);
        };
        self.layout.remove_data(id)?;
        self.layout.remove_record(id)?;
        self.pending.remove(id);
        debug!(component = "RECLAIM", block = %id, "block reclaimed");
        Ok(true)
    }

    /// Deferred reclamation pass over every queued block.
    /// Returns how many were removed.
    pub fn reclaim_pending(&self) -> Result<usize> {
        let queued: Vec<BlockId> = self.pending.iter().map(|id| *id).collect();
        let mut reclaimed = 0;
        for id in &queued {
            if self.reclaim_one(id, true)? {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Number of blocks queued for reclamation in this process.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Consistency sweep: finish interrupted reclamations, drop payloads
    /// without a record and delete temp files from dead writers.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let record_ids: Vec<BlockId> = self.layout.record_ids().collect::<Result<_>>()?;
        for id in &record_ids {
            match self.layout.read_record(id) {
                Ok(Some(record)) if !record.is_live() => {
                    self.pending.insert(*id);
                    if self.reclaim_one(id, true)? {
                        report.reclaimed += 1;
                    } else {
                        report.deferred += 1;
                    }
                }
                Ok(_) => {}
                Err(BlockError::CorruptRecord { id, source }) => {
                    // never guess a reference count
                    warn!(component = "RECLAIM", block = %id, error = %source, "skipping corrupt record");
                }
                Err(e) => return Err(e),
            }
        }

        let data_ids: Vec<BlockId> = self.layout.data_ids().collect::<Result<_>>()?;
        for id in &data_ids {
            let _guard = self.locks.lock(*id);
            match self.layout.read_record(id) {
                Ok(None) => {
                    if self.layout.remove_data(id)? {
                        debug!(component = "RECLAIM", block = %id, "removed orphaned payload");
                        report.orphaned_data += 1;
                    }
                }
                Ok(Some(_)) | Err(BlockError::CorruptRecord { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let me = std::process::id();
        for (path, owner) in self.layout.temp_files()? {
            // temp files of this process may belong to an in-flight write
            if owner == Some(me) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => report.stale_temp_files += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).at(&path),
            }
        }

        report.empty_dirs = self.layout.prune_empty_prefixes()?;

        info!(
            component = "RECLAIM",
            reclaimed = report.reclaimed,
            deferred = report.deferred,
            orphaned_data = report.orphaned_data,
            stale_temp_files = report.stale_temp_files,
            empty_dirs = report.empty_dirs,
            "sweep complete"
        );
        Ok(report)
    }

    /// Re-read and re-digest every live block.
    pub fn scrub(&self) -> Result<ScrubReport> {
        let ids: Vec<BlockId> = self.iter().collect::<Result<_>>()?;
        let outcomes: Vec<(BlockId, Result<Vec<u8>>)> =
            ids.par_iter().map(|id| (*id, self.get(id))).collect();

        let mut report = ScrubReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => report.checked += 1,
                Err(BlockError::IntegrityViolation {
                    fault: IntegrityFault::MissingData,
                    ..
                }) => {
                    report.checked += 1;
                    report.missing.push(id);
                }
                Err(BlockError::IntegrityViolation { .. }) => {
                    report.checked += 1;
                    report.corrupt.push(id);
                }
                // released while scrubbing
                Err(BlockError::BlockNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            component = "RECLAIM",
            checked = report.checked,
            corrupt = report.corrupt.len(),
            missing = report.missing.len(),
            "scrub complete"
        );
        Ok(report)
    }
}
