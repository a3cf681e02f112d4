//! Block file allocation
//!
//! The allocator owns every block file under the storage directory. New
//! payloads are appended to the single active file; once a payload would push
//! it past `max_block_size` a fresh file with the next id becomes active.
//! Deleted ranges go to a per-file free list and are reclaimed by compaction,
//! which copies the survivors into a fresh file with the next id. Block ids
//! therefore only grow, and no `(block, offset, length)` triple is ever handed
//! out twice.
//!
//! Locking: each block file sits behind its own `RwLock` (reads shared;
//! append, free and compact exclusive). The active-file pointer is a `Mutex`
//! held across appends and compactions so rollover is atomic. Lock order is
//! active pointer, then block file. The file table lock is only held briefly
//! and never while waiting for a block file.
//!
//! `max_block_size` can be changed while the store is open. The new bound is
//! set under the active pointer's lock, so the next append and any rollover
//! or compaction output observe it.

pub mod block_file;
pub mod extent;
pub mod journal;

pub use block_file::{BlockFile, BlockFileInfo, STAGING_SUFFIX};
pub use journal::REWRITE_SUFFIX;

use crate::error::{BlockError, Result};
use crate::locator::{BlockId, Locator, Relocation, StoredImage};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type SharedBlockFile = Arc<RwLock<BlockFile>>;

pub struct BlockAllocator {
    dir: PathBuf,
    /// Only written with `active` held
    max_block_size: AtomicU64,
    files: RwLock<BTreeMap<BlockId, SharedBlockFile>>,
    active: Mutex<BlockId>,
}

impl BlockAllocator {
    /// Open (or initialize) the block files under `dir`
    pub fn open<P: AsRef<Path>>(dir: P, max_block_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        check_block_size(max_block_size)?;

        std::fs::create_dir_all(&dir).map_err(|e| {
            BlockError::AllocationFailure(format!(
                "cannot create storage dir {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if name.ends_with(STAGING_SUFFIX) || name.ends_with(REWRITE_SUFFIX) {
                // Left by a compaction or journal rewrite that never committed
                warn!(file = name, "removing uncommitted staging file");
                std::fs::remove_file(entry.path())?;
            } else if let Some(id) = BlockId::from_data_file_name(name) {
                ids.push(id);
            }
        }
        ids.sort();

        let mut files = BTreeMap::new();
        for &id in &ids {
            let file = BlockFile::open(&dir, id, max_block_size)?;
            files.insert(id, Arc::new(RwLock::new(file)));
        }

        let active = match ids.last() {
            Some(&id) => id,
            None => {
                let id = BlockId(0);
                let file = BlockFile::create(&dir, id, max_block_size)?;
                files.insert(id, Arc::new(RwLock::new(file)));
                id
            }
        };

        info!(
            dir = %dir.display(),
            blocks = files.len(),
            active = %active,
            "opened block allocator"
        );

        Ok(BlockAllocator {
            dir,
            max_block_size: AtomicU64::new(max_block_size),
            files: RwLock::new(files),
            active: Mutex::new(active),
        })
    }

    fn file(&self, id: BlockId) -> Result<SharedBlockFile> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| BlockError::NotFound(format!("block file {} does not exist", id)))
    }

    /// Append encoded bytes, rolling over to a new block file when full
    pub fn append(&self, bytes: &[u8], record: StoredImage) -> Result<Locator> {
        self.append_with(bytes, record, |_| {})
    }

    /// Append, then run `f` with the new locator before the file lock is released
    pub fn append_with<F: FnOnce(&Locator)>(
        &self,
        bytes: &[u8],
        record: StoredImage,
        f: F,
    ) -> Result<Locator> {
        let len = bytes.len() as u64;
        if len == 0 {
            return Err(BlockError::AllocationFailure(
                "cannot allocate an empty range".to_string(),
            ));
        }

        let mut active = self.active.lock();
        let max_block_size = self.max_block_size.load(Ordering::Relaxed);
        if len > max_block_size {
            return Err(BlockError::AllocationFailure(format!(
                "payload of {} bytes exceeds max_block_size {}",
                len, max_block_size
            )));
        }
        let current = self.file(*active)?;
        {
            let mut file = current.write();
            if file.fits(len) {
                let locator = file.append(bytes, record)?;
                f(&locator);
                return Ok(locator);
            }
        }

        let previous = *active;
        let next = previous.next();
        let mut file = BlockFile::create(&self.dir, next, max_block_size)?;
        let locator = file.append(bytes, record)?;
        // Not yet visible to other threads
        f(&locator);
        self.files
            .write()
            .insert(next, Arc::new(RwLock::new(file)));
        *active = next;

        info!(previous = %previous, active = %next, "rolled over to new block file");
        Ok(locator)
    }

    /// Read the encoded bytes of a live locator
    pub fn read_range(&self, locator: &Locator) -> Result<Vec<u8>> {
        self.read_range_with(locator, |bytes, _| Ok(bytes))
    }

    /// Read a live range and run `f` on it while the file's shared lock is held
    ///
    /// Frees and compactions of this block file wait until `f` returns.
    pub fn read_range_with<T, F>(&self, locator: &Locator, f: F) -> Result<T>
    where
        F: FnOnce(Vec<u8>, StoredImage) -> Result<T>,
    {
        let file = self.file(locator.block_id)?;
        let guard = file.read();
        let (bytes, record) = guard.read(locator)?;
        f(bytes, record)
    }

    /// Index record of a live locator
    pub fn lookup(&self, locator: &Locator) -> Result<StoredImage> {
        self.file(locator.block_id)?.read().lookup(locator)
    }

    pub fn free(&self, locator: &Locator) -> Result<()> {
        self.free_with(locator, || {})
    }

    /// Free a live range, running `f` after validation and before the range
    /// is marked free, all under the file's exclusive lock
    pub fn free_with<F: FnOnce()>(&self, locator: &Locator, f: F) -> Result<()> {
        let file = self.file(locator.block_id)?;
        let mut guard = file.write();
        guard.lookup(locator)?;
        f();
        guard.free(locator)?;
        debug!(locator = %locator, "freed range");
        Ok(())
    }

    /// Compact `id` if its reclaimable fraction exceeds `threshold`
    ///
    /// `f` sees the relocations before the exclusive lock is released.
    pub fn maybe_compact<F>(
        &self,
        id: BlockId,
        threshold: f64,
        f: F,
    ) -> Result<Option<Vec<Relocation>>>
    where
        F: FnOnce(&[Relocation]),
    {
        let mut active = self.active.lock();
        let file = self.file(id)?;
        let mut guard = file.write();
        if guard.info().reclaimable_fraction() <= threshold {
            return Ok(None);
        }
        self.compact_locked(&mut active, &mut guard, f).map(Some)
    }

    /// Compact `id` unconditionally
    pub fn compact<F>(&self, id: BlockId, f: F) -> Result<Vec<Relocation>>
    where
        F: FnOnce(&[Relocation]),
    {
        let mut active = self.active.lock();
        let file = self.file(id)?;
        let mut guard = file.write();
        if guard.end() == 0 {
            return Ok(Vec::new());
        }
        self.compact_locked(&mut active, &mut guard, f)
    }

    /// Replace `file` with a packed copy under the next id, which becomes active
    ///
    /// An empty file that is not active is simply removed.
    fn compact_locked<F>(
        &self,
        active: &mut BlockId,
        file: &mut BlockFile,
        f: F,
    ) -> Result<Vec<Relocation>>
    where
        F: FnOnce(&[Relocation]),
    {
        let id = file.id();

        if file.info().live_ranges == 0 && id != *active {
            file.retire();
            f(&[]);
            self.files.write().remove(&id);
            info!(block = %id, "removed empty block file");
            return Ok(Vec::new());
        }

        let target = active.next();
        let max_block_size = self.max_block_size.load(Ordering::Relaxed);
        let (compacted, relocations) = file.compact_into(&self.dir, target, max_block_size)?;
        f(&relocations);
        file.retire();

        {
            let mut files = self.files.write();
            files.insert(target, Arc::new(RwLock::new(compacted)));
            files.remove(&id);
        }
        *active = target;
        Ok(relocations)
    }

    pub fn block_info(&self, id: BlockId) -> Result<BlockFileInfo> {
        Ok(self.file(id)?.read().info())
    }

    /// Summaries of every block file, in id order
    pub fn blocks(&self) -> Vec<BlockFileInfo> {
        let files: Vec<SharedBlockFile> = self.files.read().values().cloned().collect();
        files.iter().map(|file| file.read().info()).collect()
    }

    pub fn active_block(&self) -> BlockId {
        *self.active.lock()
    }

    pub fn max_block_size(&self) -> u64 {
        self.max_block_size.load(Ordering::Relaxed)
    }

    /// Change the size bound for the active file and every file created later
    ///
    /// A bound below the active file's current end makes the next append
    /// roll over. Files that are no longer active keep their old bound.
    pub fn set_max_block_size(&self, max_block_size: u64) -> Result<()> {
        check_block_size(max_block_size)?;

        let active = self.active.lock();
        self.max_block_size.store(max_block_size, Ordering::Relaxed);
        self.file(*active)?.write().set_max_size(max_block_size);

        info!(max_block_size, active = %*active, "changed block size bound");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush every block file and journal to stable storage
    pub fn sync(&self) -> Result<()> {
        let files: Vec<SharedBlockFile> = self.files.read().values().cloned().collect();
        for file in files {
            file.read().sync()?;
        }
        Ok(())
    }
}

fn check_block_size(max_block_size: u64) -> Result<()> {
    if max_block_size == 0 {
        return Err(BlockError::ConfigError(
            "max_block_size must be positive".to_string(),
        ));
    }
    Ok(())
}
