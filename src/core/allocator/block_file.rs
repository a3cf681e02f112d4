//! One append-only block file plus its in-memory index
//!
//! Layout on disk is `block_<n>.bin` (raw encoded payloads, back to back) and
//! `block_<n>.journal` (see [`journal`](super::journal)). The in-memory index
//! holds the live ranges keyed by offset and the coalesced free list. Bytes
//! between `end` and the live ranges that are neither live nor journaled as
//! free (left behind by a crash between data write and journal write) are
//! still counted as reclaimable.

use super::extent::{Extent, FreeList};
use super::journal::{Journal, JournalEntry};
use crate::error::{BlockError, Result};
use crate::locator::{BlockId, Locator, Relocation, StoredImage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(std::io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct LiveRange {
    length: u64,
    record: StoredImage,
}

/// Point-in-time summary of a block file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockFileInfo {
    pub id: BlockId,
    /// Current end of the file (next append offset)
    pub end: u64,
    pub max_size: u64,
    pub live_bytes: u64,
    /// Bytes journaled as freed
    pub free_bytes: u64,
    pub live_ranges: usize,
    pub free_extents: usize,
}

impl BlockFileInfo {
    /// Fraction of the file not occupied by live payloads
    pub fn reclaimable_fraction(&self) -> f64 {
        if self.end == 0 {
            0.0
        } else {
            (self.end - self.live_bytes) as f64 / self.end as f64
        }
    }
}

pub struct BlockFile {
    id: BlockId,
    path: PathBuf,
    data: File,
    journal: Journal,
    end: u64,
    max_size: u64,
    live: BTreeMap<u64, LiveRange>,
    live_bytes: u64,
    free: FreeList,
    retired: bool,
}

/// Suffix of files staged by compaction and not yet renamed into place
pub const STAGING_SUFFIX: &str = ".compact";

impl BlockFile {
    /// Create a new, empty block file
    pub fn create<P: AsRef<Path>>(dir: P, id: BlockId, max_size: u64) -> Result<Self> {
        let path = dir.as_ref().join(id.data_file_name());
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                BlockError::AllocationFailure(format!("cannot create {}: {}", path.display(), e))
            })?;
        let journal = Journal::create(dir.as_ref().join(id.journal_file_name()))?;

        Ok(BlockFile {
            id,
            path,
            data,
            journal,
            end: 0,
            max_size,
            live: BTreeMap::new(),
            live_bytes: 0,
            free: FreeList::new(),
            retired: false,
        })
    }

    /// Open an existing block file and rebuild its index from the journal
    pub fn open<P: AsRef<Path>>(dir: P, id: BlockId, max_size: u64) -> Result<Self> {
        let path = dir.as_ref().join(id.data_file_name());
        let data = OpenOptions::new().read(true).write(true).open(&path)?;
        let end = data.metadata()?.len();

        let journal_path = dir.as_ref().join(id.journal_file_name());
        let (journal, entries, torn_tail) = if journal_path.exists() {
            let replay = Journal::replay(&journal_path)?;
            (Journal::open(&journal_path)?, replay.entries, replay.torn_tail)
        } else {
            warn!(block = %id, "no journal found, contents are unreachable");
            (Journal::create(&journal_path)?, Vec::new(), false)
        };

        let mut file = BlockFile {
            id,
            path,
            data,
            journal,
            end,
            max_size,
            live: BTreeMap::new(),
            live_bytes: 0,
            free: FreeList::new(),
            retired: false,
        };

        let mut kept = Vec::with_capacity(entries.len());
        let mut rejected = 0usize;
        for entry in entries {
            if file.apply(&entry) {
                kept.push(entry);
            } else {
                rejected += 1;
            }
        }

        // Rejected entries must not come back once the file grows again
        if torn_tail || rejected > 0 {
            warn!(block = %id, torn_tail, rejected, "rewriting journal");
            file.journal.rewrite(&kept)?;
        }

        debug!(
            block = %id,
            end = file.end,
            live = file.live.len(),
            "opened block file"
        );
        Ok(file)
    }

    /// Replay one journal entry into the in-memory index
    ///
    /// Returns `false` for entries that do not fit the file as found on disk.
    fn apply(&mut self, entry: &JournalEntry) -> bool {
        match *entry {
            JournalEntry::Put {
                offset,
                length,
                record,
            } => {
                let overlaps_live = self
                    .live
                    .range(..offset.saturating_add(length))
                    .next_back()
                    .map(|(&start, range)| start + range.length > offset)
                    .unwrap_or(false);
                if offset.saturating_add(length) > self.end || length == 0 || overlaps_live {
                    warn!(block = %self.id, offset, length, "journaled range does not fit block file");
                    return false;
                }
                self.live.insert(offset, LiveRange { length, record });
                self.live_bytes += length;
                true
            }
            JournalEntry::Free { offset, length } => match self.live.get(&offset) {
                Some(range) if range.length == length => {
                    self.live.remove(&offset);
                    self.live_bytes -= length;
                    self.free.insert(Extent::new(offset, length));
                    true
                }
                _ => {
                    debug!(block = %self.id, offset, length, "free of unknown range dropped");
                    false
                }
            },
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Whether `len` more bytes fit under the size bound
    pub fn fits(&self, len: u64) -> bool {
        !self.retired
            && self
                .end
                .checked_add(len)
                .map(|new_end| new_end <= self.max_size)
                .unwrap_or(false)
    }

    /// Append encoded bytes at the current end
    ///
    /// Data is written before its journal record.
    pub fn append(&mut self, bytes: &[u8], record: StoredImage) -> Result<Locator> {
        let offset = self.end;
        let length = bytes.len() as u64;

        if let Err(e) = write_all_at(&self.data, bytes, offset) {
            self.truncate_data(offset);
            return Err(BlockError::AllocationFailure(format!(
                "write to {} failed: {}",
                self.id, e
            )));
        }

        let journaled = self.journal.append(&JournalEntry::Put {
            offset,
            length,
            record,
        });
        if let Err(e) = journaled {
            // Unindexed bytes would only count as reclaimable space
            self.truncate_data(offset);
            return Err(e);
        }
        self.end += length;

        self.live.insert(offset, LiveRange { length, record });
        self.live_bytes += length;

        Ok(Locator::new(self.id, offset, length))
    }

    /// Drop whatever part of a failed append landed past `end`
    fn truncate_data(&self, end: u64) {
        if let Err(e) = self.data.set_len(end) {
            warn!(block = %self.id, end, error = %e, "cannot cut back failed append");
        }
    }

    /// Bound later appends by `max_size`
    ///
    /// Bytes already past a lowered bound stay readable; the file just stops
    /// accepting appends.
    pub fn set_max_size(&mut self, max_size: u64) {
        self.max_size = max_size;
    }

    fn live_range(&self, locator: &Locator) -> Result<&LiveRange> {
        if locator.block_id != self.id {
            return Err(BlockError::NotFound(format!("{} not in {}", locator, self.id)));
        }
        match locator.end() {
            Some(end) if end <= self.end => {}
            _ => {
                return Err(BlockError::NotFound(format!(
                    "{} exceeds block end {}",
                    locator, self.end
                )))
            }
        }
        match self.live.get(&locator.offset) {
            Some(range) if range.length == locator.length => Ok(range),
            _ => Err(BlockError::NotFound(format!("{} is not a live range", locator))),
        }
    }

    /// Index record of a live locator
    pub fn lookup(&self, locator: &Locator) -> Result<StoredImage> {
        self.live_range(locator).map(|range| range.record)
    }

    /// Read the encoded bytes of a live locator
    pub fn read(&self, locator: &Locator) -> Result<(Vec<u8>, StoredImage)> {
        let record = self.live_range(locator)?.record;
        let mut buf = vec![0u8; locator.length as usize];
        read_exact_at(&self.data, &mut buf, locator.offset)?;
        Ok((buf, record))
    }

    /// Move a live range to the free list
    pub fn free(&mut self, locator: &Locator) -> Result<()> {
        let length = self.live_range(locator)?.length;

        self.journal.append(&JournalEntry::Free {
            offset: locator.offset,
            length,
        })?;

        self.live.remove(&locator.offset);
        self.live_bytes -= length;
        self.free.insert(Extent::new(locator.offset, length));
        Ok(())
    }

    /// Copy every live range, in offset order, into a new block file `target`
    ///
    /// Offsets in the new file are packed from zero, so every live image gets
    /// a new locator. The new file is staged under temporary names and only
    /// renamed into place once written and synced; on error nothing new is
    /// visible and this file is untouched. The caller retires this file.
    pub fn compact_into<P: AsRef<Path>>(
        &self,
        dir: P,
        target: BlockId,
        max_size: u64,
    ) -> Result<(BlockFile, Vec<Relocation>)> {
        let dir = dir.as_ref();
        let data_tmp = dir.join(format!("{}{}", target.data_file_name(), STAGING_SUFFIX));
        let journal_tmp = dir.join(format!("{}{}", target.journal_file_name(), STAGING_SUFFIX));

        let staged = self.stage_compacted(target, &data_tmp, &journal_tmp);
        if staged.is_err() {
            for path in [&data_tmp, &journal_tmp] {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot remove staged compaction output")
                    }
                }
            }
        }
        let relocations = staged?;

        // Data first: a crash in between leaves a data file without a journal,
        // which opens as unreachable bytes rather than a dangling index
        std::fs::rename(&data_tmp, dir.join(target.data_file_name()))?;
        std::fs::rename(&journal_tmp, dir.join(target.journal_file_name()))?;

        let compacted = BlockFile::open(dir, target, max_size)?;
        info!(
            block = %self.id,
            into = %target,
            before = self.end,
            after = compacted.end,
            moved = relocations.len(),
            "compacted block file"
        );
        Ok((compacted, relocations))
    }

    fn stage_compacted(
        &self,
        target: BlockId,
        data_tmp: &Path,
        journal_tmp: &Path,
    ) -> Result<Vec<Relocation>> {
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(data_tmp)?;
        let mut journal = Journal::create(journal_tmp)?;

        let mut relocations = Vec::with_capacity(self.live.len());
        let mut cursor = 0u64;

        for (&offset, range) in &self.live {
            let mut buf = vec![0u8; range.length as usize];
            read_exact_at(&self.data, &mut buf, offset)?;
            write_all_at(&data, &buf, cursor)?;
            journal.append(&JournalEntry::Put {
                offset: cursor,
                length: range.length,
                record: range.record,
            })?;

            relocations.push(Relocation {
                from: Locator::new(self.id, offset, range.length),
                to: Locator::new(target, cursor, range.length),
            });
            cursor += range.length;
        }

        data.sync_all()?;
        journal.sync()?;
        Ok(relocations)
    }

    /// Drop the index and delete the files from disk
    ///
    /// Every locator into this file is NotFound afterwards, including for
    /// threads still holding a handle to it.
    pub fn retire(&mut self) {
        self.retired = true;
        self.live.clear();
        self.live_bytes = 0;
        self.free.clear();

        // Journal first so a partial removal never leaves an index over missing data
        for path in [self.journal.path().to_path_buf(), self.path.clone()] {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(block = %self.id, path = %path.display(), error = %e, "cannot remove retired file");
            }
        }
        debug!(block = %self.id, "retired block file");
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn info(&self) -> BlockFileInfo {
        BlockFileInfo {
            id: self.id,
            end: self.end,
            max_size: self.max_size,
            live_bytes: self.live_bytes,
            free_bytes: self.free.free_bytes(),
            live_ranges: self.live.len(),
            free_extents: self.free.extent_count(),
        }
    }

    /// Flush data and journal to stable storage
    pub fn sync(&self) -> Result<()> {
        self.data.sync_data()?;
        self.journal.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::{Checksum, Encoding};
    use tempfile::TempDir;

    fn record(data: &[u8]) -> StoredImage {
        StoredImage {
            original_size: data.len() as u64,
            encoding: Encoding::PLAIN,
            checksum: Checksum::of(data),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();

        let a = file.append(&[1u8; 100], record(&[1u8; 100])).unwrap();
        let b = file.append(&[2u8; 200], record(&[2u8; 200])).unwrap();

        assert_eq!(a, Locator::new(BlockId(0), 0, 100));
        assert_eq!(b, Locator::new(BlockId(0), 100, 200));
        assert_eq!(file.read(&b).unwrap().0, vec![2u8; 200]);
        assert_eq!(file.end(), 300);
    }

    #[test]
    fn test_only_exact_live_ranges_are_readable() {
        let dir = TempDir::new().unwrap();
        let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();
        file.append(&[1u8; 100], record(&[1u8; 100])).unwrap();

        for bogus in [
            Locator::new(BlockId(0), 0, 50),
            Locator::new(BlockId(0), 10, 90),
            Locator::new(BlockId(0), 0, 500),
            Locator::new(BlockId(0), u64::MAX, 2),
            Locator::new(BlockId(1), 0, 100),
        ] {
            assert!(file.read(&bogus).unwrap_err().is_not_found(), "{}", bogus);
        }
    }

    #[test]
    fn test_free_is_terminal() {
        let dir = TempDir::new().unwrap();
        let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();
        let a = file.append(&[1u8; 100], record(&[1u8; 100])).unwrap();

        file.free(&a).unwrap();
        assert!(file.read(&a).unwrap_err().is_not_found());
        assert!(file.free(&a).unwrap_err().is_not_found());

        let info = file.info();
        assert_eq!(info.free_bytes, 100);
        assert_eq!(info.live_bytes, 0);
        assert_eq!(info.end, 100);
    }

    #[test]
    fn test_reopen_restores_index() {
        let dir = TempDir::new().unwrap();
        let (a, b) = {
            let mut file = BlockFile::create(dir.path(), BlockId(3), 1000).unwrap();
            let a = file.append(b"first", record(b"first")).unwrap();
            let b = file.append(b"second", record(b"second")).unwrap();
            file.free(&a).unwrap();
            (a, b)
        };

        let file = BlockFile::open(dir.path(), BlockId(3), 1000).unwrap();
        assert!(file.read(&a).unwrap_err().is_not_found());
        assert_eq!(file.read(&b).unwrap().0, b"second");
        assert_eq!(file.lookup(&b).unwrap(), record(b"second"));
        assert_eq!(file.end(), 11);
    }

    #[test]
    fn test_stray_journal_bytes_do_not_poison_reopen() {
        use std::io::Write;

        let dir = TempDir::new().unwrap();
        let (a, b) = {
            let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();
            let a = file.append(b"first", record(b"first")).unwrap();

            // What a short journal write leaves behind
            let mut journal = OpenOptions::new()
                .append(true)
                .open(dir.path().join("block_0.journal"))
                .unwrap();
            journal.write_all(b"deadbeef {\"op\":\"put\",\"off").unwrap();

            let b = file.append(b"second", record(b"second")).unwrap();
            (a, b)
        };

        let file = BlockFile::open(dir.path(), BlockId(0), 1000).unwrap();
        assert_eq!(file.read(&a).unwrap().0, b"first");
        assert_eq!(file.read(&b).unwrap().0, b"second");
        assert_eq!(file.info().live_ranges, 2);
    }

    #[test]
    fn test_lowered_bound_stops_appends() {
        let dir = TempDir::new().unwrap();
        let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();
        let a = file.append(&[1u8; 300], record(&[1u8; 300])).unwrap();

        assert!(file.fits(500));
        file.set_max_size(200);
        assert!(!file.fits(1));
        assert_eq!(file.read(&a).unwrap().0, vec![1u8; 300]);
        assert_eq!(file.info().max_size, 200);
    }

    #[test]
    fn test_compact_into_new_file() {
        let dir = TempDir::new().unwrap();
        let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();

        let a = file.append(&[1u8; 100], record(&[1u8; 100])).unwrap();
        let b = file.append(&[2u8; 200], record(&[2u8; 200])).unwrap();
        let c = file.append(&[3u8; 300], record(&[3u8; 300])).unwrap();
        file.free(&b).unwrap();

        let (mut compacted, relocations) = file.compact_into(dir.path(), BlockId(1), 1000).unwrap();
        let moved_a = Locator::new(BlockId(1), 0, 100);
        let moved_c = Locator::new(BlockId(1), 100, 300);
        assert_eq!(
            relocations,
            vec![
                Relocation { from: a, to: moved_a },
                Relocation { from: c, to: moved_c },
            ]
        );

        assert_eq!(compacted.end(), 400);
        assert_eq!(compacted.read(&moved_a).unwrap().0, vec![1u8; 100]);
        assert_eq!(compacted.read(&moved_c).unwrap().0, vec![3u8; 300]);
        assert_eq!(compacted.lookup(&moved_c).unwrap(), record(&[3u8; 300]));
        assert_eq!(std::fs::metadata(dir.path().join("block_1.bin")).unwrap().len(), 400);
        assert!(!dir.path().join("block_1.bin.compact").exists());
        assert!(!dir.path().join("block_1.journal.compact").exists());

        // The source is intact until retired
        assert_eq!(file.read(&c).unwrap().0, vec![3u8; 300]);
        file.retire();
        assert!(file.is_retired());
        assert!(file.read(&c).unwrap_err().is_not_found());
        assert!(file.free(&a).unwrap_err().is_not_found());
        assert!(!file.fits(1));
        assert!(!dir.path().join("block_0.bin").exists());
        assert!(!dir.path().join("block_0.journal").exists());

        // Appends continue after the packed data
        let d = compacted.append(&[4u8; 10], record(&[4u8; 10])).unwrap();
        assert_eq!(d, Locator::new(BlockId(1), 400, 10));

        drop(compacted);
        let reopened = BlockFile::open(dir.path(), BlockId(1), 1000).unwrap();
        assert_eq!(reopened.read(&moved_c).unwrap().0, vec![3u8; 300]);
        assert_eq!(reopened.read(&d).unwrap().0, vec![4u8; 10]);
        assert_eq!(reopened.info().free_bytes, 0);
    }

    #[test]
    fn test_missing_journal_makes_bytes_unreachable() {
        let dir = TempDir::new().unwrap();
        {
            let mut file = BlockFile::create(dir.path(), BlockId(0), 1000).unwrap();
            file.append(&[9u8; 50], record(&[9u8; 50])).unwrap();
        }
        std::fs::remove_file(dir.path().join("block_0.journal")).unwrap();

        let file = BlockFile::open(dir.path(), BlockId(0), 1000).unwrap();
        let info = file.info();
        assert_eq!(info.end, 50);
        assert_eq!(info.live_ranges, 0);
        assert_eq!(info.reclaimable_fraction(), 1.0);
    }

    #[test]
    fn test_fits() {
        let dir = TempDir::new().unwrap();
        let mut file = BlockFile::create(dir.path(), BlockId(0), 100).unwrap();
        assert!(file.fits(100));
        assert!(!file.fits(101));
        file.append(&[0u8; 60], record(&[0u8; 60])).unwrap();
        assert!(file.fits(40));
        assert!(!file.fits(41));
        assert!(!file.fits(u64::MAX));
    }
}
