//! Per-block index journal
//!
//! Every block file has a sidecar journal recording which ranges hold live
//! images and which were freed. One entry per line:
//!
//! ```text
//! <crc32 of json, 8 hex digits> <json>\n
//! ```
//!
//! Entries are only ever appended, except during compaction where the whole
//! journal is replaced atomically (temp file + rename). A torn final line left
//! by a crash is dropped on replay; damage anywhere else is corruption.
//! A failed append is cut back off the file before the next one is written,
//! so partial bytes never end up between two intact entries.

use crate::error::{BlockError, Result};
use crate::locator::StoredImage;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix of a journal being rewritten, before it is renamed over the original
pub const REWRITE_SUFFIX: &str = ".journal.tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JournalEntry {
    Put {
        offset: u64,
        length: u64,
        record: StoredImage,
    },
    Free {
        offset: u64,
        length: u64,
    },
}

/// Result of replaying a journal file
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<JournalEntry>,
    /// A partial trailing line was discarded
    pub torn_tail: bool,
}

pub struct Journal {
    file: File,
    path: PathBuf,
    /// Length of the intact prefix; anything past it is a failed append
    len: u64,
}

fn encode_line(entry: &JournalEntry) -> Result<String> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("{:08x} {}\n", crc32fast::hash(json.as_bytes()), json))
}

fn decode_line(line: &str) -> Option<JournalEntry> {
    let (crc, json) = line.split_once(' ')?;
    let crc = u32::from_str_radix(crc, 16).ok()?;
    if crc32fast::hash(json.as_bytes()) != crc {
        return None;
    }
    serde_json::from_str(json).ok()
}

impl Journal {
    /// Create an empty journal, replacing any existing one
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Journal {
            file,
            path: path.as_ref().to_path_buf(),
            len: 0,
        })
    }

    /// Open an existing journal for appending
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(&path)?;
        let len = file.metadata()?.len();

        Ok(Journal {
            file,
            path: path.as_ref().to_path_buf(),
            len,
        })
    }

    /// Read every intact entry of a journal file
    pub fn replay<P: AsRef<Path>>(path: P) -> Result<Replay> {
        let raw = std::fs::read(path.as_ref())?;
        let text = String::from_utf8_lossy(&raw);

        let mut replay = Replay::default();
        let lines: Vec<&str> = text.split('\n').collect();
        let last = lines.len().saturating_sub(1);

        for (idx, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match decode_line(line) {
                Some(entry) => replay.entries.push(entry),
                // Only the final line may be incomplete
                None if idx == last => replay.torn_tail = true,
                None => {
                    return Err(BlockError::CorruptData(format!(
                        "journal {} damaged at line {}",
                        path.as_ref().display(),
                        idx + 1
                    )))
                }
            }
        }

        Ok(replay)
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = encode_line(entry)?;

        let on_disk = self.file.metadata()?.len();
        if on_disk > self.len {
            warn!(
                journal = %self.path.display(),
                stray = on_disk - self.len,
                "dropping bytes of an earlier failed append"
            );
            self.file.set_len(self.len)?;
        }

        if let Err(e) = self.file.write_all(line.as_bytes()) {
            self.truncate_to_intact();
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }

    /// Cut the file back to its last intact entry
    ///
    /// If this fails too, the next append retries it before writing.
    fn truncate_to_intact(&mut self) {
        if let Err(e) = self.file.set_len(self.len) {
            warn!(journal = %self.path.display(), error = %e, "cannot cut back failed append");
        }
    }

    /// Atomically replace the journal's contents
    pub fn rewrite(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let tmp_path = self.path.with_extension(&REWRITE_SUFFIX[1..]);

        let mut body = String::new();
        for entry in entries {
            body.push_str(&encode_line(entry)?);
        }

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(body.as_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.len = body.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
