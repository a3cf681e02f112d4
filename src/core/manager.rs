//! Image store API
//!
//! [`BlockManager`] ties the codec, the allocator and the payload cache
//! together. It is an explicit handle: open one per storage directory, share
//! it behind an `Arc`, and pass it to every request handler.
//!
//! ## Coherence
//!
//! - save populates the cache while the block file's exclusive lock is held
//! - a read miss decodes and populates the cache under the shared lock
//! - delete invalidates and frees under the exclusive lock
//! - compaction invalidates every relocated locator under the exclusive lock
//!
//! So once `delete_image` returns, no reader can observe the payload, and no
//! cache entry outlives the range it was read from.

use crate::allocator::{BlockAllocator, BlockFileInfo};
use crate::cache::{BlockCache, CacheStats};
use crate::codec::BlockCodec;
use crate::config::BlockConfig;
use crate::encryption::{self, EncryptionKey};
use crate::error::{BlockError, Result};
use crate::locator::{BlockId, ImageMetadata, Locator, Relocation};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a delete
///
/// If the delete triggered compaction, `relocations` lists the surviving
/// images of that block file whose locators changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub freed: Locator,
    pub relocations: Vec<Relocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub cache: CacheStats,
    pub active_block: BlockId,
    pub blocks: Vec<BlockFileInfo>,
}

pub struct BlockManager {
    config: BlockConfig,
    codec: BlockCodec,
    allocator: BlockAllocator,
    cache: BlockCache,
}

impl BlockManager {
    /// Validate `config` and open the store it describes
    pub fn open(config: BlockConfig) -> Result<Self> {
        config.validate()?;

        let codec = BlockCodec::from_config(&config)?;
        let allocator = BlockAllocator::open(&config.storage_dir, config.max_block_size)?;
        let cache = BlockCache::new(config.cache_size, config.cache_shards);

        Ok(BlockManager {
            config,
            codec,
            allocator,
            cache,
        })
    }

    /// Encode and store a payload
    pub fn save_image(&self, raw: &[u8]) -> Result<ImageMetadata> {
        if raw.is_empty() {
            return Err(BlockError::AllocationFailure(
                "cannot store an empty payload".to_string(),
            ));
        }

        let encoded = self.codec.encode(raw)?;
        let record = encoded.record();
        let payload: Arc<[u8]> = Arc::from(raw);

        let locator = self
            .allocator
            .append_with(&encoded.bytes, record, |locator| {
                self.cache.put(*locator, payload);
            })?;

        debug!(
            locator = %locator,
            original_size = raw.len(),
            compression = ?record.encoding.compression,
            encrypted = record.encoding.encrypted,
            "saved image"
        );
        Ok(ImageMetadata::new(locator, record))
    }

    /// Fetch a payload, from cache when possible
    pub fn read_image(&self, locator: &Locator) -> Result<Arc<[u8]>> {
        if let Some(hit) = self.cache.get(locator) {
            debug!(locator = %locator, "cache hit");
            return Ok(hit);
        }

        self.allocator.read_range_with(locator, |bytes, record| {
            let raw = self.codec.decode_verified(&bytes, &record).map_err(|e| {
                warn!(locator = %locator, error = %e, "stored payload failed verification");
                e
            })?;

            let raw: Arc<[u8]> = Arc::from(raw);
            self.cache.put(*locator, Arc::clone(&raw));
            debug!(locator = %locator, "read image from disk");
            Ok(raw)
        })
    }

    /// Delete a payload; the locator is dead once this returns
    pub fn delete_image(&self, locator: &Locator) -> Result<DeleteOutcome> {
        self.allocator.free_with(locator, || {
            self.cache.invalidate(locator);
        })?;
        debug!(locator = %locator, "deleted image");

        let mut relocations = Vec::new();
        if self.config.auto_compact {
            let compacted = self.allocator.maybe_compact(
                locator.block_id,
                self.config.compaction_threshold,
                |moved| self.invalidate_relocated(moved),
            );
            match compacted {
                Ok(Some(moved)) => relocations = moved,
                Ok(None) => {}
                // A concurrent delete already compacted this block away
                Err(e) if e.is_not_found() => {
                    debug!(block = %locator.block_id, "block already compacted")
                }
                // The file is untouched on failure; the delete itself stands
                Err(e) => warn!(block = %locator.block_id, error = %e, "compaction after delete failed"),
            }
        }

        Ok(DeleteOutcome {
            freed: *locator,
            relocations,
        })
    }

    /// Compact a block file now, regardless of threshold
    pub fn compact(&self, block_id: BlockId) -> Result<Vec<Relocation>> {
        self.allocator
            .compact(block_id, |moved| self.invalidate_relocated(moved))
    }

    fn invalidate_relocated(&self, moved: &[Relocation]) {
        for relocation in moved {
            self.cache.invalidate(&relocation.from);
        }
    }

    /// Metadata of a live image
    pub fn metadata(&self, locator: &Locator) -> Result<ImageMetadata> {
        let record = self.allocator.lookup(locator)?;
        Ok(ImageMetadata::new(*locator, record))
    }

    /// [`read_image`](Self::read_image) addressed by the external triple
    pub fn read(&self, block: &str, offset: u64, size: u64) -> Result<Arc<[u8]>> {
        self.read_image(&Locator::new(block.parse()?, offset, size))
    }

    /// [`delete_image`](Self::delete_image) addressed by the external triple
    pub fn delete(&self, block: &str, offset: u64, size: u64) -> Result<DeleteOutcome> {
        self.delete_image(&Locator::new(block.parse()?, offset, size))
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            cache: self.cache.stats(),
            active_block: self.allocator.active_block(),
            blocks: self.allocator.blocks(),
        }
    }

    /// Flush all block files and journals to stable storage
    pub fn sync(&self) -> Result<()> {
        self.allocator.sync()
    }

    /// Configuration the store was opened with
    ///
    /// `max_block_size` here is the value at open; see
    /// [`max_block_size`](Self::max_block_size) for the bound in force.
    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn max_block_size(&self) -> u64 {
        self.allocator.max_block_size()
    }

    /// Change the block size bound while the store is open
    ///
    /// Applies to the active block file and every one created afterwards.
    /// Existing locators are unaffected. Zero is a ConfigError.
    pub fn set_max_block_size(&self, bytes: u64) -> Result<()> {
        self.allocator.set_max_block_size(bytes)
    }

    /// Random 32-byte key suitable for `encryption_key`
    pub fn generate_encryption_key() -> EncryptionKey {
        encryption::generate_key()
    }
}
