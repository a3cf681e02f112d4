//! # Blockstore - Block-Structured Image Storage
//!
//! `blockstore` packs many small binary payloads (images, thumbnails, blobs)
//! into a handful of large block files instead of one file per payload.
//!
//! - **Append-only block files** capped at `max_block_size`, with rollover
//! - **Stable locators**: `(block, offset, size)` handed back on save
//! - **Optional compression** (LZ4 or Zstd) and **AES-256-GCM encryption**
//! - **SHA-256 verification** of every payload on read
//! - **LRU cache** of decoded payloads
//! - **Compaction** of block files once enough of them is dead space
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockstore::{BlockConfig, BlockManager, Result};
//!
//! # fn main() -> Result<()> {
//! let store = BlockManager::open(BlockConfig::new("/var/lib/images/blocks"))?;
//!
//! let meta = store.save_image(b"\x89PNG...")?;
//! let bytes = store.read_image(&meta.locator)?;
//! assert_eq!(&*bytes, b"\x89PNG...");
//!
//! let outcome = store.delete_image(&meta.locator)?;
//! for moved in outcome.relocations {
//!     println!("{} is now {}", moved.from, moved.to);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use blockstore::{BlockConfig, BlockManager, CompressionMethod, Result};
//!
//! # fn main() -> Result<()> {
//! let config = BlockConfig::new("blocks")
//!     .with_max_block_size(64 * 1024 * 1024)
//!     .with_compression(CompressionMethod::Zstd)
//!     .with_encryption_key(BlockManager::generate_encryption_key())
//!     .with_cache_size(256);
//!
//! let store = BlockManager::open(config)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    allocator, cache, codec, compression, config, encryption, error, locator, manager,
};

#[cfg(feature = "async")]
pub use crate::core::handle::AsyncBlockManager;

pub use crate::core::{
    allocator::BlockFileInfo,
    cache::CacheStats,
    codec::BlockCodec,
    compression::{CompressionMethod, CompressionPolicy},
    config::{BlockConfig, KeyMaterial},
    encryption::{EncryptionKey, PayloadCipher},
    error::{BlockError, Result},
    locator::{BlockId, Checksum, Encoding, ImageMetadata, Locator, Relocation},
    manager::{BlockManager, DeleteOutcome, ManagerStats},
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
