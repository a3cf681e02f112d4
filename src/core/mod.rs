//! Block store internals
//!
//! ## Layers
//!
//! - [`codec`] - Payload transformation (checksum, compression, encryption)
//!   - [`compression`] - LZ4 / Zstd with a benefit check
//!   - [`encryption`] - AES-256-GCM
//! - [`allocator`] - Block files on disk:
//!   - [`allocator::block_file`] - One append-only data file plus its index
//!   - [`allocator::journal`] - Crash-tolerant index journal
//!   - [`allocator::extent`] - Coalescing free list
//! - [`cache`] - Sharded LRU of decoded payloads
//! - [`manager`] - The public store API composing all of the above
//! - [`config`] - TOML configuration and validation
//! - [`locator`] - Addresses, checksums and metadata records
//! - [`error`] - Error taxonomy

pub mod allocator;
pub mod cache;
pub mod codec;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod error;
#[cfg(feature = "async")]
pub mod handle;
pub mod locator;
pub mod manager;

pub use error::{BlockError, Result};
pub use manager::BlockManager;
