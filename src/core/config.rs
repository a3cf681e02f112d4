//! Store configuration
//!
//! Loaded from TOML (every key optional) or assembled with the `with_*`
//! builders. [`BlockConfig::validate`] runs before anything touches disk.
//!
//! ```toml
//! storage_dir = "/var/lib/images/blocks"
//! max_block_size = 10485760
//! compression = true
//! compression_method = "zstd"
//! encryption = true
//! encryption_key = "w8GAZrfJeFqii2t8B0Mj36JvSWDIKM8YE2UkPeHfhdA="
//! cache_size = 50
//! ```

use crate::compression::CompressionMethod;
use crate::error::{BlockError, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use validator::Validate;

pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_CACHE_SIZE: usize = 5;
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.5;

/// Symmetric key material as supplied by the operator
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial(<{} bytes>)", self.0.len())
    }
}

impl From<&str> for KeyMaterial {
    fn from(s: &str) -> Self {
        KeyMaterial(s.as_bytes().to_vec())
    }
}

impl From<String> for KeyMaterial {
    fn from(s: String) -> Self {
        KeyMaterial(s.into_bytes())
    }
}

impl From<Vec<u8>> for KeyMaterial {
    fn from(bytes: Vec<u8>) -> Self {
        KeyMaterial(bytes)
    }
}

impl From<[u8; 32]> for KeyMaterial {
    fn from(bytes: [u8; 32]) -> Self {
        KeyMaterial(bytes.to_vec())
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(KeyMaterial::from)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct BlockConfig {
    /// Directory holding block files and their journals
    pub storage_dir: PathBuf,

    /// Upper bound on each block file, in bytes
    #[validate(range(min = 1))]
    pub max_block_size: u64,

    pub compression: bool,
    pub compression_method: CompressionMethod,
    /// Payloads smaller than this are never compressed
    pub compression_threshold: usize,

    pub encryption: bool,
    pub encryption_key: Option<KeyMaterial>,

    /// Maximum number of decoded payloads held in memory
    #[validate(range(min = 1))]
    pub cache_size: usize,

    /// Independently locked cache partitions; 1 keeps exact LRU order
    #[validate(range(min = 1))]
    pub cache_shards: usize,

    /// Reclaimable fraction of a block file that triggers compaction
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub compaction_threshold: f64,

    /// Compact after deletes push a block over the threshold
    pub auto_compact: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        BlockConfig {
            storage_dir: PathBuf::from("blocks"),
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            compression: false,
            compression_method: CompressionMethod::Lz4,
            compression_threshold: 512,
            encryption: false,
            encryption_key: None,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_shards: 1,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            auto_compact: true,
        }
    }
}

impl BlockConfig {
    pub fn new<P: AsRef<Path>>(storage_dir: P) -> Self {
        BlockConfig {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: BlockConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BlockError::ConfigError(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn with_max_block_size(mut self, bytes: u64) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method != CompressionMethod::None;
        self.compression_method = method;
        self
    }

    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compression_threshold = bytes;
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<KeyMaterial>) -> Self {
        self.encryption = true;
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_cache_size(mut self, entries: usize) -> Self {
        self.cache_size = entries;
        self
    }

    pub fn with_cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    pub fn with_compaction(mut self, threshold: f64, auto_compact: bool) -> Self {
        self.compaction_threshold = threshold;
        self.auto_compact = auto_compact;
        self
    }

    /// Check ranges and the encryption/key pairing
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;

        match (self.encryption, &self.encryption_key) {
            (true, None) => {
                return Err(BlockError::ConfigError(
                    "encryption enabled but no encryption_key given".to_string(),
                ))
            }
            (true, Some(key)) if key.is_empty() => {
                return Err(BlockError::ConfigError(
                    "encryption_key must not be empty".to_string(),
                ))
            }
            (false, Some(_)) => {
                return Err(BlockError::ConfigError(
                    "encryption_key given but encryption is disabled".to_string(),
                ))
            }
            _ => {}
        }

        if self.compression && self.compression_method == CompressionMethod::None {
            return Err(BlockError::ConfigError(
                "compression enabled with method \"none\"".to_string(),
            ));
        }

        if self.cache_shards > self.cache_size {
            return Err(BlockError::ConfigError(format!(
                "cache_shards ({}) exceeds cache_size ({})",
                self.cache_shards, self.cache_size
            )));
        }

        Ok(())
    }
}
