//! Addressing and per-image metadata
//!
//! A stored image is addressed by a [`Locator`]: the block file it lives in,
//! the byte offset of its encoded form and the encoded length. Everything a
//! read needs besides the bytes themselves (how they were encoded, what the
//! raw payload hashes to) is kept in a [`StoredImage`] record next to the
//! range in the block file's index.

use crate::compression::CompressionMethod;
use crate::error::BlockError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identifier of one block file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Name of the data file backing this block
    pub fn data_file_name(&self) -> String {
        format!("block_{}.bin", self.0)
    }

    /// Name of the index journal sidecar
    pub fn journal_file_name(&self) -> String {
        format!("block_{}.journal", self.0)
    }

    /// Next block id in sequence
    pub fn next(&self) -> BlockId {
        BlockId(self.0 + 1)
    }

    /// Parse a data file name (`block_<n>.bin`)
    pub fn from_data_file_name(name: &str) -> Option<BlockId> {
        name.strip_prefix("block_")?
            .strip_suffix(".bin")?
            .parse()
            .ok()
            .map(BlockId)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block_{}", self.0)
    }
}

impl FromStr for BlockId {
    type Err = BlockError;

    /// Accepts `block_3`, `block_3.bin` or `3`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_suffix(".bin").unwrap_or(s);
        let digits = trimmed.strip_prefix("block_").unwrap_or(trimmed);
        digits
            .parse::<u32>()
            .map(BlockId)
            .map_err(|_| BlockError::NotFound(format!("invalid block identifier: {:?}", s)))
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Address of one encoded image: (block, offset, length)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locator {
    #[serde(rename = "block")]
    pub block_id: BlockId,
    pub offset: u64,
    #[serde(rename = "size")]
    pub length: u64,
}

impl Locator {
    pub fn new(block_id: BlockId, offset: u64, length: u64) -> Self {
        Locator {
            block_id,
            offset,
            length,
        }
    }

    /// Exclusive end offset, `None` on overflow
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.block_id, self.offset, self.length)
    }
}

/// How a payload was transformed on its way to disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Encoding {
    pub compression: CompressionMethod,
    pub encrypted: bool,
}

impl Encoding {
    /// Stored verbatim
    pub const PLAIN: Encoding = Encoding {
        compression: CompressionMethod::None,
        encrypted: false,
    };

    pub fn compressed(&self) -> bool {
        self.compression != CompressionMethod::None
    }
}

/// SHA-256 of a raw (decoded) payload
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(pub [u8; 32]);

impl Checksum {
    pub fn of(data: &[u8]) -> Self {
        Checksum(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Checksum {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 || !s.is_ascii() {
            return Err(BlockError::CorruptData(format!("invalid checksum: {:?}", s)));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| BlockError::CorruptData(format!("invalid checksum: {:?}", s)))?;
        }
        Ok(Checksum(out))
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Index record kept alongside every live range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    pub original_size: u64,
    pub encoding: Encoding,
    pub checksum: Checksum,
}

/// Metadata handed back to callers on save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMetadata", from = "WireMetadata")]
pub struct ImageMetadata {
    pub locator: Locator,
    pub original_size: u64,
    pub encoding: Encoding,
    pub checksum: Checksum,
}

impl ImageMetadata {
    pub fn new(locator: Locator, record: StoredImage) -> Self {
        ImageMetadata {
            locator,
            original_size: record.original_size,
            encoding: record.encoding,
            checksum: record.checksum,
        }
    }

    pub fn compressed(&self) -> bool {
        self.encoding.compressed()
    }

    pub fn encrypted(&self) -> bool {
        self.encoding.encrypted
    }

    pub fn record(&self) -> StoredImage {
        StoredImage {
            original_size: self.original_size,
            encoding: self.encoding,
            checksum: self.checksum,
        }
    }
}

/// Flat JSON shape served to HTTP clients
#[derive(Serialize, Deserialize)]
struct WireMetadata {
    block: BlockId,
    offset: u64,
    size: u64,
    #[serde(default)]
    compressed: bool,
    #[serde(default)]
    compression: CompressionMethod,
    encrypted: bool,
    original_size: u64,
    checksum: Checksum,
}

impl From<ImageMetadata> for WireMetadata {
    fn from(meta: ImageMetadata) -> Self {
        WireMetadata {
            block: meta.locator.block_id,
            offset: meta.locator.offset,
            size: meta.locator.length,
            compressed: meta.compressed(),
            compression: meta.encoding.compression,
            encrypted: meta.encoding.encrypted,
            original_size: meta.original_size,
            checksum: meta.checksum,
        }
    }
}

impl From<WireMetadata> for ImageMetadata {
    fn from(wire: WireMetadata) -> Self {
        ImageMetadata {
            locator: Locator::new(wire.block, wire.offset, wire.size),
            original_size: wire.original_size,
            encoding: Encoding {
                compression: wire.compression,
                encrypted: wire.encrypted,
            },
            checksum: wire.checksum,
        }
    }
}

/// Old and new address of an image moved by compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    pub from: Locator,
    pub to: Locator,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_parsing() {
        assert_eq!("block_3".parse::<BlockId>().unwrap(), BlockId(3));
        assert_eq!("block_3.bin".parse::<BlockId>().unwrap(), BlockId(3));
        assert_eq!("12".parse::<BlockId>().unwrap(), BlockId(12));
        assert!("block_x".parse::<BlockId>().unwrap_err().is_not_found());

        assert_eq!(BlockId::from_data_file_name("block_7.bin"), Some(BlockId(7)));
        assert_eq!(BlockId::from_data_file_name("block_7.journal"), None);
        assert_eq!(BlockId::from_data_file_name("other.bin"), None);
        assert_eq!(BlockId(7).to_string(), "block_7");
    }

    #[test]
    fn test_locator_end() {
        assert_eq!(Locator::new(BlockId(0), 100, 200).end(), Some(300));
        assert_eq!(Locator::new(BlockId(0), u64::MAX, 1).end(), None);
    }

    #[test]
    fn test_checksum_hex() {
        let sum = Checksum::of(b"abc");
        assert_eq!(
            sum.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(sum.to_hex().parse::<Checksum>().unwrap(), sum);
        assert!("zz".parse::<Checksum>().is_err());
    }

    #[test]
    fn test_metadata_wire_shape() {
        let meta = ImageMetadata {
            locator: Locator::new(BlockId(1), 10, 20),
            original_size: 40,
            encoding: Encoding {
                compression: CompressionMethod::Lz4,
                encrypted: true,
            },
            checksum: Checksum::of(b"payload"),
        };

        let value = serde_json::to_value(meta).unwrap();
        assert_eq!(value["block"], "block_1");
        assert_eq!(value["offset"], 10);
        assert_eq!(value["size"], 20);
        assert_eq!(value["compressed"], true);
        assert_eq!(value["compression"], "lz4");
        assert_eq!(value["encrypted"], true);
        assert_eq!(value["original_size"], 40);

        let back: ImageMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, meta);
    }
}
