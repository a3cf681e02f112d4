//! Payload codec: compress then seal on write, open then decompress on read
//!
//! The codec is a pure function of its configuration. It holds no mutable
//! state and is shared freely between threads.

use crate::compression::CompressionPolicy;
use crate::config::BlockConfig;
use crate::encryption::PayloadCipher;
use crate::error::{BlockError, Result};
use crate::locator::{Checksum, Encoding, StoredImage};
use std::borrow::Cow;

/// Output of [`BlockCodec::encode`]
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Bytes to append to a block file
    pub bytes: Vec<u8>,
    /// Transformations actually applied
    pub encoding: Encoding,
    /// Checksum of the raw input
    pub checksum: Checksum,
    /// Length of the raw input
    pub original_size: u64,
}

impl Encoded {
    /// Index record for the encoded payload
    pub fn record(&self) -> StoredImage {
        StoredImage {
            original_size: self.original_size,
            encoding: self.encoding,
            checksum: self.checksum,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockCodec {
    compression: CompressionPolicy,
    cipher: Option<PayloadCipher>,
}

impl BlockCodec {
    pub fn new(compression: CompressionPolicy, cipher: Option<PayloadCipher>) -> Self {
        BlockCodec {
            compression,
            cipher,
        }
    }

    /// Codec that stores payloads verbatim
    pub fn plain() -> Self {
        BlockCodec::default()
    }

    /// Build from a validated configuration
    pub fn from_config(config: &BlockConfig) -> Result<Self> {
        let compression = if config.compression {
            CompressionPolicy::with_method(config.compression_method)
                .min_size(config.compression_threshold)
        } else {
            CompressionPolicy::off()
        };

        let cipher = match (config.encryption, &config.encryption_key) {
            (true, Some(material)) => Some(PayloadCipher::from_material(material.as_bytes())?),
            (true, None) => {
                return Err(BlockError::ConfigError(
                    "encryption enabled without encryption_key".to_string(),
                ))
            }
            (false, _) => None,
        };

        Ok(BlockCodec::new(compression, cipher))
    }

    pub fn compression(&self) -> &CompressionPolicy {
        &self.compression
    }

    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encode(&self, raw: &[u8]) -> Result<Encoded> {
        let (packed, method) = self.compression.apply(raw)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.seal(&packed)?,
            None => packed.into_owned(),
        };

        Ok(Encoded {
            bytes,
            encoding: Encoding {
                compression: method,
                encrypted: self.cipher.is_some(),
            },
            checksum: Checksum::of(raw),
            original_size: raw.len() as u64,
        })
    }

    /// Decode and verify against the index record
    ///
    /// Output longer than `record.original_size` is refused while
    /// decompressing, so a damaged payload cannot balloon in memory.
    pub fn decode_verified(&self, bytes: &[u8], record: &StoredImage) -> Result<Vec<u8>> {
        let max_len = usize::try_from(record.original_size).map_err(|_| {
            BlockError::CorruptData(format!("implausible original size {}", record.original_size))
        })?;

        let packed = self.unseal(bytes, record.encoding)?;
        let raw = record.encoding.compression.decompress(&packed, max_len)?;
        if raw.len() != max_len {
            return Err(BlockError::CorruptData(format!(
                "decoded {} bytes, expected {}",
                raw.len(),
                max_len
            )));
        }
        Self::verify(&raw, &record.checksum)?;
        Ok(raw)
    }

    fn unseal<'a>(&self, bytes: &'a [u8], encoding: Encoding) -> Result<Cow<'a, [u8]>> {
        match (encoding.encrypted, &self.cipher) {
            (false, _) => Ok(Cow::Borrowed(bytes)),
            (true, Some(cipher)) => cipher.open(bytes).map(Cow::Owned),
            (true, None) => Err(BlockError::CorruptData(
                "payload is encrypted but the store has no key".to_string(),
            )),
        }
    }

    pub fn verify(raw: &[u8], expected: &Checksum) -> Result<()> {
        let actual = Checksum::of(raw);
        if &actual != expected {
            return Err(BlockError::CorruptData(format!(
                "checksum mismatch: expected {}, computed {}",
                expected, actual
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::encryption::{generate_key, SEAL_OVERHEAD};

    fn sealed(method: CompressionMethod) -> BlockCodec {
        BlockCodec::new(
            CompressionPolicy::with_method(method),
            Some(PayloadCipher::new(&generate_key())),
        )
    }

    fn codecs() -> Vec<BlockCodec> {
        vec![
            BlockCodec::plain(),
            BlockCodec::new(CompressionPolicy::with_method(CompressionMethod::Lz4), None),
            BlockCodec::new(CompressionPolicy::with_method(CompressionMethod::Zstd), None),
            sealed(CompressionMethod::None),
            sealed(CompressionMethod::Lz4),
        ]
    }

    #[test]
    fn test_round_trip_all_configurations() {
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"tiny".to_vec(),
            b"WEBP".repeat(1000),
            (0..5000u32).map(|i| (i % 251) as u8).collect(),
        ];

        for codec in codecs() {
            for payload in &payloads {
                let encoded = codec.encode(payload).unwrap();
                let decoded = codec.decode_verified(&encoded.bytes, &encoded.record()).unwrap();
                assert_eq!(&decoded, payload);
            }
        }
    }

    #[test]
    fn test_plain_is_identity() {
        let encoded = BlockCodec::plain().encode(b"hello").unwrap();
        assert_eq!(encoded.bytes, b"hello");
        assert_eq!(encoded.encoding, Encoding::PLAIN);
        assert_eq!(encoded.original_size, 5);
    }

    #[test]
    fn test_flags_reflect_applied_transforms() {
        let codec = sealed(CompressionMethod::Lz4);

        // Below the compression threshold only encryption applies
        let small = codec.encode(b"small").unwrap();
        assert!(!small.encoding.compressed());
        assert!(small.encoding.encrypted);
        assert_eq!(small.bytes.len(), 5 + SEAL_OVERHEAD);

        let large = codec.encode(&b"A".repeat(4096)).unwrap();
        assert!(large.encoding.compressed());
        assert!(large.encoding.encrypted);
    }

    #[test]
    fn test_tampered_ciphertext_is_corrupt() {
        let codec = sealed(CompressionMethod::None);
        let mut encoded = codec.encode(b"payload bytes").unwrap();
        let last = encoded.bytes.len() - 1;
        encoded.bytes[last] ^= 0x01;

        let err = codec.decode_verified(&encoded.bytes, &encoded.record()).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_encrypted_payload_without_key_is_corrupt() {
        let encoded = sealed(CompressionMethod::None).encode(b"locked").unwrap();
        let err = BlockCodec::plain()
            .decode_verified(&encoded.bytes, &encoded.record())
            .unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_understated_size_is_corrupt() {
        let codec = BlockCodec::new(CompressionPolicy::with_method(CompressionMethod::Zstd), None);
        let encoded = codec.encode(&[7u8; 2048]).unwrap();
        assert!(encoded.encoding.compressed());

        let mut record = encoded.record();
        record.original_size = 1024;
        let err = codec.decode_verified(&encoded.bytes, &record).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let codec = BlockCodec::plain();
        let encoded = codec.encode(b"original").unwrap();
        let err = codec
            .decode_verified(b"modified", &encoded.record())
            .unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_codec_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BlockCodec>();
    }
}
