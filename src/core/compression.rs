//! Payload compression
//!
//! A [`CompressionPolicy`] decides per payload whether packing it pays off.
//! The method actually used is recorded in the index next to the payload,
//! so a store can switch policy without losing the ability to read older
//! images. LZ4 output starts with the decoded length as a little-endian u32;
//! Zstd frames carry their own header.

use crate::error::{BlockError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

const ZSTD_LEVEL: i32 = 3;

/// Smallest payload worth compressing by default
pub const DEFAULT_MIN_SIZE: usize = 512;

/// Packed output must be below this fraction of the input to be kept
pub const DEFAULT_MAX_RATIO: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    #[default]
    None,
    /// Fast, moderate ratio
    Lz4,
    /// Slower, better ratio
    Zstd,
}

impl CompressionMethod {
    pub fn is_none(self) -> bool {
        self == CompressionMethod::None
    }

    pub fn compress<'a>(self, raw: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        match self {
            CompressionMethod::None => Ok(Cow::Borrowed(raw)),
            CompressionMethod::Lz4 => Ok(Cow::Owned(lz4_flex::compress_prepend_size(raw))),
            CompressionMethod::Zstd => zstd::bulk::compress(raw, ZSTD_LEVEL)
                .map(Cow::Owned)
                .map_err(|e| BlockError::AllocationFailure(format!("zstd compress: {}", e))),
        }
    }

    /// Undo [`compress`](Self::compress), refusing output longer than `max_len`
    ///
    /// The LZ4 length prefix is checked before anything is allocated, so a
    /// damaged header cannot request gigabytes.
    pub fn decompress(self, packed: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let oversized = |claimed: usize| {
            BlockError::CorruptData(format!(
                "{:?} payload decodes to {} bytes, at most {} expected",
                self, claimed, max_len
            ))
        };

        match self {
            CompressionMethod::None if packed.len() > max_len => Err(oversized(packed.len())),
            CompressionMethod::None => Ok(packed.to_vec()),
            CompressionMethod::Lz4 => {
                let prefix: [u8; 4] = packed
                    .get(..4)
                    .and_then(|p| p.try_into().ok())
                    .ok_or_else(|| {
                        BlockError::CorruptData("lz4 payload lacks length prefix".to_string())
                    })?;
                let claimed = u32::from_le_bytes(prefix) as usize;
                if claimed > max_len {
                    return Err(oversized(claimed));
                }
                lz4_flex::decompress_size_prepended(packed)
                    .map_err(|e| BlockError::CorruptData(format!("lz4 decompress: {}", e)))
            }
            CompressionMethod::Zstd => zstd::bulk::decompress(packed, max_len)
                .map_err(|e| BlockError::CorruptData(format!("zstd decompress: {}", e))),
        }
    }
}

/// When and how to compress payloads on save
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionPolicy {
    pub method: CompressionMethod,
    /// Payloads shorter than this are stored as-is
    pub min_size: usize,
    /// Packed output is kept only when `packed / raw` falls below this
    pub max_ratio: f32,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        CompressionPolicy::off()
    }
}

impl CompressionPolicy {
    pub fn off() -> Self {
        CompressionPolicy::with_method(CompressionMethod::None)
    }

    pub fn with_method(method: CompressionMethod) -> Self {
        CompressionPolicy {
            method,
            min_size: DEFAULT_MIN_SIZE,
            max_ratio: DEFAULT_MAX_RATIO,
        }
    }

    pub fn min_size(mut self, bytes: usize) -> Self {
        self.min_size = bytes;
        self
    }

    pub fn is_active(&self) -> bool {
        !self.method.is_none()
    }

    /// Compress `raw` if the policy says so and the result is small enough
    ///
    /// Returns the bytes to store along with the method that produced them.
    pub fn apply<'a>(&self, raw: &'a [u8]) -> Result<(Cow<'a, [u8]>, CompressionMethod)> {
        if !self.is_active() || raw.len() < self.min_size {
            return Ok((Cow::Borrowed(raw), CompressionMethod::None));
        }

        let packed = self.method.compress(raw)?;
        if (packed.len() as f32) < raw.len() as f32 * self.max_ratio {
            Ok((packed, self.method))
        } else {
            Ok((Cow::Borrowed(raw), CompressionMethod::None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect()
    }

    #[test]
    fn test_methods_restore_input() {
        let image = b"RIFF\x00\x00\x00\x00WEBPVP8 ".repeat(200);
        for method in [CompressionMethod::Lz4, CompressionMethod::Zstd] {
            let packed = method.compress(&image).unwrap();
            assert!(packed.len() < image.len(), "{:?} did not shrink", method);
            assert_eq!(method.decompress(&packed, image.len()).unwrap(), image);
        }
    }

    #[test]
    fn test_none_borrows() {
        let packed = CompressionMethod::None.compress(b"as-is").unwrap();
        assert!(matches!(packed, Cow::Borrowed(_)));
        assert_eq!(&*packed, b"as-is");
    }

    #[test]
    fn test_decompress_respects_limit() {
        let image = vec![b'x'; 4096];
        for method in [CompressionMethod::Lz4, CompressionMethod::Zstd] {
            let packed = method.compress(&image).unwrap();
            assert!(method.decompress(&packed, 100).unwrap_err().is_corrupt());
        }
        assert!(CompressionMethod::None
            .decompress(&[0u8; 10], 9)
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn test_lz4_prefix_checked_before_decoding() {
        let mut bogus = u32::MAX.to_le_bytes().to_vec();
        bogus.extend_from_slice(b"tail");
        let err = CompressionMethod::Lz4.decompress(&bogus, 1024).unwrap_err();
        assert!(err.is_corrupt());

        let err = CompressionMethod::Lz4.decompress(&[1, 2], 1024).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let garbage = [0x10u8, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
        for method in [CompressionMethod::Lz4, CompressionMethod::Zstd] {
            assert!(method.decompress(&garbage, 64).unwrap_err().is_corrupt());
        }
    }

    #[test]
    fn test_policy_skips_small_payloads() {
        let policy = CompressionPolicy::with_method(CompressionMethod::Lz4);
        let (bytes, method) = policy.apply(b"tiny").unwrap();
        assert_eq!(method, CompressionMethod::None);
        assert_eq!(&*bytes, b"tiny");

        let (bytes, method) = policy.min_size(2).apply(&[b'a'; 600]).unwrap();
        assert_eq!(method, CompressionMethod::Lz4);
        assert!(bytes.len() < 600);
    }

    #[test]
    fn test_policy_keeps_incompressible_raw() {
        let policy = CompressionPolicy::with_method(CompressionMethod::Zstd).min_size(0);
        let input = noise(2048);
        let (bytes, method) = policy.apply(&input).unwrap();
        if method.is_none() {
            assert_eq!(&*bytes, &input[..]);
        } else {
            assert!((bytes.len() as f32) < input.len() as f32 * DEFAULT_MAX_RATIO);
        }
    }

    #[test]
    fn test_off_policy_never_compresses() {
        let (_, method) = CompressionPolicy::off().apply(&[0u8; 10_000]).unwrap();
        assert_eq!(method, CompressionMethod::None);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&CompressionMethod::Zstd).unwrap(),
            "\"zstd\""
        );
        let method: CompressionMethod = serde_json::from_str("\"lz4\"").unwrap();
        assert_eq!(method, CompressionMethod::Lz4);
    }
}
