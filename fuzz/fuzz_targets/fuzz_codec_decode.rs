#![no_main]
use arbitrary::Arbitrary;
use blockstore::core::locator::{Checksum, Encoding, StoredImage};
use blockstore::{BlockCodec, CompressionMethod, CompressionPolicy, PayloadCipher};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Method {
    None,
    Lz4,
    Zstd,
}

#[derive(Arbitrary, Debug)]
struct Input {
    method: Method,
    encrypted: bool,
    original_size: u16,
    stored: Vec<u8>,
}

// Decoding arbitrary stored bytes may fail but must never panic or
// return bytes that fail verification
fuzz_target!(|input: Input| {
    let compression = match input.method {
        Method::None => CompressionMethod::None,
        Method::Lz4 => CompressionMethod::Lz4,
        Method::Zstd => CompressionMethod::Zstd,
    };
    let codec = BlockCodec::new(
        CompressionPolicy::with_method(CompressionMethod::Lz4),
        Some(PayloadCipher::new(&[3u8; 32])),
    );

    let record = StoredImage {
        original_size: input.original_size as u64,
        encoding: Encoding {
            compression,
            encrypted: input.encrypted,
        },
        checksum: Checksum::of(&input.stored),
    };

    if let Ok(raw) = codec.decode_verified(&input.stored, &record) {
        assert_eq!(raw.len() as u64, record.original_size);
        assert_eq!(Checksum::of(&raw), record.checksum);
    }
});
