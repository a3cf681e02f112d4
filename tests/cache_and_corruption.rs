//! Payload cache behaviour and on-disk corruption detection

use blockstore::{BlockConfig, BlockError, BlockManager, CompressionMethod};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

fn flip_byte(path: &Path, offset: u64) {
    let mut raw = std::fs::read(path).unwrap();
    raw[offset as usize] ^= 0xFF;
    std::fs::write(path, raw).unwrap();
}

#[test]
fn test_cache_evicts_least_recently_used() {
    let dir = TempDir::new().unwrap();
    let n = 3;
    let store = BlockManager::open(BlockConfig::new(dir.path()).with_cache_size(n)).unwrap();

    let metas: Vec<_> = (0..=n as u8)
        .map(|i| store.save_image(&[i; 32]).unwrap())
        .collect();

    // Saving N+1 payloads evicted the first one
    let stats = store.stats().cache;
    assert_eq!(stats.entries, n);
    assert_eq!(stats.evictions, 1);

    // Reading the evicted one misses and evicts the next-oldest
    assert_eq!(&*store.read_image(&metas[0].locator).unwrap(), &[0u8; 32][..]);
    let stats = store.stats().cache;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.entries, n);

    store.read_image(&metas[2].locator).unwrap();
    store.read_image(&metas[3].locator).unwrap();
    let stats = store.stats().cache;
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);

    // metas[1] was the victim
    store.read_image(&metas[1].locator).unwrap();
    assert_eq!(store.stats().cache.misses, 2);
}

#[test]
fn test_delete_invalidates_cache_entry() {
    let dir = TempDir::new().unwrap();
    let store = BlockManager::open(
        BlockConfig::new(dir.path()).with_compaction(0.5, false),
    )
    .unwrap();

    let keep = store.save_image(b"keep").unwrap();
    let gone = store.save_image(b"gone").unwrap();
    store.read_image(&gone.locator).unwrap();
    assert_eq!(store.stats().cache.entries, 2);

    store.delete_image(&gone.locator).unwrap();
    assert_eq!(store.stats().cache.entries, 1);
    assert!(store.read_image(&gone.locator).unwrap_err().is_not_found());
    assert_eq!(&*store.read_image(&keep.locator).unwrap(), b"keep");
}

/// Save one payload per config, flip a byte inside it, reopen cold, read
fn corrupted_read(config: BlockConfig, payload: &[u8]) -> BlockError {
    let meta = {
        let store = BlockManager::open(config.clone()).unwrap();
        let meta = store.save_image(payload).unwrap();
        store.sync().unwrap();
        meta
    };

    let data_path = config.storage_dir.join(meta.locator.block_id.data_file_name());
    flip_byte(&data_path, meta.locator.offset + meta.locator.length / 2);

    let store = BlockManager::open(config).unwrap();
    store.read_image(&meta.locator).unwrap_err()
}

#[test]
fn test_flipped_byte_is_corrupt_data() {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 97) as u8).collect();

    let configs = |dir: &TempDir| {
        vec![
            BlockConfig::new(dir.path().join("plain")),
            BlockConfig::new(dir.path().join("lz4")).with_compression(CompressionMethod::Lz4),
            BlockConfig::new(dir.path().join("zstd")).with_compression(CompressionMethod::Zstd),
            BlockConfig::new(dir.path().join("aes")).with_encryption_key("k"),
            BlockConfig::new(dir.path().join("zstd-aes"))
                .with_compression(CompressionMethod::Zstd)
                .with_encryption_key("k"),
        ]
    };

    let dir = TempDir::new().unwrap();
    for config in configs(&dir) {
        let label = config.storage_dir.display().to_string();
        let err = corrupted_read(config, &payload);
        assert!(err.is_corrupt(), "{}: {}", label, err);
        assert_eq!(err.http_status(), 422);
    }
}

#[test]
fn test_truncated_block_file_never_returns_wrong_bytes() {
    let dir = TempDir::new().unwrap();
    let config = BlockConfig::new(dir.path());

    let (first, second) = {
        let store = BlockManager::open(config.clone()).unwrap();
        let first = store.save_image(&[1u8; 100]).unwrap();
        let second = store.save_image(&[2u8; 100]).unwrap();
        store.sync().unwrap();
        (first, second)
    };

    let file = OpenOptions::new()
        .write(true)
        .open(dir.path().join("block_0.bin"))
        .unwrap();
    file.set_len(150).unwrap();
    drop(file);

    let store = BlockManager::open(config).unwrap();
    assert_eq!(&*store.read_image(&first.locator).unwrap(), &[1u8; 100][..]);
    assert!(store.read_image(&second.locator).unwrap_err().is_not_found());

    // Appends resume at the truncated end without clobbering the survivor
    let third = store.save_image(&[3u8; 10]).unwrap();
    assert_eq!(third.locator.offset, 150);
    assert_eq!(&*store.read_image(&first.locator).unwrap(), &[1u8; 100][..]);
}

#[test]
fn test_torn_journal_tail_is_tolerated() {
    let dir = TempDir::new().unwrap();
    let config = BlockConfig::new(dir.path());

    let meta = {
        let store = BlockManager::open(config.clone()).unwrap();
        let meta = store.save_image(b"durable").unwrap();
        store.sync().unwrap();
        meta
    };

    let mut journal = OpenOptions::new()
        .append(true)
        .open(dir.path().join("block_0.journal"))
        .unwrap();
    journal.write_all(b"deadbeef {\"op\":\"pu").unwrap();
    drop(journal);

    let store = BlockManager::open(config.clone()).unwrap();
    assert_eq!(&*store.read_image(&meta.locator).unwrap(), b"durable");

    // The torn line was dropped for good
    drop(store);
    let raw = std::fs::read_to_string(dir.path().join("block_0.journal")).unwrap();
    assert!(raw.ends_with('\n'));
    assert!(!raw.contains("deadbeef"));
}

#[test]
fn test_damaged_journal_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let config = BlockConfig::new(dir.path()).with_compaction(0.5, false);

    {
        let store = BlockManager::open(config.clone()).unwrap();
        let a = store.save_image(b"one").unwrap();
        store.save_image(b"two").unwrap();
        store.delete_image(&a.locator).unwrap();
        store.sync().unwrap();
    }

    let mut journal = OpenOptions::new()
        .write(true)
        .open(dir.path().join("block_0.journal"))
        .unwrap();
    journal.seek(SeekFrom::Start(2)).unwrap();
    journal.write_all(b"zz").unwrap();
    drop(journal);

    assert!(matches!(
        BlockManager::open(config),
        Err(BlockError::CorruptData(_))
    ));
}

#[test]
fn test_short_journal_write_does_not_poison_store() {
    let dir = TempDir::new().unwrap();
    let config = BlockConfig::new(dir.path());

    let (first, second) = {
        let store = BlockManager::open(config.clone()).unwrap();
        let first = store.save_image(b"first").unwrap();

        // Half an entry, as left by a write that failed partway
        let mut journal = OpenOptions::new()
            .append(true)
            .open(dir.path().join("block_0.journal"))
            .unwrap();
        journal.write_all(b"deadbeef {\"op\":\"put\",\"off").unwrap();
        drop(journal);

        let second = store.save_image(b"second").unwrap();
        assert_eq!(&*store.read_image(&second.locator).unwrap(), b"second");
        (first, second)
    };

    let store = BlockManager::open(config).unwrap();
    assert_eq!(&*store.read_image(&first.locator).unwrap(), b"first");
    assert_eq!(&*store.read_image(&second.locator).unwrap(), b"second");
}
