#![no_main]
use blockstore::{BlockConfig, BlockManager};
use libfuzzer_sys::fuzz_target;

// An arbitrary journal next to a small data file: opening may fail with an
// error, and whatever opens must only serve ranges inside the data file
fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let split = data.len().min(256);
    let (block, journal) = data.split_at(split);

    if std::fs::write(dir.path().join("block_0.bin"), block).is_err()
        || std::fs::write(dir.path().join("block_0.journal"), journal).is_err()
    {
        return;
    }

    let Ok(store) = BlockManager::open(BlockConfig::new(dir.path())) else {
        return;
    };
    for info in store.stats().blocks {
        assert!(info.live_bytes <= info.end);
        assert!(info.end <= block.len() as u64);
    }
});
