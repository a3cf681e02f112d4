#![no_main]
use arbitrary::Arbitrary;
use blockstore::{BlockConfig, BlockManager, CompressionMethod, Locator};
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

#[derive(Arbitrary, Debug)]
enum Op {
    Save(Vec<u8>),
    Read(u8),
    Delete(u8),
    Compact,
    Reopen,
}

#[derive(Arbitrary, Debug)]
struct Input {
    compressed: bool,
    encrypted: bool,
    ops: Vec<Op>,
}

// Model check: the store must agree with a map of live locators
fuzz_target!(|input: Input| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let mut config = BlockConfig::new(dir.path())
        .with_max_block_size(512)
        .with_cache_size(2)
        .with_compression_threshold(16);
    if input.compressed {
        config = config.with_compression(CompressionMethod::Lz4);
    }
    if input.encrypted {
        config = config.with_encryption_key("fuzz");
    }

    let mut store = BlockManager::open(config.clone()).unwrap();
    let mut live: Vec<(Locator, Vec<u8>)> = Vec::new();
    let mut dead: Vec<Locator> = Vec::new();

    for op in input.ops.into_iter().take(64) {
        match op {
            Op::Save(payload) => {
                if let Ok(meta) = store.save_image(&payload) {
                    live.push((meta.locator, payload));
                }
            }
            Op::Read(i) if !live.is_empty() => {
                let (loc, payload) = &live[i as usize % live.len()];
                assert_eq!(&*store.read_image(loc).unwrap(), &payload[..]);
            }
            Op::Read(i) if !dead.is_empty() => {
                let loc = dead[i as usize % dead.len()];
                assert!(store.read_image(&loc).unwrap_err().is_not_found());
            }
            Op::Delete(i) if !live.is_empty() => {
                let (loc, _) = live.remove(i as usize % live.len());
                let outcome = store.delete_image(&loc).unwrap();
                dead.push(loc);

                let moved: HashMap<Locator, Locator> =
                    outcome.relocations.iter().map(|r| (r.from, r.to)).collect();
                for (loc, _) in live.iter_mut() {
                    if let Some(to) = moved.get(loc) {
                        dead.push(*loc);
                        *loc = *to;
                    }
                }
            }
            Op::Compact => {
                let active = store.stats().active_block;
                let Ok(relocations) = store.compact(active) else {
                    continue;
                };
                for relocation in relocations {
                    for (loc, _) in live.iter_mut() {
                        if *loc == relocation.from {
                            dead.push(*loc);
                            *loc = relocation.to;
                        }
                    }
                }
            }
            Op::Reopen => {
                drop(store);
                store = BlockManager::open(config.clone()).unwrap();
            }
            _ => {}
        }
    }

    for (loc, payload) in &live {
        assert_eq!(&*store.read_image(loc).unwrap(), &payload[..]);
    }
});
