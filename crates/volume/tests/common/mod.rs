// Not every test binary exercises every helper.
#![allow(dead_code)]

pub mod memory;

use cairn_core::config::{Config, VolumeTuning};
use cairn_core::locator::BlockHash;
use cairn_volume::CloudVolume;
use memory::MemoryBucket;
use std::sync::Arc;

pub const FOO_HASH: &str = "acbd18db4cc2f85cedef654fccc4a4d8";
pub const BAR_HASH: &str = "37b51d194a7513e45b56f6524f2d51f2";

pub fn foo_hash() -> BlockHash {
    FOO_HASH.parse().unwrap()
}

pub fn bar_hash() -> BlockHash {
    BAR_HASH.parse().unwrap()
}

/// One hour TTL and lifetime, one minute race window: short enough that
/// tests can backdate markers into any phase of the lifecycle.
pub fn test_config() -> Config {
    Config {
        blob_signature_ttl_secs: 3600,
        trash_lifetime_secs: 3600,
        trash_check_interval_secs: 60,
        empty_trash_workers: 2,
        enable_delete: true,
    }
}

pub fn test_tuning() -> VolumeTuning {
    VolumeTuning {
        race_window_secs: 60,
        replication: 1,
        ..VolumeTuning::default()
    }
}

pub struct TestVolume {
    pub bucket: Arc<MemoryBucket>,
    pub volume: CloudVolume,
}

pub fn make_volume(config: Config, tuning: VolumeTuning) -> TestVolume {
    make_named_volume("mem://test/bucket", config, tuning, false)
}

pub fn make_named_volume(
    device: &str,
    config: Config,
    tuning: VolumeTuning,
    unsafe_delete: bool,
) -> TestVolume {
    let bucket = Arc::new(MemoryBucket::new(device));
    let volume = CloudVolume::new(
        bucket.clone(),
        Arc::new(config),
        &tuning,
        unsafe_delete,
        "memory",
    );
    TestVolume { bucket, volume }
}
