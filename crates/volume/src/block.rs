//! The hashed block API spanning volumes.

use crate::error::{Error, Result};
use crate::io::collect_verified;
use crate::manager::VolumeManager;
use bytes::Bytes;
use cairn_core::BLOCK_SIZE;
use cairn_core::locator::{BlockHash, Locator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fetch a block, trying readable volumes in order and verifying the body's
/// MD5 against the locator. A volume whose copy fails verification is
/// treated as corrupt and skipped.
pub async fn get_block(
    ctx: &CancellationToken,
    manager: &VolumeManager,
    locator: &Locator,
) -> Result<Bytes> {
    let hash = &locator.hash;
    let mut last_err: Option<Error> = None;

    for volume in manager.readable() {
        let stream = match volume.get_stream(ctx, hash).await {
            Ok(stream) => stream,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) if err.is_not_found() => continue,
            Err(err) => {
                debug!(volume = %volume.device_id(), loc = %hash, %err, "read failed");
                last_err = Some(err);
                continue;
            }
        };
        match collect_verified(stream, *hash, BLOCK_SIZE).await {
            Ok(body) => {
                if let Some(size) = locator.size {
                    if body.len() as u64 != size {
                        warn!(volume = %volume.device_id(), loc = %hash,
                            want = size, got = body.len(),
                            "stored block has wrong size; trying next volume");
                        continue;
                    }
                }
                return Ok(body);
            }
            Err(Error::Checksum { expected, actual }) => {
                warn!(volume = %volume.device_id(), loc = %hash, %expected, %actual,
                    "stored block is corrupt; trying next volume");
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                debug!(volume = %volume.device_id(), loc = %hash, %err, "read failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::NotFound(hash.to_hex())))
}

/// Store a block with the desired replication.
///
/// Volumes already holding an identical copy are touched instead of
/// rewritten; remaining replication is met by writing to writable volumes
/// in rotated order. Returns the replication level achieved.
pub async fn put_block(
    ctx: &CancellationToken,
    manager: &VolumeManager,
    locator: &Locator,
    block: Bytes,
    want_replicas: usize,
) -> Result<usize> {
    let hash = &locator.hash;
    let actual = BlockHash::compute(&block);
    if actual != *hash {
        return Err(Error::Checksum {
            expected: hash.to_hex(),
            actual: actual.to_hex(),
        });
    }

    let mut replicas = compare_and_touch(ctx, manager, hash, &block).await?;
    if replicas >= want_replicas {
        return Ok(replicas);
    }

    for volume in manager.writable_rotated() {
        if replicas >= want_replicas {
            break;
        }
        match volume.put(ctx, hash, block.clone()).await {
            Ok(()) => replicas += volume.replication(),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(volume = %volume.device_id(), loc = %hash, %err, "write failed");
            }
        }
    }

    if replicas >= want_replicas {
        Ok(replicas)
    } else {
        Err(Error::NotEnoughReplicas {
            want: want_replicas,
            got: replicas,
        })
    }
}

/// If a writable volume already holds this block with identical contents,
/// freshen its timestamp instead of writing a new copy.
async fn compare_and_touch(
    ctx: &CancellationToken,
    manager: &VolumeManager,
    hash: &BlockHash,
    block: &Bytes,
) -> Result<usize> {
    for volume in manager.writable() {
        match volume.compare(ctx, hash, block).await {
            Ok(()) => {
                if let Err(err) = volume.touch(hash).await {
                    warn!(volume = %volume.device_id(), loc = %hash, %err,
                        "block found but touch failed");
                    continue;
                }
                return Ok(volume.replication());
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::Checksum { .. }) => {
                // Stored data does not match its own name; leave the copy
                // for the corruption report and write a good one elsewhere.
                warn!(volume = %volume.device_id(), loc = %hash,
                    "stored block differs from uploaded data");
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                debug!(volume = %volume.device_id(), loc = %hash, %err, "compare failed");
            }
        }
    }
    Ok(0)
}
