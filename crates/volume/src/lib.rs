//! Object-store volumes for Cairn.
//!
//! This crate provides:
//! - Bucket adapters for S3-compatible and Azure blob backends, with
//!   per-call counters and canonical not-found classification
//! - The block lifecycle state machine over `<hash>` / `recent/<hash>` /
//!   `trash/<hash>` keys, including race recovery
//! - The volume manager and the hashed block API spanning volumes
//! - The trash worker consuming delete requests

pub mod backends;
pub mod block;
pub mod bucket;
pub mod cloud;
pub mod error;
pub mod io;
pub mod lister;
pub mod manager;
pub mod stats;
pub mod trash;
pub mod volume;

pub use block::{get_block, put_block};
pub use bucket::{BlobBucket, CountedBucket, KeyInfo, ListPage, ObjectInfo};
pub use cloud::{CloudVolume, EmptyTrashStats};
pub use error::{Error, Result};
pub use io::{ByteStream, CountingStream, HashCheckReader};
pub use manager::VolumeManager;
pub use trash::{TrashRequest, run_trash_worker};
pub use volume::{Volume, VolumeStatus};

use backends::azure::AzureBucket;
use backends::s3::S3Bucket;
use cairn_core::config::{Config, VolumeConfig};
use std::sync::Arc;

/// Build a volume manager from configuration.
pub fn from_config(config: Arc<Config>, volumes: &[VolumeConfig]) -> Result<VolumeManager> {
    let mut built: Vec<Arc<dyn Volume>> = Vec::with_capacity(volumes.len());
    for volume_config in volumes {
        volume_config.validate()?;
        let volume = match volume_config {
            VolumeConfig::S3 {
                bucket,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
                force_path_style,
                tuning,
                unsafe_delete,
            } => {
                let adapter = S3Bucket::new(
                    bucket,
                    endpoint.clone(),
                    region.clone(),
                    access_key_id.clone(),
                    secret_access_key.clone(),
                    *force_path_style,
                    tuning.connect_timeout(),
                    tuning.read_timeout(),
                )?;
                CloudVolume::new(Arc::new(adapter), config.clone(), tuning, *unsafe_delete, "s3")
            }
            VolumeConfig::Azure {
                container,
                account,
                endpoint,
                access_key,
                tuning,
            } => {
                let adapter = AzureBucket::new(
                    container,
                    account,
                    endpoint.clone(),
                    access_key.clone(),
                    tuning.connect_timeout(),
                    tuning.read_timeout(),
                )?;
                CloudVolume::new(Arc::new(adapter), config.clone(), tuning, false, "azure")
            }
        };
        built.push(Arc::new(volume));
    }
    Ok(VolumeManager::new(built))
}
