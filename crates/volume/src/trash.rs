//! The trash worker: consumes block delete requests.

use crate::manager::VolumeManager;
use cairn_core::config::Config;
use cairn_core::locator::Locator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One queued request to trash a block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrashRequest {
    /// Block locator; only the hash part is used.
    pub locator: String,
    /// Unix nanoseconds. The block is trashed only on volumes whose stored
    /// mtime matches exactly; a block touched since the request was issued
    /// is left alone.
    pub block_mtime: i64,
    /// Restrict the request to one volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_uuid: Option<String>,
}

/// Consume trash requests until the channel closes or `ctx` cancels.
///
/// With `enable_delete` off every request is dropped; the queue keeps
/// draining so producers never back up.
pub async fn run_trash_worker(
    ctx: CancellationToken,
    config: Arc<Config>,
    manager: Arc<VolumeManager>,
    mut requests: mpsc::Receiver<TrashRequest>,
) {
    loop {
        let request = tokio::select! {
            _ = ctx.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        handle_request(&config, &manager, request).await;
    }
    info!("trash worker stopped");
}

async fn handle_request(config: &Config, manager: &VolumeManager, request: TrashRequest) {
    if !config.enable_delete {
        warn!(locator = %request.locator, "delete is disabled; ignoring trash request");
        return;
    }

    let hash = match request.locator.parse::<Locator>() {
        Ok(locator) => locator.hash,
        Err(err) => {
            warn!(locator = %request.locator, %err, "malformed locator in trash request");
            return;
        }
    };

    for volume in manager.writable() {
        if let Some(mount) = &request.mount_uuid {
            if volume.device_id() != *mount {
                continue;
            }
        }

        let mtime = match volume.mtime(&hash).await {
            Ok(t) => t,
            Err(err) if err.is_not_found() => continue,
            Err(err) => {
                warn!(volume = %volume.device_id(), loc = %hash, %err,
                    "cannot read mtime for trash request");
                continue;
            }
        };
        if mtime.unix_timestamp_nanos() != i128::from(request.block_mtime) {
            debug!(volume = %volume.device_id(), loc = %hash,
                "block mtime changed since trash request; skipping");
            continue;
        }

        match volume.trash(&hash).await {
            Ok(()) => debug!(volume = %volume.device_id(), loc = %hash, "block trashed"),
            Err(err) => {
                warn!(volume = %volume.device_id(), loc = %hash, %err, "trash failed");
            }
        }
    }
}
