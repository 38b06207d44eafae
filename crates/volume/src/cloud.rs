//! The block lifecycle state machine over a cloud bucket.
//!
//! Three key families hold the state of one block `X`:
//! - `X`: the immutable data object, ContentMD5 = X
//! - `recent/X`: zero-byte marker whose Last-Modified is X's effective
//!   mtime, so touching never rewrites data
//! - `trash/X`: the data pending permanent deletion
//!
//! `trash/` and `recent/` sort above every hex block key (`g > f`), so data
//! listings never have to read past `"g"`.

use crate::bucket::CountedBucket;
use crate::error::{Error, Result};
use crate::io::ByteStream;
use crate::lister::KeyLister;
use crate::stats::StatsSnapshot;
use crate::volume::{Volume, VolumeStatus};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use cairn_core::config::{Config, VolumeTuning};
use cairn_core::locator::{BlockHash, is_block_key};
use cairn_core::BLOCK_SIZE;
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Copies whose returned timestamp trails the local clock by more than this
/// are treated as failed (the backend acknowledged the request without
/// refreshing the destination).
const MAX_CLOCK_SKEW: time::Duration = time::Duration::seconds(600);

/// Gate a volume operation on the ambient cancellation token. An already
/// cancelled token wins over an already ready operation.
async fn gated<T>(ctx: &CancellationToken, op: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        result = op => result,
    }
}

fn data_key(loc: &BlockHash) -> String {
    loc.to_hex()
}

fn recent_key(loc: &BlockHash) -> String {
    format!("recent/{loc}")
}

fn trash_key(loc: &BlockHash) -> String {
    format!("trash/{loc}")
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// A volume backed by a cloud bucket. Cheap to clone; sweep workers share
/// the same state.
#[derive(Clone)]
pub struct CloudVolume {
    inner: Arc<Inner>,
}

struct Inner {
    bucket: CountedBucket,
    signature_ttl: time::Duration,
    trash_lifetime: time::Duration,
    race_window: time::Duration,
    empty_trash_workers: usize,
    index_page_size: usize,
    read_only: bool,
    replication: usize,
    storage_classes: Vec<String>,
    unsafe_delete: bool,
    volume_type: &'static str,
}

impl CloudVolume {
    pub fn new(
        adapter: Arc<dyn crate::bucket::BlobBucket>,
        config: Arc<Config>,
        tuning: &VolumeTuning,
        unsafe_delete: bool,
        volume_type: &'static str,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket: CountedBucket::new(adapter),
                signature_ttl: time::Duration::seconds(config.blob_signature_ttl_secs as i64),
                trash_lifetime: time::Duration::seconds(config.trash_lifetime_secs as i64),
                race_window: time::Duration::seconds(tuning.race_window_secs as i64),
                empty_trash_workers: config.empty_trash_workers,
                index_page_size: tuning.index_page_size,
                read_only: tuning.read_only,
                replication: tuning.replication,
                storage_classes: tuning.storage_classes.clone(),
                unsafe_delete,
                volume_type,
            }),
        }
    }

    fn bucket(&self) -> &CountedBucket {
        &self.inner.bucket
    }

    /// GET with trash-race recovery: if the data object is gone but its
    /// recency marker survives, a concurrent Trash may have won a race it
    /// should have lost; restore and retry once.
    async fn get_stream_with_recovery(&self, loc: &BlockHash) -> Result<ByteStream> {
        let key = data_key(loc);
        match self.bucket().get_stream(&key).await {
            Ok(stream) => return Ok(stream),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        // No readable recent/X means there is nothing to recover from.
        self.bucket()
            .head(&recent_key(loc))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    Error::NotFound(key.clone())
                } else {
                    err
                }
            })?;
        if !self.fix_race(loc).await {
            return Err(Error::NotFound(key));
        }

        match self.bucket().get_stream(&key).await {
            Ok(stream) => Ok(stream),
            Err(err) => {
                warn!(volume = %self.device_id(), loc = %loc, %err,
                    "reading block after successful race recovery failed");
                Err(err)
            }
        }
    }

    /// `fix_race(X)` is called when `recent/X` exists but `X` does not. If
    /// the timestamps on `recent/X` and `trash/X` show the block was
    /// trashed while still within its signature TTL, a Put or Touch raced
    /// with Trash; restore the data object from the trash copy.
    async fn fix_race(&self, loc: &BlockHash) -> bool {
        let volume = self.device_id();
        let trash_info = match self.bucket().head(&trash_key(loc)).await {
            Ok(info) => info,
            Err(err) => {
                if !err.is_not_found() {
                    error!(%volume, loc = %loc, %err, "fix_race: HEAD trash marker");
                }
                return false;
            }
        };
        let recent_info = match self.bucket().head(&recent_key(loc)).await {
            Ok(info) => info,
            Err(err) => {
                error!(%volume, loc = %loc, %err, "fix_race: HEAD recent marker");
                return false;
            }
        };

        let age_when_trashed = trash_info.last_modified - recent_info.last_modified;
        if age_when_trashed >= self.inner.signature_ttl {
            // No race: the block was not touched after it became eligible
            // for trashing.
            return false;
        }

        info!(%volume, loc = %loc, %age_when_trashed,
            "trashed while still within signature TTL; restoring from trash copy");
        match self.safe_copy(&data_key(loc), &trash_key(loc)).await {
            Ok(()) => true,
            Err(err) => {
                error!(%volume, loc = %loc, %err, "fix_race: restore failed");
                false
            }
        }
    }

    /// Copy and verify that the destination really got a fresh timestamp.
    /// Some backends acknowledge a copy without performing it.
    async fn safe_copy(&self, dst: &str, src: &str) -> Result<()> {
        let t = self.bucket().copy(dst, src).await?;
        if now() - t > MAX_CLOCK_SKEW {
            return Err(Error::Other(format!(
                "copy of {src:?} succeeded but returned an old timestamp: {t}"
            )));
        }
        Ok(())
    }

    /// Refuse to trash when an existing `trash/X` is about to become
    /// deletable: overwriting it could not be relied on to reset the sweep
    /// clock before the sweep acts.
    async fn check_race_window(&self, loc: &BlockHash) -> Result<()> {
        let info = match self.bucket().head(&trash_key(loc)).await {
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
            Ok(info) => info,
        };
        let safe_window =
            (info.last_modified + self.inner.trash_lifetime) - (now() + self.inner.race_window);
        if safe_window <= time::Duration::ZERO {
            return Err(Error::Other(format!(
                "same block is already in trash, and its safe window ended {} ago",
                -safe_window
            )));
        }
        Ok(())
    }

    async fn write_recent_marker(&self, loc: &BlockHash) -> Result<()> {
        self.bucket().put(&recent_key(loc), None, None).await
    }

    async fn empty_one_key(
        &self,
        counters: &SweepCounters,
        start: OffsetDateTime,
        trash_item: crate::bucket::KeyInfo,
    ) {
        let volume = self.device_id();
        let Some(loc_str) = trash_item.key.strip_prefix("trash/") else {
            return;
        };
        if !is_block_key(loc_str) {
            return;
        }
        let loc: BlockHash = match loc_str.parse() {
            Ok(loc) => loc,
            Err(_) => return,
        };
        counters.bytes_in_trash.fetch_add(trash_item.size, Ordering::Relaxed);
        counters.blocks_in_trash.fetch_add(1, Ordering::Relaxed);

        let trash_t = trash_item.last_modified;
        let recent_info = match self.bucket().head(&recent_key(&loc)).await {
            Err(err) if err.is_not_found() => {
                // Orphan trash marker from an interrupted operation; put the
                // block back where a future Trash can see it whole.
                warn!(%volume, loc = %loc, "trash marker without recent marker; untrashing");
                if let Err(err) = self.untrash(&loc).await {
                    error!(%volume, loc = %loc, %err, "sweep: untrash failed");
                }
                return;
            }
            Err(err) => {
                warn!(%volume, loc = %loc, %err, "sweep: HEAD recent marker");
                return;
            }
            Ok(info) => info,
        };
        let recent_t = recent_info.last_modified;

        if trash_t - recent_t < self.inner.signature_ttl {
            if start - recent_t >= self.inner.signature_ttl - self.inner.race_window {
                // recent/X is too stale to protect X from being trashed
                // again during the race window that starts if trash/X is
                // deleted now. The sweep interval must stay below
                // signature_ttl - race_window or this path starves.
                info!(%volume, loc = %loc, "sweep: old trash race; refreshing block");
                self.fix_race(&loc).await;
                if let Err(err) = self.touch(&loc).await {
                    error!(%volume, loc = %loc, %err, "sweep: touch after race refresh");
                }
                return;
            }
            match self.bucket().head(&data_key(&loc)).await {
                Err(err) if err.is_not_found() => {
                    info!(%volume, loc = %loc, "sweep: recent trash race; restoring block");
                    self.fix_race(&loc).await;
                    return;
                }
                Err(err) => {
                    warn!(%volume, loc = %loc, %err, "sweep: HEAD block");
                    return;
                }
                Ok(_) => {}
            }
        }

        if start - trash_t < self.inner.trash_lifetime {
            return;
        }

        if let Err(err) = self.bucket().delete(&trash_item.key).await {
            warn!(%volume, key = %trash_item.key, %err, "sweep: delete trash copy");
            return;
        }
        counters.bytes_deleted.fetch_add(trash_item.size, Ordering::Relaxed);
        counters.blocks_deleted.fetch_add(1, Ordering::Relaxed);

        match self.bucket().head(&data_key(&loc)).await {
            Ok(_) => {
                warn!(%volume, loc = %loc,
                    "sweep: block reappeared immediately after deleting its trash copy");
                return;
            }
            Err(err) if !err.is_not_found() => {
                warn!(%volume, loc = %loc, %err, "sweep: HEAD block after delete");
                return;
            }
            Err(_) => {}
        }
        if let Err(err) = self.bucket().delete(&recent_key(&loc)).await {
            warn!(%volume, loc = %loc, %err, "sweep: delete recent marker");
        }
    }
}

#[async_trait]
impl Volume for CloudVolume {
    async fn get(&self, ctx: &CancellationToken, loc: &BlockHash) -> Result<Bytes> {
        let mut stream = self.get_stream(ctx, loc).await?;
        gated(ctx, async {
            let mut buf = BytesMut::new();
            while let Some(item) = stream.next().await {
                let chunk = item?;
                if buf.len() as u64 + chunk.len() as u64 > BLOCK_SIZE {
                    return Err(Error::Other(format!(
                        "block {loc} exceeds maximum size of {BLOCK_SIZE} bytes"
                    )));
                }
                buf.extend_from_slice(&chunk);
            }
            Ok(buf.freeze())
        })
        .await
    }

    async fn get_stream(&self, ctx: &CancellationToken, loc: &BlockHash) -> Result<ByteStream> {
        gated(ctx, self.get_stream_with_recovery(loc)).await
    }

    async fn compare(&self, ctx: &CancellationToken, loc: &BlockHash, expect: &[u8]) -> Result<()> {
        gated(ctx, async {
            // HEAD the recency marker, never the block itself: on some
            // backends a HEAD of a not-yet-visible key seeds a negative
            // cache, making a block we are about to write unreadable for
            // other clients until the cache expires. recent/X is only ever
            // probed once X has been seen live.
            self.bucket().head(&recent_key(loc)).await?;

            let mut stream = self.get_stream_with_recovery(loc).await?;
            let mut hasher = BlockHash::hasher();
            let mut offset = 0usize;
            let mut differs = false;
            while let Some(item) = stream.next().await {
                let chunk = item?;
                hasher.update(&chunk);
                let end = offset + chunk.len();
                if !differs && (end > expect.len() || chunk[..] != expect[offset..end]) {
                    differs = true;
                }
                offset = end;
            }
            if differs || offset != expect.len() {
                return Err(Error::Checksum {
                    expected: loc.to_hex(),
                    actual: hasher.finalize().to_hex(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn put(&self, ctx: &CancellationToken, loc: &BlockHash, block: Bytes) -> Result<()> {
        if self.inner.read_only {
            return Err(Error::MethodDisabled);
        }
        // The backend rejects any body whose MD5 differs from the locator.
        // Zero-length blocks go as an absent body so the request carries an
        // explicit Content-Length: 0.
        let content_md5 = (!block.is_empty()).then(|| loc.content_md5());
        let body = (!block.is_empty()).then_some(block);
        let key = data_key(loc);
        gated(ctx, async {
            self.bucket().put(&key, body, content_md5).await?;
            self.write_recent_marker(loc).await
        })
        .await
    }

    async fn touch(&self, loc: &BlockHash) -> Result<()> {
        if self.inner.read_only {
            return Err(Error::MethodDisabled);
        }
        if let Err(err) = self.bucket().head(&data_key(loc)).await {
            // A missing data object may be a trash race that fix_race can
            // rescue; anything else is fatal.
            if !(err.is_not_found() && self.fix_race(loc).await) {
                return Err(err);
            }
        }
        self.write_recent_marker(loc).await
    }

    async fn mtime(&self, loc: &BlockHash) -> Result<OffsetDateTime> {
        self.bucket().head(&data_key(loc)).await?;
        match self.bucket().head(&recent_key(loc)).await {
            Ok(info) => Ok(info.last_modified),
            Err(err) if err.is_not_found() => {
                // The block predates the recency-marker scheme; adopt it.
                self.write_recent_marker(loc).await?;
                info!(volume = %self.device_id(), loc = %loc,
                    "created recent marker for block written under old scheme");
                Ok(self.bucket().head(&recent_key(loc)).await?.last_modified)
            }
            Err(err) => Err(err),
        }
    }

    async fn index_to(
        &self,
        prefix: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        // Merge two cursors over X and recent/X so each line can report the
        // marker's timestamp when one exists.
        let mut data = KeyLister::new(
            self.bucket().clone(),
            prefix.to_string(),
            self.inner.index_page_size,
        );
        let mut recent = KeyLister::new(
            self.bucket().clone(),
            format!("recent/{prefix}"),
            self.inner.index_page_size,
        );

        let mut data_item = data.first().await;
        let mut recent_item = recent.first().await;
        while let Some(item) = data_item {
            if item.key.as_str() >= "g" {
                // recent/* and trash/* sort above every hex key; nothing
                // after this point is a data block.
                break;
            }
            if !is_block_key(&item.key) {
                data_item = data.next().await;
                continue;
            }

            let mut stamp = item.last_modified;
            while let Some(marker) = &recent_item {
                match marker.key[7..].cmp(item.key.as_str()) {
                    std::cmp::Ordering::Less => {
                        recent_item = recent.next().await;
                    }
                    std::cmp::Ordering::Equal => {
                        stamp = marker.last_modified;
                        recent_item = recent.next().await;
                        break;
                    }
                    // Marker missing; report the data object's own
                    // timestamp.
                    std::cmp::Ordering::Greater => break,
                }
            }

            let line = format!("{}+{} {}\n", item.key, item.size, stamp.unix_timestamp_nanos());
            writer.write_all(line.as_bytes()).await?;
            data_item = data.next().await;
        }

        if let Some(err) = data.take_error() {
            return Err(err);
        }
        if let Some(err) = recent.take_error() {
            return Err(err);
        }
        Ok(())
    }

    async fn trash(&self, loc: &BlockHash) -> Result<()> {
        if self.inner.read_only {
            return Err(Error::MethodDisabled);
        }
        let t = self.mtime(loc).await?;
        if now() - t < self.inner.signature_ttl {
            debug!(volume = %self.device_id(), loc = %loc,
                "still within signature TTL; not trashing");
            return Ok(());
        }
        if self.inner.trash_lifetime.is_zero() {
            if !self.inner.unsafe_delete {
                return Err(Error::TrashDisabled);
            }
            return self.bucket().delete(&data_key(loc)).await;
        }
        self.check_race_window(loc).await?;
        self.safe_copy(&trash_key(loc), &data_key(loc)).await?;
        self.bucket().delete(&data_key(loc)).await
    }

    async fn untrash(&self, loc: &BlockHash) -> Result<()> {
        self.safe_copy(&data_key(loc), &trash_key(loc)).await?;
        self.write_recent_marker(loc).await
    }

    async fn empty_trash(&self) -> EmptyTrashStats {
        // "Ready to delete" means ready when the sweep started.
        let start = now();
        let volume = self.device_id();
        let counters = Arc::new(SweepCounters::default());

        let workers = self.inner.empty_trash_workers.max(1);
        let (tx, rx) = mpsc::channel::<crate::bucket::KeyInfo>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let vol = self.clone();
            let rx = rx.clone();
            let counters = counters.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = rx.lock().await.recv().await;
                    let Some(item) = item else { break };
                    vol.empty_one_key(&counters, start, item).await;
                }
            }));
        }

        let mut lister = KeyLister::new(
            self.bucket().clone(),
            "trash/".to_string(),
            self.inner.index_page_size,
        );
        let mut item = lister.first().await;
        while let Some(key) = item {
            if tx.send(key).await.is_err() {
                break;
            }
            item = lister.next().await;
        }
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(err) = lister.take_error() {
            error!(%volume, %err, "sweep: trash listing failed");
        }

        let stats = counters.snapshot();
        info!(
            %volume,
            bytes_deleted = stats.bytes_deleted,
            blocks_deleted = stats.blocks_deleted,
            bytes_remaining = stats.bytes_in_trash - stats.bytes_deleted,
            blocks_remaining = stats.blocks_in_trash - stats.blocks_deleted,
            "trash sweep finished"
        );
        stats
    }

    fn status(&self) -> VolumeStatus {
        // Cloud buckets have no meaningful capacity; report a fake free
        // space that never looks nearly-full.
        VolumeStatus {
            device_num: 1,
            bytes_free: BLOCK_SIZE * 1000,
            bytes_used: 1,
        }
    }

    fn device_id(&self) -> String {
        self.bucket().id()
    }

    fn writable(&self) -> bool {
        !self.inner.read_only
    }

    fn replication(&self) -> usize {
        self.inner.replication
    }

    fn storage_classes(&self) -> &[String] {
        &self.inner.storage_classes
    }

    fn internal_stats(&self) -> StatsSnapshot {
        self.bucket().stats().snapshot()
    }

    fn volume_type(&self) -> &'static str {
        self.inner.volume_type
    }
}

#[derive(Default)]
struct SweepCounters {
    bytes_in_trash: AtomicU64,
    blocks_in_trash: AtomicU64,
    bytes_deleted: AtomicU64,
    blocks_deleted: AtomicU64,
}

impl SweepCounters {
    fn snapshot(&self) -> EmptyTrashStats {
        EmptyTrashStats {
            bytes_in_trash: self.bytes_in_trash.load(Ordering::Relaxed),
            blocks_in_trash: self.blocks_in_trash.load(Ordering::Relaxed),
            bytes_deleted: self.bytes_deleted.load(Ordering::Relaxed),
            blocks_deleted: self.blocks_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of one trash sweep.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EmptyTrashStats {
    pub bytes_in_trash: u64,
    pub blocks_in_trash: u64,
    pub bytes_deleted: u64,
    pub blocks_deleted: u64,
}
