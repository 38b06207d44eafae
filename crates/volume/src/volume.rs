//! The capability interface implemented by every volume backend.

use crate::cloud::EmptyTrashStats;
use crate::error::Result;
use crate::io::ByteStream;
use crate::stats::StatsSnapshot;
use async_trait::async_trait;
use bytes::Bytes;
use cairn_core::locator::BlockHash;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// In-use and available capacity, as reported to the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct VolumeStatus {
    pub device_num: u64,
    pub bytes_free: u64,
    pub bytes_used: u64,
}

/// One stored-block volume.
///
/// Operations take the bare block hash; locator size/hint suffixes are the
/// caller's concern. Implementations are safe for concurrent use; per-key
/// operations are not serialized by the volume itself (safety comes from
/// the `recent/`/`trash/` marker invariants plus race recovery).
#[async_trait]
pub trait Volume: Send + Sync + 'static {
    /// Read back a whole block.
    async fn get(&self, ctx: &CancellationToken, loc: &BlockHash) -> Result<Bytes>;

    /// Stream a block, recovering from trash races on the way.
    async fn get_stream(&self, ctx: &CancellationToken, loc: &BlockHash) -> Result<ByteStream>;

    /// Compare the stored block with `expect` without trusting any cache of
    /// the block's own key.
    async fn compare(&self, ctx: &CancellationToken, loc: &BlockHash, expect: &[u8]) -> Result<()>;

    /// Write a block and its recency marker.
    async fn put(&self, ctx: &CancellationToken, loc: &BlockHash, block: Bytes) -> Result<()>;

    /// Bump the block's effective mtime to now.
    async fn touch(&self, loc: &BlockHash) -> Result<()>;

    /// The block's effective mtime (the recency marker's timestamp).
    async fn mtime(&self, loc: &BlockHash) -> Result<OffsetDateTime>;

    /// Write `<hash>+<size> <unix_nanos>\n` lines for every live block
    /// under `prefix`, in lexical key order.
    async fn index_to(
        &self,
        prefix: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;

    /// Move a block to the trash (or delete outright where configured).
    async fn trash(&self, loc: &BlockHash) -> Result<()>;

    /// Restore a trashed block with a fresh recency marker.
    async fn untrash(&self, loc: &BlockHash) -> Result<()>;

    /// Permanently delete trashed blocks past their lifetime.
    async fn empty_trash(&self) -> EmptyTrashStats;

    fn status(&self) -> VolumeStatus;

    /// Globally unique ID for the underlying storage device.
    fn device_id(&self) -> String;

    fn writable(&self) -> bool;

    /// Storage redundancy of the underlying device, as reported to clients.
    fn replication(&self) -> usize;

    fn storage_classes(&self) -> &[String];

    fn internal_stats(&self) -> StatsSnapshot;

    fn volume_type(&self) -> &'static str;
}
