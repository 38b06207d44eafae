//! The per-provider bucket contract and its counted wrapper.

use crate::error::{Error, Result};
use crate::io::{ByteStream, CountingStream};
use crate::stats::BucketStats;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Metadata for one stored object.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub size: u64,
    pub last_modified: OffsetDateTime,
    pub etag: Option<String>,
}

/// One entry of a prefix listing.
#[derive(Clone, Debug)]
pub struct KeyInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: OffsetDateTime,
}

/// One page of a marker-paginated listing.
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub items: Vec<KeyInfo>,
    /// Marker for the next page; `None` means this was the last page.
    pub next_marker: Option<String>,
}

/// Raw per-provider bucket calls.
///
/// Implementations normalize their provider's not-found variants to
/// [`Error::NotFound`]; the volume state machine relies on that to drive
/// race recovery. Other provider errors keep their status/code in
/// [`Error::Backend`].
#[async_trait]
pub trait BlobBucket: Send + Sync + 'static {
    /// Stream an object's body.
    async fn get_stream(&self, key: &str) -> Result<ByteStream>;

    async fn head(&self, key: &str) -> Result<ObjectInfo>;

    /// Write an object. `body: None` writes a zero-length object with an
    /// explicit `Content-Length: 0`. `content_md5` is the base64 digest the
    /// backend must enforce on the received body.
    async fn put(&self, key: &str, body: Option<Bytes>, content_md5: Option<String>) -> Result<()>;

    /// Server-side copy replacing the destination's metadata, so the
    /// destination gets a fresh Last-Modified. Returns that timestamp.
    async fn copy(&self, dst: &str, src: &str) -> Result<OffsetDateTime>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage>;

    /// Globally unique ID for the underlying storage device.
    fn id(&self) -> String;
}

/// Wraps a [`BlobBucket`], counting every call, byte, and error.
///
/// All volume code goes through this wrapper; the raw adapters are never
/// called directly.
#[derive(Clone)]
pub struct CountedBucket {
    inner: Arc<dyn BlobBucket>,
    stats: Arc<BucketStats>,
}

impl CountedBucket {
    pub fn new(inner: Arc<dyn BlobBucket>) -> Self {
        Self {
            inner,
            stats: Arc::new(BucketStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<BucketStats> {
        &self.stats
    }

    pub fn id(&self) -> String {
        self.inner.id()
    }

    fn note<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.stats.tick_err(err.stat_tag());
        }
        result
    }

    pub async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        self.stats.tick(&self.stats.get_ops);
        let stream = self.note(self.inner.get_stream(key).await)?;
        let stats = self.stats.clone();
        Ok(Box::pin(CountingStream::new(
            stream,
            Arc::new(move |n| stats.tick_in_bytes(n)),
        )))
    }

    pub async fn head(&self, key: &str) -> Result<ObjectInfo> {
        self.stats.tick(&self.stats.head_ops);
        self.note(self.inner.head(key).await)
    }

    pub async fn put(
        &self,
        key: &str,
        body: Option<Bytes>,
        content_md5: Option<String>,
    ) -> Result<()> {
        self.stats.tick(&self.stats.put_ops);
        let len = body.as_ref().map_or(0, |b| b.len() as u64);
        let result = self.note(self.inner.put(key, body, content_md5).await);
        if result.is_ok() {
            self.stats.tick_out_bytes(len);
        }
        result
    }

    pub async fn copy(&self, dst: &str, src: &str) -> Result<OffsetDateTime> {
        self.stats.tick(&self.stats.copy_ops);
        self.note(self.inner.copy(dst, src).await)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.stats.tick(&self.stats.del_ops);
        self.note(self.inner.delete(key).await)
    }

    pub async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        self.stats.tick(&self.stats.list_ops);
        self.note(self.inner.list_page(prefix, marker, page_size).await)
    }
}

/// Parse an HTTP `Last-Modified` style date.
///
/// RFC 1123 first; on failure, the relaxed variant some S3-compatible
/// services emit with a single-digit day of month.
pub fn parse_http_date(s: &str) -> Result<OffsetDateTime> {
    const RFC1123: &[time::format_description::FormatItem<'static>] = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    const NEARLY_RFC1123: &[time::format_description::FormatItem<'static>] = format_description!(
        "[weekday repr:short], [day padding:none] [month repr:short] [year] \
         [hour]:[minute]:[second] GMT"
    );

    PrimitiveDateTime::parse(s, RFC1123)
        .or_else(|_| PrimitiveDateTime::parse(s, NEARLY_RFC1123))
        .map(|t| t.assume_utc())
        .map_err(|err| Error::Other(format!("cannot parse timestamp {s:?}: {err}")))
}
