//! Azure blob container adapter over `object_store`.

use crate::bucket::{BlobBucket, KeyInfo, ListPage, ObjectInfo};
use crate::error::{Error, Result};
use crate::io::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;
use cairn_core::locator::BlockHash;
use futures::StreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

/// How long a visible-but-uncommitted blob is given to finish committing
/// before it is considered abandoned by a crashed writer.
pub const AZURE_WRITE_RACE_INTERVAL: Duration = Duration::from_secs(15);

/// Poll spacing while waiting out an uncommitted blob.
pub const AZURE_WRITE_RACE_POLL: Duration = Duration::from_millis(100);

/// Reads above this size are issued as sequential range requests.
pub const AZURE_MAX_GET_BYTES: u64 = 16 * 1024 * 1024;

/// An Azure blob container.
///
/// Holds the provider store behind `Arc<dyn ObjectStore>` so tests can
/// substitute an in-memory store.
pub struct AzureBucket {
    store: Arc<dyn ObjectStore>,
    device: String,
    write_race_interval: Duration,
    write_race_poll: Duration,
    max_get_bytes: u64,
}

impl std::fmt::Debug for AzureBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBucket")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl AzureBucket {
    pub fn new(
        container: &str,
        account: &str,
        endpoint: Option<String>,
        access_key: Option<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(account)
            .with_container_name(container)
            .with_client_options(
                ClientOptions::new()
                    .with_connect_timeout(connect_timeout)
                    .with_timeout(read_timeout),
            );
        if let Some(key) = access_key {
            builder = builder.with_access_key(key);
        }
        if let Some(endpoint) = &endpoint {
            builder = builder.with_endpoint(endpoint.clone());
            if endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }
        let store = builder.build().map_err(|err| {
            Error::Other(format!("cannot configure azure container: {err}"))
        })?;

        let host = endpoint.unwrap_or_else(|| format!("{account}.blob.core.windows.net"));
        Ok(Self::from_store(
            Arc::new(store),
            format!("azure://{host}/{container}"),
        ))
    }

    /// Wrap an already-built store. Tests use this with an in-memory store.
    pub fn from_store(store: Arc<dyn ObjectStore>, device: String) -> Self {
        Self {
            store,
            device,
            write_race_interval: AZURE_WRITE_RACE_INTERVAL,
            write_race_poll: AZURE_WRITE_RACE_POLL,
            max_get_bytes: AZURE_MAX_GET_BYTES,
        }
    }

    /// Override how long an uncommitted blob is waited out and how often
    /// it is re-probed. The defaults suit production write latencies;
    /// emulators and tests want much shorter windows.
    pub fn with_race_timing(mut self, interval: Duration, poll: Duration) -> Self {
        self.write_race_interval = interval;
        self.write_race_poll = poll;
        self
    }

    /// Override the range-request chunking threshold.
    pub fn with_max_get_bytes(mut self, max: u64) -> Self {
        self.max_get_bytes = max;
        self
    }

    fn chunked_stream(&self, key: &str, size: u64) -> ByteStream {
        let store = self.store.clone();
        let path = ObjectPath::from(key);
        let chunk = self.max_get_bytes;
        let stream = async_stream::try_stream! {
            let mut offset = 0u64;
            while offset < size {
                let end = (offset + chunk).min(size);
                let body = store
                    .get_range(&path, (offset as usize)..(end as usize))
                    .await
                    .map_err(|e| map_store_error(e, path.as_ref()))?;
                offset = end;
                yield body;
            }
        };
        Box::pin(stream)
    }

    /// Wait out a Put that is visible but not yet committed.
    ///
    /// A concurrent writer creates the blob placeholder before committing
    /// its block list; the placeholder has no ETag. Poll until a real ETag
    /// appears or the write window lapses, at which point the writer is
    /// taken for dead and its placeholder removed.
    async fn wait_for_commit(&self, key: &str) -> Result<ObjectInfo> {
        let path = ObjectPath::from(key);
        let deadline = tokio::time::Instant::now() + self.write_race_interval;
        loop {
            let info = self.head(key).await?;
            match &info.etag {
                Some(etag) if !etag.is_empty() => return Ok(info),
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                info!(key, "uncommitted blob expired; treating as missing");
                if let Err(err) = self.store.delete(&path).await {
                    warn!(key, %err, "cannot remove abandoned uncommitted blob");
                }
                return Err(Error::NotFound(key.to_string()));
            }
            tokio::time::sleep(self.write_race_poll).await;
        }
    }
}

fn map_store_error(err: object_store::Error, key: &str) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::NotFound(key.to_string()),
        other => {
            let message = other.to_string();
            // The provider client folds its error body into the message;
            // BlobNotFound is the container's spelling of 404.
            if message.contains("BlobNotFound") {
                return Error::NotFound(key.to_string());
            }
            if message.contains("timed out") {
                return Error::Timeout(message);
            }
            Error::Backend {
                status: None,
                code: None,
                message,
            }
        }
    }
}

fn to_offset(dt: &chrono::DateTime<chrono::Utc>, key: &str) -> Result<OffsetDateTime> {
    let base = OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|err| Error::Other(format!("invalid timestamp on {key:?}: {err}")))?;
    Ok(base + time::Duration::nanoseconds(i64::from(dt.timestamp_subsec_nanos())))
}

fn to_object_info(meta: &object_store::ObjectMeta) -> Result<ObjectInfo> {
    Ok(ObjectInfo {
        size: meta.size as u64,
        last_modified: to_offset(&meta.last_modified, meta.location.as_ref())?,
        etag: meta.e_tag.clone(),
    })
}

#[async_trait]
impl BlobBucket for AzureBucket {
    #[instrument(skip(self), fields(device = %self.device))]
    async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        let path = ObjectPath::from(key);
        let info = match self.head(key).await {
            Ok(info) if info.etag.as_deref().unwrap_or("").is_empty() => {
                self.wait_for_commit(key).await?
            }
            Ok(info) => info,
            Err(err) => return Err(err),
        };

        if info.size > self.max_get_bytes {
            return Ok(self.chunked_stream(key, info.size));
        }

        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| map_store_error(e, key))?;
        let stream = result
            .into_stream()
            .map(move |item| item.map_err(|e| map_store_error(e, "")));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let path = ObjectPath::from(key);
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| map_store_error(e, key))?;
        to_object_info(&meta)
    }

    #[instrument(skip(self, body), fields(device = %self.device))]
    async fn put(&self, key: &str, body: Option<Bytes>, content_md5: Option<String>) -> Result<()> {
        let bytes = body.unwrap_or_default();
        // The provider client does not forward a Content-MD5 header, so the
        // digest contract is enforced here before the body leaves the
        // process.
        if let Some(expected) = content_md5 {
            let actual = BlockHash::compute(&bytes).content_md5();
            if actual != expected {
                return Err(Error::Checksum {
                    expected,
                    actual,
                });
            }
        }
        let path = ObjectPath::from(key);
        self.store
            .put(&path, bytes.into())
            .await
            .map_err(|e| map_store_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn copy(&self, dst: &str, src: &str) -> Result<OffsetDateTime> {
        let from = ObjectPath::from(src);
        let to = ObjectPath::from(dst);
        self.store
            .copy(&from, &to)
            .await
            .map_err(|e| map_store_error(e, src))?;
        // The copy response carries no timestamp; read it back off the
        // destination.
        Ok(self.head(dst).await?.last_modified)
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = ObjectPath::from(key);
        self.store
            .delete(&path)
            .await
            .map_err(|e| map_store_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        let prefix_path = ObjectPath::from(prefix.trim_end_matches('/'));
        let mut listing = match marker {
            Some(marker) => self
                .store
                .list_with_offset(Some(&prefix_path), &ObjectPath::from(marker)),
            None => self.store.list(Some(&prefix_path)),
        };

        let mut items = Vec::new();
        while items.len() < page_size {
            match listing.next().await {
                Some(Ok(meta)) => {
                    let info = to_object_info(&meta)?;
                    items.push(KeyInfo {
                        key: meta.location.as_ref().to_string(),
                        size: info.size,
                        last_modified: info.last_modified,
                    });
                }
                Some(Err(err)) => return Err(map_store_error(err, prefix)),
                None => {
                    return Ok(ListPage {
                        items,
                        next_marker: None,
                    });
                }
            }
        }

        let next_marker = items.last().map(|item| item.key.clone());
        Ok(ListPage { items, next_marker })
    }

    fn id(&self) -> String {
        self.device.clone()
    }
}
