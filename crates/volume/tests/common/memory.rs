//! In-memory bucket with adjustable timestamps, standing in for a cloud
//! backend in state-machine tests.
//!
//! The same double implements both bucket seams: the crate's [`BlobBucket`]
//! for volume state-machine tests, and `object_store::ObjectStore` so the
//! Azure adapter can be driven against it. An entry with an empty etag is
//! an uncommitted placeholder: it surfaces as `e_tag: None` on the
//! provider seam, which is what a concurrent Put looks like before its
//! block list commits.

use async_trait::async_trait;
use bytes::Bytes;
use cairn_volume::io::ByteStream;
use cairn_volume::{BlobBucket, Error, KeyInfo, ListPage, ObjectInfo, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::path::Path as ObjectPath;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

#[derive(Clone)]
struct MemObject {
    data: Bytes,
    last_modified: OffsetDateTime,
    /// Empty while the object is an uncommitted placeholder.
    etag: String,
}

impl std::fmt::Debug for MemObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemObject")
            .field("len", &self.data.len())
            .field("etag", &self.etag)
            .finish()
    }
}

/// Keys are held in a BTreeMap so listings come back in lexical order, the
/// way cloud buckets return them.
#[derive(Debug)]
pub struct MemoryBucket {
    device: String,
    objects: Mutex<BTreeMap<String, MemObject>>,
    etag_seq: AtomicU64,
    /// Commit countdowns for uncommitted entries: the entry gets a real
    /// etag after this many provider-side HEAD probes.
    pending_commits: Mutex<HashMap<String, usize>>,
}

impl MemoryBucket {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            etag_seq: AtomicU64::new(1),
            pending_commits: Mutex::new(HashMap::new()),
        }
    }

    fn next_etag(&self) -> String {
        format!("\"etag-{}\"", self.etag_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert an object directly, bypassing the volume layer.
    pub fn insert(&self, key: &str, data: &[u8]) {
        let etag = self.next_etag();
        self.insert_with_etag(key, data, etag);
    }

    /// Insert an uncommitted placeholder: visible to HEAD and listings but
    /// carrying no etag, like a concurrent Put that has not committed its
    /// block list yet. Pair with [`MemoryBucket::commit_after`] to let the
    /// write finish, or leave as-is to simulate a crashed writer.
    pub fn insert_uncommitted(&self, key: &str, data: &[u8]) {
        self.insert_with_etag(key, data, String::new());
    }

    /// Give `key` a real etag after `probes` provider-side HEAD probes.
    pub fn commit_after(&self, key: &str, probes: usize) {
        assert!(probes > 0, "commit_after needs at least one probe");
        self.pending_commits
            .lock()
            .unwrap()
            .insert(key.to_string(), probes);
    }

    fn insert_with_etag(&self, key: &str, data: &[u8], etag: String) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MemObject {
                data: Bytes::copy_from_slice(data),
                last_modified: OffsetDateTime::now_utc(),
                etag,
            },
        );
    }

    /// Advance a pending commit by one HEAD probe.
    fn tick_commit(&self, key: &str) {
        let mut pending = self.pending_commits.lock().unwrap();
        let Some(remaining) = pending.get_mut(key) else {
            return;
        };
        *remaining -= 1;
        if *remaining == 0 {
            pending.remove(key);
            let etag = self.next_etag();
            if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
                object.etag = etag;
            }
        }
    }

    /// Shift an object's Last-Modified into the past.
    pub fn backdate(&self, key: &str, by: time::Duration) {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects
            .get_mut(key)
            .unwrap_or_else(|| panic!("backdate: no such key {key:?}"));
        entry.last_modified -= by;
    }

    pub fn exists(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn data(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|o| o.data.clone())
    }

    pub fn last_modified(&self, key: &str) -> Option<OffsetDateTime> {
        self.objects.lock().unwrap().get(key).map(|o| o.last_modified)
    }
}

#[async_trait]
impl BlobBucket for MemoryBucket {
    async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        let object = {
            let objects = self.objects.lock().unwrap();
            objects
                .get(key)
                .cloned()
                .ok_or_else(|| Error::NotFound(key.to_string()))?
        };
        // Split the body so consumers see more than one chunk.
        let mid = object.data.len() / 2;
        let chunks: Vec<Result<Bytes>> = if object.data.is_empty() {
            Vec::new()
        } else {
            vec![
                Ok(object.data.slice(..mid)),
                Ok(object.data.slice(mid..)),
            ]
        };
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(ObjectInfo {
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            etag: Some(object.etag.clone()),
        })
    }

    async fn put(&self, key: &str, body: Option<Bytes>, content_md5: Option<String>) -> Result<()> {
        let data = body.unwrap_or_default();
        if let Some(expected) = content_md5 {
            let actual = cairn_core::locator::BlockHash::compute(&data).content_md5();
            if actual != expected {
                return Err(Error::backend(
                    Some(400),
                    Some("BadDigest".to_string()),
                    format!("content-md5 mismatch on {key:?}"),
                ));
            }
        }
        let etag = self.next_etag();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MemObject {
                data,
                last_modified: OffsetDateTime::now_utc(),
                etag,
            },
        );
        Ok(())
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<OffsetDateTime> {
        let mut objects = self.objects.lock().unwrap();
        let source = objects
            .get(src)
            .cloned()
            .ok_or_else(|| Error::NotFound(src.to_string()))?;
        let now = OffsetDateTime::now_utc();
        let etag = self.next_etag();
        objects.insert(
            dst.to_string(),
            MemObject {
                data: source.data,
                last_modified: now,
                etag,
            },
        );
        Ok(now)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        let objects = self.objects.lock().unwrap();
        let mut items = Vec::new();
        let mut more = false;
        for (key, object) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(marker) = marker {
                if key.as_str() <= marker {
                    continue;
                }
            }
            if items.len() == page_size {
                more = true;
                break;
            }
            items.push(KeyInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            });
        }
        let next_marker = if more {
            items.last().map(|item: &KeyInfo| item.key.clone())
        } else {
            None
        };
        Ok(ListPage { items, next_marker })
    }

    fn id(&self) -> String {
        self.device.clone()
    }
}

fn store_meta(key: &str, object: &MemObject) -> object_store::ObjectMeta {
    object_store::ObjectMeta {
        location: ObjectPath::from(key),
        last_modified: chrono::DateTime::from_timestamp(
            object.last_modified.unix_timestamp(),
            object.last_modified.nanosecond(),
        )
        .expect("timestamp in range"),
        size: object.data.len(),
        e_tag: if object.etag.is_empty() {
            None
        } else {
            Some(object.etag.clone())
        },
        version: None,
    }
}

fn store_not_found(key: &str) -> object_store::Error {
    object_store::Error::NotFound {
        path: key.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such key",
        )),
    }
}

impl std::fmt::Display for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryBucket({})", self.device)
    }
}

/// Provider-level seam: uncommitted entries come back with `e_tag: None`,
/// and every HEAD probe advances any pending commit countdown.
#[async_trait]
impl object_store::ObjectStore for MemoryBucket {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: object_store::PutPayload,
        _opts: object_store::PutOptions,
    ) -> object_store::Result<object_store::PutResult> {
        let etag = self.next_etag();
        self.objects.lock().unwrap().insert(
            location.as_ref().to_string(),
            MemObject {
                data: Bytes::from(payload),
                last_modified: OffsetDateTime::now_utc(),
                etag: etag.clone(),
            },
        );
        Ok(object_store::PutResult {
            e_tag: Some(etag),
            version: None,
        })
    }

    async fn put_multipart_opts(
        &self,
        _location: &ObjectPath,
        _opts: object_store::PutMultipartOpts,
    ) -> object_store::Result<Box<dyn object_store::MultipartUpload>> {
        Err(object_store::Error::NotImplemented)
    }

    async fn get_opts(
        &self,
        location: &ObjectPath,
        options: object_store::GetOptions,
    ) -> object_store::Result<object_store::GetResult> {
        let key = location.as_ref();
        if options.head {
            self.tick_commit(key);
        }
        let object = {
            let objects = self.objects.lock().unwrap();
            objects.get(key).cloned().ok_or_else(|| store_not_found(key))?
        };
        let meta = store_meta(key, &object);
        if options.head {
            return Ok(object_store::GetResult {
                payload: object_store::GetResultPayload::Stream(futures::stream::empty().boxed()),
                meta,
                range: 0..0,
                attributes: Default::default(),
            });
        }
        let range = match options.range {
            Some(object_store::GetRange::Bounded(range)) => range,
            Some(object_store::GetRange::Offset(start)) => start..object.data.len(),
            Some(object_store::GetRange::Suffix(n)) => {
                object.data.len().saturating_sub(n)..object.data.len()
            }
            None => 0..object.data.len(),
        };
        let body = object.data.slice(range.clone());
        Ok(object_store::GetResult {
            payload: object_store::GetResultPayload::Stream(
                futures::stream::once(async move { Ok(body) }).boxed(),
            ),
            meta,
            range,
            attributes: Default::default(),
        })
    }

    async fn head(&self, location: &ObjectPath) -> object_store::Result<object_store::ObjectMeta> {
        let key = location.as_ref();
        self.tick_commit(key);
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or_else(|| store_not_found(key))?;
        Ok(store_meta(key, object))
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        let key = location.as_ref();
        self.pending_commits.lock().unwrap().remove(key);
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> BoxStream<'_, object_store::Result<object_store::ObjectMeta>> {
        let prefix = prefix.map(|p| p.as_ref().to_string()).unwrap_or_default();
        let metas: Vec<_> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, object)| Ok(store_meta(key, object)))
            .collect();
        futures::stream::iter(metas).boxed()
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> object_store::Result<object_store::ListResult> {
        let prefix = prefix.map(|p| p.as_ref().to_string()).unwrap_or_default();
        let objects = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, object)| store_meta(key, object))
            .collect();
        Ok(object_store::ListResult {
            common_prefixes: Vec::new(),
            objects,
        })
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let source = objects
            .get(from.as_ref())
            .cloned()
            .ok_or_else(|| store_not_found(from.as_ref()))?;
        let etag = self.next_etag();
        objects.insert(
            to.as_ref().to_string(),
            MemObject {
                data: source.data,
                last_modified: OffsetDateTime::now_utc(),
                etag,
            },
        );
        Ok(())
    }

    async fn copy_if_not_exists(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> object_store::Result<()> {
        if self.objects.lock().unwrap().contains_key(to.as_ref()) {
            return Err(object_store::Error::AlreadyExists {
                path: to.as_ref().to_string(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "destination exists",
                )),
            });
        }
        object_store::ObjectStore::copy(self, from, to).await
    }
}
