//! Lazy paginated key enumeration over a bucket prefix.

use crate::bucket::{CountedBucket, KeyInfo};
use crate::error::Error;
use std::collections::VecDeque;
use tracing::warn;

/// Walks every key under a prefix in stable key order, fetching one page at
/// a time. A page is fetched only when the buffered one is drained and the
/// backend reported more results.
pub struct KeyLister {
    bucket: CountedBucket,
    prefix: String,
    page_size: usize,
    buf: VecDeque<KeyInfo>,
    next_marker: Option<String>,
    err: Option<Error>,
}

impl KeyLister {
    pub fn new(bucket: CountedBucket, prefix: impl Into<String>, page_size: usize) -> Self {
        Self {
            bucket,
            prefix: prefix.into(),
            page_size,
            buf: VecDeque::new(),
            next_marker: None,
            err: None,
        }
    }

    /// Fetch the first page and return its first item. Returns `None` for
    /// an empty result set or an error (see [`KeyLister::error`]).
    pub async fn first(&mut self) -> Option<KeyInfo> {
        self.get_page(None).await;
        self.buf.pop_front()
    }

    /// Return the next item, fetching the next page if necessary.
    pub async fn next(&mut self) -> Option<KeyInfo> {
        if self.buf.is_empty() && self.err.is_none() {
            if let Some(marker) = self.next_marker.take() {
                self.get_page(Some(marker)).await;
            }
        }
        self.buf.pop_front()
    }

    /// The most recent error encountered by `first` or `next`.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Take ownership of the stored error, if any.
    pub fn take_error(&mut self) -> Option<Error> {
        self.err.take()
    }

    async fn get_page(&mut self, marker: Option<String>) {
        let page = match self
            .bucket
            .list_page(&self.prefix, marker.as_deref(), self.page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                self.err = Some(err);
                return;
            }
        };
        self.next_marker = page.next_marker;
        self.buf = page
            .items
            .into_iter()
            .filter(|item| {
                // Some backends return keys outside the requested prefix.
                let ok = item.key.starts_with(&self.prefix);
                if !ok {
                    warn!(
                        prefix = %self.prefix,
                        key = %item.key,
                        "listing returned key outside requested prefix"
                    );
                }
                ok
            })
            .collect();
    }
}
