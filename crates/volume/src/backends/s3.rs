//! S3-compatible bucket adapter using the AWS SDK.

use crate::bucket::{BlobBucket, KeyInfo, ListPage, ObjectInfo};
use crate::error::{Error, Result};
use crate::io::ByteStream;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{MetadataDirective, ObjectCannedAcl};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

const CONTENT_TYPE: &str = "application/octet-stream";

/// Lazily initializes the AWS default credentials chain on first signed
/// request, so constructing a volume has no TLS/trust-root side effects.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn chain(
        &self,
    ) -> std::result::Result<
        &aws_config::default_provider::credentials::DefaultCredentialsChain,
        CredentialsError,
    > {
        self.chain
            .get_or_try_init(|| async {
                let region = aws_config::Region::new(self.region.clone());
                tokio::task::spawn(async move {
                    aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                        .region(region)
                        .build()
                        .await
                })
                .await
                .map_err(|join_err| {
                    CredentialsError::provider_error(format!(
                        "failed to initialize AWS default credential chain: {join_err}"
                    ))
                })
            })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

/// An S3-compatible bucket.
pub struct S3Bucket {
    client: Client,
    bucket: String,
    endpoint: String,
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl S3Bucket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(connect_timeout)
                    .read_timeout(read_timeout)
                    .build(),
            );

        match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials =
                    aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "cairn-config");
                builder = builder.credentials_provider(credentials);
            }
            (None, None) => {
                builder = builder.credentials_provider(LazyDefaultCredentialsProvider::new(
                    resolved_region.clone(),
                ));
            }
            _ => {
                return Err(Error::Other(
                    "s3 volume requires both access_key_id and secret_access_key \
                     when either is set"
                        .to_string(),
                ));
            }
        }

        // Bare host:port endpoints (e.g. "minio:9000") get an http:// scheme.
        let normalized_endpoint = endpoint.map(|url| {
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                url
            } else {
                format!("http://{url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            builder = builder.endpoint_url(endpoint_url);
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                // Plain-HTTP endpoints (local MinIO) must not require native
                // trust roots at client build time.
                builder = builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            builder = builder.force_path_style(true);
        }

        let stored_endpoint = normalized_endpoint
            .unwrap_or_else(|| format!("s3.{resolved_region}.amazonaws.com"));

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            endpoint: stored_endpoint,
        })
    }
}

fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if matches!(err, SdkError::TimeoutError(_)) {
        return Error::Timeout(format!("{}", DisplayErrorContext(&err)));
    }
    let status = match &err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    };
    let code = err.code().map(|c| c.to_string());
    let message = format!("{}", DisplayErrorContext(&err));

    // NoSuchKey and bare 404s (HEAD carries no error body) are canonical
    // not-found. NoSuchBucket and NoSuchVersion are different problems that
    // must stay visible downstream.
    if status == Some(404) {
        match code.as_deref() {
            Some("NoSuchBucket") | Some("NoSuchVersion") => {}
            _ => return Error::NotFound(key.to_string()),
        }
    }
    if code.as_deref() == Some("NoSuchKey") || message.contains("Not Found") {
        return Error::NotFound(key.to_string());
    }

    Error::Backend {
        status,
        code,
        message,
    }
}

fn to_offset(dt: &aws_sdk_s3::primitives::DateTime, key: &str) -> Result<OffsetDateTime> {
    let base = OffsetDateTime::from_unix_timestamp(dt.secs()).map_err(|err| {
        Error::Other(format!("invalid timestamp on {key:?}: {err}"))
    })?;
    Ok(base + time::Duration::nanoseconds(i64::from(dt.subsec_nanos())))
}

#[async_trait]
impl BlobBucket for S3Bucket {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get_stream(&self, key: &str) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let reader = output.body.into_async_read();
        let stream = ReaderStream::new(reader).map(|item| item.map_err(Error::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<ObjectInfo> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        let last_modified = output
            .last_modified()
            .ok_or_else(|| Error::Other(format!("no Last-Modified on {key:?}")))
            .and_then(|dt| to_offset(dt, key))?;

        Ok(ObjectInfo {
            size: output.content_length().unwrap_or(0) as u64,
            last_modified,
            etag: output.e_tag().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket))]
    async fn put(&self, key: &str, body: Option<Bytes>, content_md5: Option<String>) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE)
            .acl(ObjectCannedAcl::Private)
            .body(match body {
                Some(bytes) => bytes.into(),
                // An explicit empty body yields Content-Length: 0; omitting
                // the header makes some services refuse to create the object.
                None => aws_sdk_s3::primitives::ByteStream::from_static(b""),
            });
        if let Some(md5) = content_md5 {
            request = request.content_md5(md5);
        }
        request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn copy(&self, dst: &str, src: &str) -> Result<OffsetDateTime> {
        let encoded_key = utf8_percent_encode(src, NON_ALPHANUMERIC).to_string();
        let output = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(dst)
            .copy_source(format!("{}/{}", self.bucket, encoded_key))
            .metadata_directive(MetadataDirective::Replace)
            .content_type(CONTENT_TYPE)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, src))?;

        output
            .copy_object_result()
            .and_then(|r| r.last_modified())
            .ok_or_else(|| {
                Error::Other(format!(
                    "copy {src:?} -> {dst:?} succeeded but did not return a timestamp"
                ))
            })
            .and_then(|dt| to_offset(dt, dst))
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(
        &self,
        prefix: &str,
        marker: Option<&str>,
        page_size: usize,
    ) -> Result<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(page_size as i32);
        if let Some(marker) = marker {
            request = request.continuation_token(marker);
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_sdk_error(e, prefix))?;

        let mut items = Vec::with_capacity(output.contents().len());
        for obj in output.contents() {
            let Some(key) = obj.key() else { continue };
            let last_modified = obj
                .last_modified()
                .ok_or_else(|| Error::Other(format!("no Last-Modified on listed key {key:?}")))
                .and_then(|dt| to_offset(dt, key))?;
            items.push(KeyInfo {
                key: key.to_string(),
                size: obj.size().unwrap_or(0) as u64,
                last_modified,
            });
        }

        let next_marker = if output.is_truncated() == Some(true) {
            output.next_continuation_token().map(|s| s.to_string())
        } else {
            None
        };

        Ok(ListPage { items, next_marker })
    }

    fn id(&self) -> String {
        format!("s3://{}/{}", self.endpoint, self.bucket)
    }
}
