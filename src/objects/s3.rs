//! S3-compatible object store, normally a MinIO deployment.
//!
//! The engines are synchronous, so every request is driven to completion on
//! the runtime that was current when the store was built, or on a private
//! single-threaded runtime when there was none. Calls must come from a
//! blocking context (a `spawn_blocking` worker or a plain thread), never
//! from inside an async task.

use std::future::Future;
use std::time::Duration;

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use super::{validate_bucket, validate_path, ObjectInfo, ObjectStore};
use crate::error::{CoreError, Result};

/// Connection parameters, usually resolved from the `minio_*` keys.
#[derive(Debug, Clone)]
pub struct S3Options {
    /// `host:port`, or a full URL.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Scheme used when `endpoint` has none.
    pub secure: bool,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin123".to_string(),
            region: "us-east-1".to_string(),
            secure: false,
            timeout: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// `endpoint` with a scheme and without a trailing slash.
pub fn endpoint_url(endpoint: &str, secure: bool) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if secure {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

enum Driver {
    Shared(Handle),
    Owned(Runtime),
}

impl Driver {
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match self {
            Driver::Shared(handle) => handle.block_on(fut),
            Driver::Owned(rt) => rt.block_on(fut),
        }
    }
}

pub struct S3ObjectStore {
    client: Client,
    base_url: String,
    driver: Driver,
}

fn unavailable(op: &str, err: impl std::error::Error) -> CoreError {
    CoreError::object(format!("{op}: {}", DisplayErrorContext(err)))
}

fn timestamp(t: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single()
}

impl S3ObjectStore {
    /// Build a client. No request is sent until the first operation.
    pub fn new(options: &S3Options) -> Result<Self> {
        let base_url = endpoint_url(&options.endpoint, options.secure);
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(base_url.as_str())
            .region(Region::new(options.region.clone()))
            .credentials_provider(Credentials::new(
                options.access_key.as_str(),
                options.secret_key.as_str(),
                None,
                None,
                "veritas",
            ))
            .force_path_style(true)
            .retry_config(RetryConfig::standard().with_max_attempts(options.max_attempts.max(1)))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(options.timeout)
                    .operation_timeout(options.timeout)
                    .build(),
            )
            .build();

        let driver = match Handle::try_current() {
            Ok(handle) => Driver::Shared(handle),
            Err(_) => Driver::Owned(
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(CoreError::object)?,
            ),
        };

        info!(endpoint = %base_url, "s3 object store configured");
        Ok(Self {
            client: Client::from_conf(config),
            base_url,
            driver,
        })
    }
}

impl ObjectStore for S3ObjectStore {
    fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        validate_bucket(bucket)?;
        let outcome = self
            .driver
            .block_on(self.client.head_bucket().bucket(bucket).send());
        match outcome {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
            Err(e) => Err(unavailable("head bucket", e)),
        }
    }

    fn create_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket(bucket)?;
        let outcome = self
            .driver
            .block_on(self.client.create_bucket().bucket(bucket).send());
        match outcome {
            Ok(_) => {
                info!(%bucket, "bucket created");
                Ok(())
            }
            Err(e)
                if e.as_service_error().is_some_and(|s| {
                    s.is_bucket_already_owned_by_you() || s.is_bucket_already_exists()
                }) =>
            {
                Ok(())
            }
            Err(e) => Err(unavailable("create bucket", e)),
        }
    }

    fn put(&self, bucket: &str, path: &str, data: Bytes, content_type: &str) -> Result<()> {
        validate_bucket(bucket)?;
        validate_path(path)?;
        let size = data.len();
        self.driver
            .block_on(
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(path)
                    .content_type(content_type)
                    .content_length(size as i64)
                    .body(ByteStream::from(data))
                    .send(),
            )
            .map_err(|e| unavailable("put object", e))?;
        debug!(%bucket, %path, size, "object stored");
        Ok(())
    }

    fn get(&self, bucket: &str, path: &str) -> Result<Bytes> {
        validate_bucket(bucket)?;
        validate_path(path)?;
        self.driver.block_on(async {
            let out = match self.client.get_object().bucket(bucket).key(path).send().await {
                Ok(out) => out,
                Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                    return Err(CoreError::not_found("object", format!("{bucket}/{path}")));
                }
                Err(e) => return Err(unavailable("get object", e)),
            };
            let body = out
                .body
                .collect()
                .await
                .map_err(|e| unavailable("read object body", e))?;
            Ok::<_, CoreError>(body.into_bytes())
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        validate_bucket(bucket)?;
        let mut objects = self.driver.block_on(async {
            let mut objects = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix)
                    .set_continuation_token(token.take())
                    .send()
                    .await
                    .map_err(|e| unavailable("list objects", e))?;
                for obj in page.contents() {
                    let Some(key) = obj.key() else { continue };
                    objects.push(ObjectInfo {
                        path: key.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        last_modified: obj.last_modified().and_then(timestamp),
                    });
                }
                match page.next_continuation_token() {
                    Some(next) if page.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                    _ => break,
                }
            }
            Ok::<_, CoreError>(objects)
        })?;
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        validate_bucket(bucket)?;
        validate_path(path)?;
        self.driver
            .block_on(self.client.delete_object().bucket(bucket).key(path).send())
            .map_err(|e| unavailable("delete object", e))?;
        Ok(())
    }

    fn ping(&self) -> Result<()> {
        self.driver
            .block_on(self.client.list_buckets().send())
            .map_err(|e| unavailable("list buckets", e))?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> Option<String> {
        Some(format!("{}/{bucket}/{path}", self.base_url))
    }
}
