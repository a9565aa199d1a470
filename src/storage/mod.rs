//! Object-store staging area.
//!
//! Thin wrapper over an [`ObjectStore`] holding the staging bucket:
//! upload a sealed stage file, delete it once the COPY committed, and
//! render the `s3://` URI the COPY statement reads from.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, RetryConfig};
use snafu::prelude::*;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::emit;
use crate::error::{InvalidAclSnafu, ObjectStoreSnafu, S3ConfigSnafu, StageFileSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

/// Staging bucket client used by the warehouse sync layer.
#[derive(Clone)]
pub struct StageStore {
    object_store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl std::fmt::Debug for StageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StageStore<s3://{}>", self.bucket)
    }
}

impl StageStore {
    /// Wrap an existing object store (tests inject an in-memory one).
    pub fn new(object_store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            object_store,
            bucket: bucket.into(),
        }
    }

    /// Build the S3 staging client from configuration. Credentials come
    /// from explicit config keys, falling back to the standard AWS
    /// environment (which also covers the `aws_profile` path).
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.s3_bucket)
            .with_retry(RetryConfig::default());

        if let Some(profile) = &config.aws_profile {
            debug!(profile = %profile, "aws_profile set; credentials resolve from the AWS environment");
        }

        if let Some(key_id) = &config.aws_access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &config.aws_secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(token) = &config.aws_session_token {
            builder = builder.with_token(token);
        }

        if let Some(acl) = &config.s3_acl {
            let mut headers = HeaderMap::new();
            headers.insert(
                HeaderName::from_static("x-amz-acl"),
                HeaderValue::from_str(acl)
                    .ok()
                    .context(InvalidAclSnafu { acl: acl.as_str() })?,
            );
            builder =
                builder.with_client_options(ClientOptions::new().with_default_headers(headers));
        }

        let store = builder.build().context(S3ConfigSnafu)?;

        Ok(Self {
            object_store: Arc::new(store),
            bucket: config.s3_bucket.clone(),
        })
    }

    /// The `s3://` URI for a staged key, as consumed by COPY.
    pub fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// Upload one local stage file to `key`.
    pub async fn upload(&self, local: &Path, key: &str) -> Result<(), StorageError> {
        let bytes = tokio::fs::read(local).await.context(StageFileSnafu {
            path: local.display().to_string(),
        })?;

        let result = self
            .object_store
            .put(&ObjectPath::from(key), PutPayload::from(Bytes::from(bytes)))
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: if result.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
        });

        result.map(|_| ()).context(ObjectStoreSnafu { key })
    }

    /// Delete a staged object.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let result = self.object_store.delete(&ObjectPath::from(key)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Delete,
            status: if result.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
        });

        result.context(ObjectStoreSnafu { key })
    }

    /// Whether a staged object exists (used by tests and sweep checks).
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.object_store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(source) => Err(StorageError::ObjectStore {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn memory_store() -> StageStore {
        StageStore::new(Arc::new(InMemory::new()), "test-bucket")
    }

    #[test]
    fn renders_s3_uris() {
        let store = memory_store();
        assert_eq!(
            store.uri("prefix/orders/abc.csv.gz"),
            "s3://test-bucket/prefix/orders/abc.csv.gz"
        );
    }

    #[tokio::test]
    async fn upload_then_delete_round_trip() {
        let store = memory_store();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"1,a\n").unwrap();
        file.flush().unwrap();

        store.upload(file.path(), "orders/batch.csv").await.unwrap();
        assert!(store.exists("orders/batch.csv").await.unwrap());

        store.delete("orders/batch.csv").await.unwrap();
        assert!(!store.exists("orders/batch.csv").await.unwrap());
    }

    #[tokio::test]
    async fn upload_of_missing_local_file_fails() {
        let store = memory_store();
        let err = store
            .upload(Path::new("/nonexistent/stage.csv"), "orders/x.csv")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StageFile { .. }));
    }
}
