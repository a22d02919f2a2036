//! AWS S3 storage implementation.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use chrono::DateTime;

use crate::error::{AppError, Result};
use crate::models::ObjectSummary;
use crate::storage::BlobStore;

/// S3-backed document storage.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Create a new S3 store.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Create an S3 store for `bucket` using credentials and region from
    /// the environment.
    pub async fn from_env(bucket: &str) -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::with_sdk_config(&config, bucket)
    }

    /// Create an S3 store for exactly the configured `bucket`.
    pub fn with_sdk_config(config: &aws_config::SdkConfig, bucket: &str) -> Result<Self> {
        let bucket = bucket.trim();
        if bucket.is_empty() {
            return Err(AppError::config("no S3 bucket configured"));
        }
        Ok(Self::new(Client::new(config), bucket))
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            // 403 is what S3 answers for a missing key without ListBucket permission
            Err(err)
                if matches!(
                    err.raw_response().map(|r| r.status().as_u16()),
                    Some(404 | 403)
                ) =>
            {
                Ok(false)
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(AppError::storage(format!(
                        "head s3://{}/{}: {}",
                        self.bucket, key, service_err
                    )))
                }
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output.body.collect().await.map_err(AppError::storage)?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    log::info!("No object at s3://{}/{}", self.bucket, key);
                    Ok(None)
                } else {
                    Err(AppError::storage(service_err))
                }
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| AppError::storage(e.into_service_error()))?;

        log::info!("Wrote {} bytes to s3://{}/{}", size, self.bucket, key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| AppError::storage(e.into_service_error()))?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(ObjectSummary {
                    key: key.to_string(),
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                    size: object.size().unwrap_or_default().max(0) as u64,
                });
            }
        }

        Ok(objects)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn verify_access(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                AppError::storage(format!(
                    "cannot access bucket {}: {}",
                    self.bucket,
                    e.into_service_error()
                ))
            })?;
        log::info!("Verified access to s3://{}", self.bucket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sdk_config() -> aws_config::SdkConfig {
        aws_config::SdkConfig::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new("us-east-1"))
            .build()
    }

    #[test]
    fn uses_the_configured_bucket() {
        let store = S3Store::with_sdk_config(&sdk_config(), " denningdata ").unwrap();
        assert_eq!(store.bucket, "denningdata");
        assert_eq!(
            store.location("documents/2023/01/a.pdf"),
            "s3://denningdata/documents/2023/01/a.pdf"
        );
    }

    #[test]
    fn empty_bucket_is_a_config_error() {
        let err = S3Store::with_sdk_config(&sdk_config(), "  ").err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}
