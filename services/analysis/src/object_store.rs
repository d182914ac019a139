use crate::config::ObjectStoreConfig;
use crate::error::ObjectStoreError;
use crate::models::{content_type_for, ImageAsset};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Image extensions accepted for upload
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif"];

/// Key-based blob storage holding the uploaded images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata for an object, `None` when it does not exist
    async fn head(&self, key: &str) -> Result<Option<ImageAsset>, ObjectStoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError>;

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ObjectStoreError>;

    /// `true` if the object was removed, `false` if it was already absent
    async fn delete(&self, key: &str) -> Result<bool, ObjectStoreError>;

    async fn list(&self, prefix: Option<String>, max_keys: i32) -> Result<Vec<String>, ObjectStoreError>;

    /// Time-limited download URL
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ObjectStoreError>;
}

/// S3-compatible object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &ObjectStoreConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // S3-compatible endpoints (OCI, MinIO, LocalStack)
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store client initialized"
        );

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ImageAsset>, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ImageAsset {
                key: key.to_string(),
                bucket: self.bucket.clone(),
                content_type: output
                    .content_type()
                    .map(String::from)
                    .unwrap_or_else(|| content_type_for(key).to_string()),
                size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
                created_at: output
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
            })),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(backend_error("head", &DisplayErrorContext(&e)))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ObjectStoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    return Ok(None);
                }
                return Err(backend_error("get", &DisplayErrorContext(&e)));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| backend_error("read body", &e))?;

        Ok(Some(body.into_bytes().to_vec()))
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| backend_error("put", &DisplayErrorContext(&e)))?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, ObjectStoreError> {
        // S3 deletes are silent for missing keys; check first to report absence
        if self.head(key).await?.is_none() {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("delete", &DisplayErrorContext(&e)))?;

        debug!(key = %key, "Object deleted");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: Option<String>, max_keys: i32) -> Result<Vec<String>, ObjectStoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(prefix)
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|e| backend_error("list", &DisplayErrorContext(&e)))?;

        Ok(response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| backend_error("presigning config", &e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| backend_error("presign", &DisplayErrorContext(&e)))?;

        Ok(presigned.uri().to_string())
    }
}

fn backend_error(operation: &str, err: &dyn std::fmt::Display) -> ObjectStoreError {
    ObjectStoreError::Backend(format!("{} failed: {}", operation, err))
}

/// Reduce an uploaded filename to a safe object key
pub fn sanitize_key(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// Whether a filename carries an accepted image extension
pub fn is_allowed_image(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty() && !stem.ends_with(['/', '\\']))
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
