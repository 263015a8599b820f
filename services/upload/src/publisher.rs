use crate::classifier::AspectClassification;
use crate::config::S3Config;
use crate::error::{PipelineError, Result};
use crate::staging::StagedArtifact;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Stable, non-expiring location of a published video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObjectReference {
    pub bucket: String,
    pub key: String,
}

impl StorageObjectReference {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse the persisted `<bucket>,<key>` form
    pub fn parse(encoded: &str) -> Result<Self> {
        let (bucket, key) = encoded.split_once(',').ok_or_else(|| {
            PipelineError::Validation(format!("Malformed storage reference: {encoded}"))
        })?;

        let reference = Self::new(bucket.trim(), key.trim());
        reference.validate()?;
        Ok(reference)
    }

    /// Both components must be present
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() || self.key.is_empty() {
            return Err(PipelineError::Validation(format!(
                "Storage reference is missing a bucket or key: {self}"
            )));
        }
        Ok(())
    }
}

/// Renders the persisted `<bucket>,<key>` form
impl fmt::Display for StorageObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.bucket, self.key)
    }
}

/// Object key for a published video: `<classification>/<video_id>`
pub fn object_key(classification: AspectClassification, video_id: Uuid) -> String {
    format!("{}/{}", classification, video_id)
}

/// Object storage operations used by the pipeline and the resolver
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single-request upload of a local file, replacing any object at `key`
    async fn put_file(&self, bucket: &str, key: &str, path: &Path, content_type: &str)
        -> Result<()>;

    /// Time-limited GET URL for an object
    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String>;
}

/// S3-backed object store
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    /// Create a new S3 client from configuration
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 client initialized"
        );

        Self { client }
    }

    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| PipelineError::storage("Failed to open video for upload", e))?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                PipelineError::storage("Failed to upload video to S3", DisplayErrorContext(&e))
            })?;

        Ok(())
    }

    async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| PipelineError::storage("Failed to create presigning config", e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| {
                PipelineError::storage("Failed to generate presigned URL", DisplayErrorContext(&e))
            })?;

        Ok(presigned.uri().to_string())
    }
}

/// Publishes optimized videos under classification-prefixed keys
#[derive(Clone)]
pub struct ObjectPublisher {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Upload `artifact` to `<classification>/<video_id>`.
    ///
    /// Returns a reference only once the store acknowledged the whole object.
    #[instrument(skip(self, artifact), fields(bucket = %self.bucket))]
    pub async fn publish(
        &self,
        artifact: &StagedArtifact,
        classification: AspectClassification,
        video_id: Uuid,
        content_type: &str,
    ) -> Result<StorageObjectReference> {
        let key = object_key(classification, video_id);

        debug!(key = %key, path = %artifact.path().display(), "Uploading video");

        self.store
            .put_file(&self.bucket, &key, artifact.path(), content_type)
            .await?;

        info!(key = %key, "Video published");
        metrics::counter!("upload.objects.published", "classification" => classification.as_str())
            .increment(1);

        Ok(StorageObjectReference::new(self.bucket.clone(), key))
    }
}


#[cfg(test)]
mod tests {
    use super::memory::InMemoryObjectStore;
    use super::*;
    use mockall::mock;

    mock! {
        pub Store {}

        #[async_trait]
        impl ObjectStore for Store {
            async fn put_file(&self, bucket: &str, key: &str, path: &Path, content_type: &str) -> Result<()>;
            async fn presign_get(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String>;
        }
    }

    fn artifact(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> StagedArtifact {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        StagedArtifact::claim(path).unwrap()
    }

    #[test]
    fn test_object_key_format() {
        let video_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            object_key(AspectClassification::Landscape, video_id),
            "landscape/550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            object_key(AspectClassification::Other, video_id),
            "other/550e8400-e29b-41d4-a716-446655440000"
        );
    }

    #[test]
    fn test_reference_stable_form() {
        let reference = StorageObjectReference::new("videos", "portrait/abc");
        assert_eq!(reference.to_string(), "videos,portrait/abc");
        assert_eq!(
            StorageObjectReference::parse("videos,portrait/abc").unwrap(),
            reference
        );
    }

    #[test]
    fn test_malformed_references_rejected() {
        for encoded in ["", "videos", ",landscape/abc", "videos,", " , "] {
            let err = StorageObjectReference::parse(encoded).unwrap_err();
            assert_eq!(err.category(), "validation", "{encoded:?}");
        }
    }

    #[tokio::test]
    async fn test_publish_uses_classified_key_and_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::default());
        let publisher = ObjectPublisher::new(store.clone(), "videos");
        let video_id = Uuid::new_v4();

        let reference = publisher
            .publish(
                &artifact(&dir, "a.mp4", b"first"),
                AspectClassification::Portrait,
                video_id,
                "video/mp4",
            )
            .await
            .unwrap();

        assert_eq!(reference.bucket, "videos");
        assert_eq!(reference.key, format!("portrait/{video_id}"));
        let stored = store.get("videos", &reference.key).unwrap();
        assert_eq!(stored.body, b"first");
        assert_eq!(stored.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_republish_overwrites_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryObjectStore::default());
        let publisher = ObjectPublisher::new(store.clone(), "videos");
        let video_id = Uuid::new_v4();

        let first = publisher
            .publish(
                &artifact(&dir, "a.mp4", b"first"),
                AspectClassification::Landscape,
                video_id,
                "video/mp4",
            )
            .await
            .unwrap();
        let second = publisher
            .publish(
                &artifact(&dir, "b.mp4", b"second"),
                AspectClassification::Landscape,
                video_id,
                "video/mp4",
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("videos", &second.key).unwrap().body, b"second");
    }

    #[tokio::test]
    async fn test_store_failure_returns_no_reference() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MockStore::new();
        store
            .expect_put_file()
            .times(1)
            .returning(|_, _, _, _| Err(PipelineError::Storage("connection reset".into())));
        let publisher = ObjectPublisher::new(Arc::new(store), "videos");

        let err = publisher
            .publish(
                &artifact(&dir, "a.mp4", b"data"),
                AspectClassification::Other,
                Uuid::new_v4(),
                "video/mp4",
            )
            .await
            .unwrap_err();

        assert_eq!(err.category(), "storage");
    }
}
