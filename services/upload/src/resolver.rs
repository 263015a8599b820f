use crate::error::Result;
use crate::metadata_store::VideoRecord;
use crate::publisher::{ObjectStore, StorageObjectReference};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Time-limited retrieval URL
#[derive(Debug, Clone, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Video record as returned to clients, with a freshly signed URL
#[derive(Debug, Clone, Serialize)]
pub struct SignedVideo {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub video_url: Option<String>,
    pub video_url_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derives signed URLs from stable references at read time
#[derive(Clone)]
pub struct ReferenceResolver {
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn ObjectStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    #[instrument(skip(self), fields(ttl_secs = self.ttl.as_secs()))]
    pub async fn resolve(&self, reference: &StorageObjectReference) -> Result<SignedUrl> {
        reference.validate()?;

        let issued_at = Utc::now();
        let url = self
            .store
            .presign_get(&reference.bucket, &reference.key, self.ttl)
            .await?;

        let expires_at = issued_at
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(SignedUrl { url, expires_at })
    }

    /// Resolve the persisted `<bucket>,<key>` form
    pub async fn resolve_stable(&self, encoded: &str) -> Result<SignedUrl> {
        let reference = StorageObjectReference::parse(encoded)?;
        self.resolve(&reference).await
    }

    /// Replace the stored reference of `video` with a signed URL.
    ///
    /// Records without a published video are returned with no URL.
    pub async fn sign_record(&self, video: VideoRecord) -> Result<SignedVideo> {
        let signed = match video.video_url.as_deref() {
            Some(encoded) => Some(self.resolve_stable(encoded).await?),
            None => None,
        };

        Ok(SignedVideo {
            id: video.id,
            user_id: video.user_id,
            title: video.title,
            description: video.description,
            video_url: signed.as_ref().map(|s| s.url.clone()),
            video_url_expires_at: signed.map(|s| s.expires_at),
            created_at: video.created_at,
            updated_at: video.updated_at,
        })
    }
}
