use crate::config::DatabaseConfig;
use crate::error::{PipelineError, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Video metadata record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VideoRecord {
    /// Video ID
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    /// Stable `<bucket>,<key>` reference; never a signed URL
    pub video_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Get/update access to video records
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoRecord>>;

    async fn update_video(&self, video: &VideoRecord) -> Result<()>;

    /// Readiness probe
    async fn ping(&self) -> Result<()>;
}

/// PostgreSQL-backed video store
pub struct PgVideoStore {
    pool: PgPool,
}

impl PgVideoStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl VideoStore for PgVideoStore {
    async fn get_video(&self, video_id: Uuid) -> Result<Option<VideoRecord>> {
        sqlx::query_as::<_, VideoRecord>(
            r#"
            SELECT id, user_id, title, description, video_url, created_at, updated_at
            FROM videos
            WHERE id = $1
            "#,
        )
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(format!("Failed to query video: {e}")))
    }

    #[instrument(skip(self, video), fields(video_id = %video.id))]
    async fn update_video(&self, video: &VideoRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE videos
            SET title = $2, description = $3, video_url = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(video.id)
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.video_url)
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Persistence(format!("Failed to update video: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Persistence(format!(
                "Video {} disappeared before update",
                video.id
            )));
        }

        debug!(video_url = ?video.video_url, "Video record updated");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::Persistence(format!("Database unreachable: {e}")))?;
        Ok(())
    }
}
