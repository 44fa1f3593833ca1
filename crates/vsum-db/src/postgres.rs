//! PostgreSQL-backed video repository.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Pool, Postgres};
use tracing::{debug, info};
use uuid::Uuid;
use vsum_models::{NewVideo, SummaryBlob, VideoId, VideoMetadata};

use crate::error::{DbError, DbResult};
use crate::repo::{Inserted, VideoRepository};

const SCHEMA: &str = include_str!("schema.sql");

const VIDEO_COLUMNS: &str = "id, owner_id, title, description, thumbnail_url, media_url, \
    media_key, mime_type, file_name, upload_key, is_summarized, metadata, created_at, updated_at";

/// Split the embedded schema into single statements; prepared statements
/// take one at a time.
fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbConfig {
    /// Create config from environment variables.
    pub fn from_env() -> DbResult<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| DbError::config("DATABASE_URL not set"))?,
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            acquire_timeout: Duration::from_secs(
                std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
        })
    }
}

#[derive(Debug, FromRow)]
struct VideoRow {
    id: Uuid,
    owner_id: String,
    title: String,
    description: String,
    thumbnail_url: Option<String>,
    media_url: String,
    media_key: String,
    mime_type: String,
    file_name: String,
    upload_key: String,
    is_summarized: bool,
    metadata: Option<Json<SummaryBlob>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<VideoRow> for VideoMetadata {
    fn from(row: VideoRow) -> Self {
        VideoMetadata {
            id: VideoId::from(row.id),
            owner_id: row.owner_id,
            title: row.title,
            description: row.description,
            thumbnail_url: row.thumbnail_url,
            media_url: row.media_url,
            media_key: row.media_key,
            mime_type: row.mime_type,
            file_name: row.file_name,
            upload_key: row.upload_key,
            is_summarized: row.is_summarized,
            summary_blob: row.metadata.map(|Json(blob)| blob),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Video rows in PostgreSQL.
#[derive(Clone)]
pub struct PgVideoRepository {
    pool: Pool<Postgres>,
}

impl PgVideoRepository {
    /// Connect and apply the schema.
    pub async fn connect(config: &DbConfig) -> DbResult<Self> {
        let opts = PgConnectOptions::from_str(&config.database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(opts)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(repo)
    }

    /// Create from environment variables.
    pub async fn from_env() -> DbResult<Self> {
        Self::connect(&DbConfig::from_env()?).await
    }

    /// Wrap an existing pool without touching the schema.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> DbResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn get_by_upload_key(&self, upload_key: &str) -> DbResult<Option<VideoMetadata>> {
        let row = sqlx::query_as::<_, VideoRow>(&format!(
            "SELECT {VIDEO_COLUMNS} FROM video WHERE upload_key = $1"
        ))
        .bind(upload_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl VideoRepository for PgVideoRepository {
    async fn insert_idempotent(&self, video: NewVideo) -> DbResult<Inserted> {
        let upload_key = video.upload_key.clone();
        let row = sqlx::query_as::<_, VideoRow>(&format!(
            r#"
            INSERT INTO video (id, owner_id, title, description, thumbnail_url, media_url,
                               media_key, mime_type, file_name, upload_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (upload_key) DO NOTHING
            RETURNING {VIDEO_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&video.owner_id)
        .bind(&video.title)
        .bind(&video.description)
        .bind(&video.thumbnail_url)
        .bind(&video.media_url)
        .bind(&video.media_key)
        .bind(&video.mime_type)
        .bind(&video.file_name)
        .bind(&video.upload_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(Inserted {
                video: row.into(),
                created: true,
            });
        }

        debug!(upload_key = %upload_key, "Video row already exists");
        let existing = self
            .get_by_upload_key(&upload_key)
            .await?
            .ok_or_else(|| DbError::not_found(upload_key))?;
        Ok(Inserted {
            video: existing,
            created: false,
        })
    }

    async fn get(&self, id: &VideoId) -> DbResult<Option<VideoMetadata>> {
        let row = sqlx::query_as::<_, VideoRow>(&format!(
            "SELECT {VIDEO_COLUMNS} FROM video WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn mark_summarized(
        &self,
        id: &VideoId,
        summary: &SummaryBlob,
    ) -> DbResult<VideoMetadata> {
        let row = sqlx::query_as::<_, VideoRow>(&format!(
            r#"
            UPDATE video
            SET is_summarized = TRUE, metadata = $2, updated_at = now()
            WHERE id = $1
            RETURNING {VIDEO_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(Json(summary))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Into::into)
            .ok_or_else(|| DbError::not_found(id.to_string()))
    }
}
