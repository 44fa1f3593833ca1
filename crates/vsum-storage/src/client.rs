//! S3-compatible object store (MinIO, R2, AWS).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::store::ObjectStore;

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Host, optionally with `:port`
    pub endpoint: String,
    pub port: Option<u16>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    /// https when set, http otherwise
    pub use_ssl: bool,
    /// Bucket for uploaded videos
    pub bucket: String,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint: std::env::var("S3_ENDPOINT")
                .map_err(|_| StorageError::config_error("S3_ENDPOINT not set"))?,
            port: std::env::var("S3_PORT").ok().and_then(|p| p.parse().ok()),
            access_key_id: std::env::var("S3_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("S3_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("S3_SECRET_ACCESS_KEY not set"))?,
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            use_ssl: std::env::var("S3_USE_SSL")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "videos".to_string()),
        })
    }

    /// `{scheme}://{endpoint}[:port]`
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        let host = self.endpoint.trim_end_matches('/');
        let host = host
            .strip_prefix("https://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host);
        match self.port {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        }
    }

    /// Public URL of an object. Path-style, which every S3-compatible server accepts.
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url(), bucket, key)
    }
}

/// S3-compatible storage client.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vsum",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.base_url())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            config,
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Default bucket from configuration.
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String> {
        let size = bytes.len();
        debug!(bucket, key, size, "Uploading object");

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                warn!(bucket, key, error = %e, "Object upload failed");
                StorageError::upload_failed(e.to_string())
            })?;

        info!(bucket, key, size, "Uploaded object");
        Ok(self.config.object_url(bucket, key))
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Vec<u8>> {
        debug!(bucket, key, "Downloading object");

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StorageError::not_found(format!("{bucket}/{key}"))
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(bytes)
    }

    async fn exists(&self, bucket: &str) -> StorageResult<bool> {
        if bucket.is_empty() {
            return Ok(false);
        }
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
            Err(e) => Err(StorageError::AwsSdk(e.to_string())),
        }
    }

    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        if self.exists(bucket).await? {
            return Ok(());
        }

        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => {
                info!(bucket, "Created bucket");
                Ok(())
            }
            // Another worker created it first.
            Err(e)
                if e.as_service_error().is_some_and(|s| {
                    s.is_bucket_already_owned_by_you() || s.is_bucket_already_exists()
                }) =>
            {
                Ok(())
            }
            Err(e) => Err(StorageError::AwsSdk(format!("create bucket {bucket}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(use_ssl: bool, port: Option<u16>) -> S3Config {
        S3Config {
            endpoint: "minio.local".into(),
            port,
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            region: "us-east-1".into(),
            use_ssl,
            bucket: "videos".into(),
        }
    }

    #[test]
    fn object_url_uses_scheme_and_port() {
        assert_eq!(
            config(false, Some(9000)).object_url("videos", "clip-1.mp4"),
            "http://minio.local:9000/videos/clip-1.mp4"
        );
        assert_eq!(
            config(true, None).object_url("videos", "clip-1.mp4"),
            "https://minio.local/videos/clip-1.mp4"
        );
    }

    #[test]
    fn base_url_tolerates_scheme_in_endpoint() {
        let mut cfg = config(true, None);
        cfg.endpoint = "http://r2.example.com/".into();
        assert_eq!(cfg.base_url(), "https://r2.example.com");
    }
}
