//! Whisper-style transcription service client.
//!
//! `POST {base}/transcribe` with the media as a multipart `file` part and the
//! API key in `x-api-key`. Transient failures are retried inside the call and
//! feed a circuit breaker shared by every caller of the client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use vsum_models::{Transcript, TranscriptChunk};

use crate::breaker::CircuitBreaker;
use crate::error::{MlError, MlResult};
use crate::retry::{retry_if, RetryConfig};
use crate::traits::Transcriber;

/// Configuration for the transcription client.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-request timeout; long media takes a while
    pub timeout: Duration,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open
    pub open_for: Duration,
    /// In-call retries for transient failures
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on one `transcribe` call, retries included. Keep it below
    /// the worker's job deadline so the call reports back to the breaker.
    pub call_budget: Duration,
}

impl WhisperConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(30 * 60),
            failure_threshold: 5,
            open_for: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            call_budget: Duration::from_secs(35 * 60),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> MlResult<Self> {
        let base_url =
            std::env::var("WHISPER_URL").map_err(|_| MlError::config("WHISPER_URL not set"))?;
        let defaults = Self::new(base_url);

        Ok(Self {
            api_key: std::env::var("WHISPER_API_KEY").ok(),
            timeout: env_u64("WHISPER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            failure_threshold: env_u64("WHISPER_CB_FAILURE_THRESHOLD")
                .map(|v| v as u32)
                .unwrap_or(defaults.failure_threshold),
            open_for: env_u64("WHISPER_CB_OPEN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.open_for),
            max_retries: env_u64("WHISPER_CB_RETRIES")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_retries),
            retry_base_delay: env_u64("WHISPER_CB_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            call_budget: env_u64("WHISPER_CALL_BUDGET_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.call_budget),
            ..defaults
        })
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Transcription service client.
pub struct WhisperClient {
    http: Client,
    config: WhisperConfig,
    breaker: CircuitBreaker,
}

impl WhisperClient {
    pub fn new(config: WhisperConfig) -> MlResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MlError::config(format!("Failed to build HTTP client: {e}")))?;
        let breaker = CircuitBreaker::new("whisper", config.failure_threshold, config.open_for);

        Ok(Self {
            http,
            config,
            breaker,
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> MlResult<Self> {
        Self::new(WhisperConfig::from_env()?)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn post_once(
        &self,
        media: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> MlResult<Transcript> {
        let url = format!("{}/transcribe", self.config.base_url.trim_end_matches('/'));
        let part = Part::bytes(media.to_vec())
            .file_name(file_name.to_string())
            .mime_str(mime_type)
            .map_err(|e| MlError::config(e.to_string()))?;
        let form = Form::new().part("file", part);

        let mut request = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MlError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        parse_transcript(&body, file_name)
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(
        &self,
        media: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> MlResult<Transcript> {
        let permit = self.breaker.acquire()?;

        // The half-open trial gets exactly one request.
        let retries = if permit.is_trial() { 0 } else { self.config.max_retries };
        let retry = RetryConfig::new("whisper_transcribe")
            .with_max_retries(retries)
            .with_base_delay(self.config.retry_base_delay);

        debug!(file_name, mime_type, size = media.len(), "Sending media for transcription");
        let attempts = retry_if(&retry, MlError::is_retryable, || {
            self.post_once(media, file_name, mime_type)
        });
        let result = match tokio::time::timeout(self.config.call_budget, attempts).await {
            Ok(result) => result,
            Err(_) => Err(MlError::Timeout(format!(
                "transcription exceeded {:?}",
                self.config.call_budget
            ))),
        };

        match &result {
            Ok(transcript) => {
                permit.succeed();
                info!(
                    file_name,
                    chars = transcript.text.len(),
                    chunks = transcript.chunks.len(),
                    "Transcription complete"
                );
            }
            // Only infrastructure failures count against the service.
            Err(e) if e.is_retryable() => {
                permit.fail();
                warn!(file_name, error = %e, "Transcription failed");
            }
            Err(e) => {
                permit.succeed();
                warn!(file_name, error = %e, "Transcription rejected");
            }
        }
        result
    }
}

#[derive(Debug, Deserialize)]
struct RawChunk {
    #[serde(default)]
    time: Option<f64>,
    /// `[start, end]` as emitted by HF-style pipelines
    #[serde(default)]
    timestamp: Option<Vec<Option<f64>>>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct RawTranscript {
    #[serde(default)]
    text: String,
    #[serde(default)]
    chunks: Vec<RawChunk>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawResponse {
    /// `{"transcriptions": {"<file name>": {...}}}`
    Keyed {
        transcriptions: std::collections::HashMap<String, RawTranscript>,
    },
    Flat(RawTranscript),
}

/// Accept both response shapes and reject transcripts with no text.
fn parse_transcript(body: &str, file_name: &str) -> MlResult<Transcript> {
    let raw: RawResponse = serde_json::from_str(body)
        .map_err(|e| MlError::InvalidTranscript(format!("unparseable response: {e}")))?;

    let raw = match raw {
        RawResponse::Flat(t) => t,
        RawResponse::Keyed { mut transcriptions } => {
            let key = transcriptions
                .contains_key(file_name)
                .then(|| file_name.to_string())
                .or_else(|| transcriptions.keys().next().cloned());
            key.and_then(|k| transcriptions.remove(&k))
                .ok_or_else(|| MlError::InvalidTranscript("no transcription in response".into()))?
        }
    };

    let chunks: Vec<TranscriptChunk> = raw
        .chunks
        .into_iter()
        .map(|c| TranscriptChunk {
            time: c
                .time
                .or_else(|| c.timestamp.and_then(|ts| ts.first().copied().flatten()))
                .unwrap_or(0.0),
            text: c.text,
        })
        .collect();

    let text = if raw.text.trim().is_empty() {
        chunks
            .iter()
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        raw.text
    };

    let transcript = Transcript { text, chunks };
    if transcript.is_blank() {
        return Err(MlError::InvalidTranscript("transcript is empty".into()));
    }
    Ok(transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> WhisperConfig {
        WhisperConfig {
            api_key: Some("secret".into()),
            timeout: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(1),
            ..WhisperConfig::new(server.uri())
        }
    }

    fn transcript_json() -> serde_json::Value {
        serde_json::json!({
            "text": "hello world",
            "chunks": [
                {"time": 0.0, "text": "hello"},
                {"time": 1.5, "text": "world"}
            ]
        })
    }

    #[tokio::test]
    async fn transcribes_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(transcript_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = WhisperClient::new(config(&server)).unwrap();
        let transcript = client.transcribe(b"media", "talk.mp4", "video/mp4").await.unwrap();
        assert_eq!(transcript.text, "hello world");
        assert_eq!(transcript.chunks.len(), 2);
        assert_eq!(transcript.chunks[1].time, 1.5);
    }

    #[tokio::test]
    async fn retries_server_errors_inside_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(transcript_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = WhisperClient::new(config(&server)).unwrap();
        assert!(client.transcribe(b"media", "talk.mp4", "video/mp4").await.is_ok());
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(415).set_body_string("unsupported media"))
            .expect(1)
            .mount(&server)
            .await;

        let client = WhisperClient::new(config(&server)).unwrap();
        let err = client.transcribe(b"media", "talk.mp4", "video/mp4").await.unwrap_err();
        assert!(matches!(err, MlError::Http { status: 415, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_transcript_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "", "chunks": []})),
            )
            .mount(&server)
            .await;

        let client = WhisperClient::new(config(&server)).unwrap();
        let err = client.transcribe(b"media", "talk.mp4", "video/mp4").await.unwrap_err();
        assert!(matches!(err, MlError::InvalidTranscript(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn circuit_opens_and_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let client = WhisperClient::new(WhisperConfig {
            failure_threshold: 2,
            max_retries: 0,
            open_for: Duration::from_secs(60),
            ..config(&server)
        })
        .unwrap();

        for _ in 0..2 {
            let err = client.transcribe(b"media", "talk.mp4", "video/mp4").await.unwrap_err();
            assert!(matches!(err, MlError::Http { status: 502, .. }));
        }
        let err = client.transcribe(b"media", "talk.mp4", "video/mp4").await.unwrap_err();
        assert!(matches!(err, MlError::CircuitOpen { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn sends_the_upload_mime_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .and(body_string_contains("Content-Type: video/quicktime"))
            .respond_with(ResponseTemplate::new(200).set_body_json(transcript_json()))
            .expect(1)
            .mount(&server)
            .await;

        let client = WhisperClient::new(config(&server)).unwrap();
        assert!(client
            .transcribe(b"media", "talk.mov", "video/quicktime")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cancelled_trial_does_not_wedge_the_circuit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(transcript_json())
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let client = WhisperClient::new(WhisperConfig {
            failure_threshold: 1,
            max_retries: 0,
            open_for: Duration::from_millis(100),
            ..config(&server)
        })
        .unwrap();

        assert!(client.transcribe(b"media", "talk.mp4", "video/mp4").await.is_err());
        assert_eq!(client.breaker().state(), CircuitState::Open);

        // The trial is cut off by a caller deadline before it reports back.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let cut = tokio::time::timeout(
            Duration::from_millis(50),
            client.transcribe(b"media", "talk.mp4", "video/mp4"),
        )
        .await;
        assert!(cut.is_err());
        assert_eq!(client.breaker().state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let transcript = client
            .transcribe(b"media", "talk.mp4", "video/mp4")
            .await
            .unwrap();
        assert_eq!(transcript.text, "hello world");
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn call_budget_bounds_the_whole_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(transcript_json())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = WhisperClient::new(WhisperConfig {
            failure_threshold: 1,
            call_budget: Duration::from_millis(100),
            ..config(&server)
        })
        .unwrap();

        let err = client
            .transcribe(b"media", "talk.mp4", "video/mp4")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::Timeout(_)));
        assert!(err.is_retryable());
        assert_eq!(client.breaker().state(), CircuitState::Open);
    }

    #[test]
    fn parses_keyed_and_timestamp_shapes() {
        let body = serde_json::json!({
            "transcriptions": {
                "talk.mp4": {
                    "text": "",
                    "chunks": [
                        {"timestamp": [3.0, 4.0], "text": " hi "},
                        {"timestamp": [4.0, null], "text": "there"}
                    ]
                }
            }
        })
        .to_string();

        let transcript = parse_transcript(&body, "talk.mp4").unwrap();
        assert_eq!(transcript.text, "hi there");
        assert_eq!(transcript.chunks[0].time, 3.0);
    }
}
