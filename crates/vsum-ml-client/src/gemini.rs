//! Gemini client for transcript summarization.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use vsum_models::{KeyPoint, Transcript};

use crate::error::{MlError, MlResult};
use crate::traits::{SummaryResult, Summarizer};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Finish reasons that mean the model withheld its answer.
const BLOCKING_FINISH_REASONS: &[&str] =
    &["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> MlResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| MlError::config("GEMINI_API_KEY not set"))?;
        let defaults = Self::new(api_key);

        Ok(Self {
            base_url: std::env::var("GEMINI_URL").unwrap_or(defaults.base_url.clone()),
            model: std::env::var("GEMINI_MODEL").unwrap_or(defaults.model.clone()),
            timeout: std::env::var("GEMINI_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ..defaults
        })
    }

    fn model_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

/// Gemini API client.
pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> MlResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MlError::config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> MlResult<Self> {
        Self::new(GeminiConfig::from_env()?)
    }

    fn build_prompt(transcript: &Transcript) -> String {
        let segments = transcript.to_timestamped_text();
        format!(
            r#"You summarize video transcripts.

Return ONLY a single JSON object with this schema:
{{
  "summary": "A concise paragraph covering the whole video",
  "key_points": [
    {{
      "text": "One important point made in the video",
      "timestamps": [0.0]
    }}
  ],
  "keywords": ["keyword"]
}}

Here is the TRANSCRIPT, one segment per line, prefixed with [MM:SS].

TRANSCRIPT:
{segments}

Additional instructions:
- Every key point MUST be supported by the transcript above.
- "timestamps" are the start times, in seconds, of the supporting segments.
- Extract 3 to 8 key points and 3 to 10 keywords.
- Return ONLY the JSON object and nothing else.
"#
        )
    }

    async fn generate(&self, prompt: String) -> MlResult<String> {
        let url = format!("{}:generateContent", self.config.model_url());
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
            },
        };

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MlError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: GeminiResponse = response
            .json()
            .await
            .map_err(|e| MlError::malformed(format!("Failed to parse Gemini response: {e}")))?;

        extract_text(body)
    }
}

#[async_trait]
impl Summarizer for GeminiClient {
    async fn summarize(&self, transcript: &Transcript) -> MlResult<SummaryResult> {
        if transcript.is_blank() {
            return Err(MlError::InvalidTranscript("transcript is empty".into()));
        }

        debug!(model = %self.config.model, chunks = transcript.chunks.len(), "Requesting summary");
        let text = self.generate(Self::build_prompt(transcript)).await?;
        let result = parse_summary(&text)?;

        info!(
            model = %self.config.model,
            key_points = result.key_points.len(),
            keywords = result.keywords.len(),
            "Summary generated"
        );
        Ok(result)
    }

    async fn health_check(&self) -> MlResult<()> {
        let response = self
            .http
            .get(self.config.model_url())
            .query(&[("key", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Gemini health check failed");
            Err(MlError::Http {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn extract_text(response: GeminiResponse) -> MlResult<String> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(MlError::Refused(format!("prompt blocked: {reason}")));
    }

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| MlError::malformed("No candidates in Gemini response"))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return match candidate.finish_reason {
            Some(reason) if BLOCKING_FINISH_REASONS.contains(&reason.as_str()) => {
                Err(MlError::Refused(format!("finish reason {reason}")))
            }
            _ => Err(MlError::malformed("No content in Gemini response")),
        };
    }
    Ok(text)
}

/// Drop a surrounding markdown code fence, if any.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

/// Seconds from a number, a numeric string, or `MM:SS` / `HH:MM:SS`.
fn parse_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim().trim_start_matches('[').trim_end_matches(']');
            if let Ok(secs) = s.parse::<f64>() {
                return Some(secs);
            }
            s.split(':').try_fold(0.0, |acc, part| {
                part.trim().parse::<f64>().ok().map(|v| acc * 60.0 + v)
            })
        }
        _ => None,
    }
}

fn parse_key_point(value: &Value) -> Option<KeyPoint> {
    match value {
        Value::String(text) => Some(KeyPoint {
            text: text.trim().to_string(),
            timestamps: Vec::new(),
        }),
        Value::Object(map) => {
            let text = map.get("text")?.as_str()?.trim().to_string();
            let mut timestamps: Vec<f64> = map
                .get("timestamps")
                .and_then(Value::as_array)
                .map(|ts| ts.iter().filter_map(parse_seconds).collect())
                .unwrap_or_default();
            if let Some(sentences) = map.get("supporting_sentences").and_then(Value::as_array) {
                timestamps.extend(
                    sentences
                        .iter()
                        .filter_map(|s| s.get("time").and_then(parse_seconds)),
                );
            }
            Some(KeyPoint { text, timestamps })
        }
        _ => None,
    }
}

/// Parse the model's answer.
///
/// The object shape is what the prompt asks for. A bare array of
/// `{text, supporting_sentences}` points is also accepted; its summary is the
/// point texts joined.
fn parse_summary(raw: &str) -> MlResult<SummaryResult> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| MlError::malformed(format!("Failed to parse summary JSON: {e}")))?;

    let result = match value {
        Value::Object(map) => {
            let key_points = map
                .get("key_points")
                .and_then(Value::as_array)
                .map(|points| points.iter().filter_map(parse_key_point).collect())
                .unwrap_or_default();
            let keywords = map
                .get("keywords")
                .and_then(Value::as_array)
                .map(|words| {
                    words
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|w| w.trim().to_string())
                        .filter(|w| !w.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            let summary = match map.get("summary") {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(_) => return Err(MlError::malformed("summary is not a string")),
                None => return Err(MlError::malformed("missing summary field")),
            };
            SummaryResult {
                summary,
                key_points,
                keywords,
            }
        }
        Value::Array(points) => {
            let key_points: Vec<KeyPoint> = points.iter().filter_map(parse_key_point).collect();
            if key_points.is_empty() && !points.is_empty() {
                return Err(MlError::malformed("no usable key points in array"));
            }
            let summary = key_points
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            SummaryResult {
                summary,
                key_points,
                keywords: Vec::new(),
            }
        }
        _ => return Err(MlError::malformed("expected a JSON object or array")),
    };

    if result.summary.is_empty() {
        return Err(MlError::Refused("model returned an empty summary".into()));
    }
    Ok(result)
}
