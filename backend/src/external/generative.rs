//! Generative text backend client
//!
//! Client for a Gemini-style `generateContent` HTTP API. The AI query engine
//! depends only on the [`TextGenerator`] trait.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AiConfig;

/// Text and token usage of one generation call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// The backend stopped because it hit the output token limit
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Generative backend is not configured")]
    NotConfigured,

    #[error("Request failed: {0}")]
    Request(String),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, max_output_tokens: u32) -> Result<GenerationOutput, GenerationError>;
}

/// Client for the generative API
#[derive(Clone)]
pub struct GeminiClient {
    endpoint: String,
    api_key: String,
    model: String,
    http_client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    response_mime_type: &'static str,
}

/// Response from the generateContent API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GeminiClient {
    /// Create a new generative API client
    pub fn new(config: &AiConfig) -> Result<Self, GenerationError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GenerationError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http_client,
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str, max_output_tokens: u32) -> Result<GenerationOutput, GenerationError> {
        if self.api_key.is_empty() {
            return Err(GenerationError::NotConfigured);
        }

        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                max_output_tokens,
                response_mime_type: "application/json",
            },
        };

        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GenerationError::Api { status, body });
        }

        let result: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;

        Ok(extract_output(result))
    }
}

fn extract_output(response: GenerateContentResponse) -> GenerationOutput {
    let usage = response.usage_metadata;
    let candidate = response.candidates.into_iter().next();

    let truncated = candidate
        .as_ref()
        .and_then(|c| c.finish_reason.as_deref())
        .map(|reason| reason == "MAX_TOKENS")
        .unwrap_or(false);
    let text = candidate
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .map(|part| part.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    GenerationOutput {
        text,
        prompt_tokens: usage.as_ref().map(|u| u.prompt_token_count).unwrap_or(0),
        completion_tokens: usage.as_ref().map(|u| u.candidates_token_count).unwrap_or(0),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_output_joins_parts_and_usage() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"parts": [{"text": "{\"collection\":"}, {"text": "\"blocks\"}"}], "role": "model"},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 812, "candidatesTokenCount": 40, "totalTokenCount": 852}
            }"#,
        )
        .unwrap();

        let output = extract_output(response);
        assert_eq!(output.text, "{\"collection\":\"blocks\"}");
        assert_eq!(output.prompt_tokens, 812);
        assert_eq!(output.completion_tokens, 40);
        assert!(!output.truncated);
    }

    #[test]
    fn test_extract_output_flags_max_tokens() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "{\"summary\": \"cut"}]}, "finishReason": "MAX_TOKENS"}]}"#,
        )
        .unwrap();

        let output = extract_output(response);
        assert!(output.truncated);
        assert_eq!(output.prompt_tokens, 0);
    }

    #[test]
    fn test_extract_output_without_candidates() {
        let response: GenerateContentResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert_eq!(extract_output(response), GenerationOutput::default());
    }

    #[test]
    fn test_request_serializes_in_api_shape() {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: "hi" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                max_output_tokens: 256,
                response_mime_type: "application/json",
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
    }
}
