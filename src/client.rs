//! Metadata client: one generateContent call per image.
//!
//! The remote endpoint is treated as a black box returning structured text.
//! Failures are classified three ways because the batch runner treats them
//! differently: `Timeout` and `Api`/`MalformedResponse` are fatal for the
//! row, while `QuotaExceeded` is eligible for credential rotation.

use crate::config::ApiConfig;
use crate::resolver::ResolvedModel;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Generated metadata triple for one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub title: String,
    pub description: String,
    pub keywords: Vec<String>,
}

/// Trait for metadata generation backends
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn generate(
        &self,
        credential: &str,
        model: &ResolvedModel,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<ImageMetadata>;
}

const INSTRUCTION_PROMPT: &str = "You are a stock photography metadata expert. \
Analyze the attached image and return a JSON object with exactly these fields: \
\"title\" (a marketable stock photo title, 10-70 characters), \
\"description\" (a factual description of the image content, 120-200 characters), \
\"keywords\" (an array of 25-49 lowercase single-word or short-phrase search keywords, \
most relevant first). Return only the JSON object, no other text.";

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
    details: Option<Vec<serde_json::Value>>,
}

/// Gemini-style generateContent client
pub struct GeminiClient {
    config: ApiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { config, client })
    }

    fn build_request(&self, image_bytes: &[u8], mime_type: &str) -> GenerateRequest {
        GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![
                    RequestPart::Text {
                        text: INSTRUCTION_PROMPT.to_string(),
                    },
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: mime_type.to_string(),
                            data: general_purpose::STANDARD.encode(image_bytes),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.config.max_output_tokens,
                temperature: self.config.temperature,
                response_mime_type: "application/json".to_string(),
            },
        }
    }
}

#[async_trait]
impl MetadataClient for GeminiClient {
    async fn generate(
        &self,
        credential: &str,
        model: &ResolvedModel,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<ImageMetadata> {
        let url = format!(
            "{}/{}/models/{}:generateContent?key={}",
            self.config.base_url,
            model.api_variant.path_segment(),
            model.model_id,
            credential
        );

        let request = self.build_request(image_bytes, mime_type);

        debug!(
            "Sending generateContent request to model {} ({} image bytes)",
            model.model_id,
            image_bytes.len()
        );

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(Error::Timeout(self.config.timeout_seconds));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &body));
        }

        // The timeout can also fire while the body is streaming in
        let generate_response: GenerateResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) if e.is_timeout() => {
                return Err(Error::Timeout(self.config.timeout_seconds));
            }
            Err(e) => return Err(e.into()),
        };

        let text = generate_response
            .candidates
            .as_deref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.as_deref())
            .and_then(|p| p.first())
            .and_then(|p| p.text.clone())
            .ok_or_else(|| Error::MalformedResponse("no candidate text in response".to_string()))?;

        parse_metadata(&text)
    }
}

/// Map a non-2xx response to the error taxonomy. 429 bodies may carry
/// provider retry and quota-violation details in a details array.
pub(crate) fn classify_http_error(status: u16, body: &str) -> Error {
    let parsed: Option<ApiErrorDetail> = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.error);

    let message = parsed
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| {
            if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body.chars().take(200).collect()
            }
        });

    if status == 429 {
        let retry_after_seconds = parsed
            .as_ref()
            .and_then(|e| e.details.as_deref())
            .and_then(extract_retry_delay);
        return Error::QuotaExceeded {
            message,
            retry_after_seconds,
        };
    }

    Error::Api { status, message }
}

/// Pull the retryDelay out of a google.rpc.RetryInfo detail entry,
/// e.g. {"@type": ".../google.rpc.RetryInfo", "retryDelay": "14s"}.
fn extract_retry_delay(details: &[serde_json::Value]) -> Option<u64> {
    for detail in details {
        let is_retry_info = detail
            .get("@type")
            .and_then(|t| t.as_str())
            .map(|t| t.ends_with("RetryInfo"))
            .unwrap_or(false);
        if !is_retry_info {
            continue;
        }
        if let Some(delay) = detail.get("retryDelay").and_then(|d| d.as_str()) {
            if let Ok(seconds) = delay.trim_end_matches('s').parse::<f64>() {
                return Some(seconds.ceil() as u64);
            }
        }
    }
    None
}

/// Strip markdown code fences and parse the structured metadata shape.
pub(crate) fn parse_metadata(text: &str) -> Result<ImageMetadata> {
    let cleaned = strip_code_fences(text);

    let value: serde_json::Value = serde_json::from_str(&cleaned)
        .map_err(|e| Error::MalformedResponse(format!("invalid JSON: {}", e)))?;

    let title = value
        .get("title")
        .and_then(|t| t.as_str())
        .ok_or_else(|| Error::MalformedResponse("missing title".to_string()))?
        .to_string();

    let description = value
        .get("description")
        .and_then(|d| d.as_str())
        .ok_or_else(|| Error::MalformedResponse("missing description".to_string()))?
        .to_string();

    let keywords = value
        .get("keywords")
        .and_then(|k| k.as_array())
        .ok_or_else(|| Error::MalformedResponse("missing keywords list".to_string()))?
        .iter()
        .map(|k| {
            k.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| Error::MalformedResponse("keywords must be strings".to_string()))
        })
        .collect::<Result<Vec<String>>>()?;

    Ok(ImageMetadata {
        title,
        description,
        keywords,
    })
}

/// Remove a ```json ... ``` (or bare ```) wrapper around the response body.
fn strip_code_fences(text: &str) -> String {
    static FENCE: std::sync::OnceLock<Option<regex::Regex>> = std::sync::OnceLock::new();
    let fence = FENCE.get_or_init(|| regex::Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").ok());
    match fence.as_ref().and_then(|f| f.captures(text)) {
        Some(captures) => captures[1].to_string(),
        None => text.trim().to_string(),
    }
}

/// Guess a MIME type from a file extension; generation only supports the
/// formats the provider accepts inline.
pub fn mime_type_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metadata_plain_json() {
        let text = r#"{"title": "Sunset Over Mountains", "description": "A landscape", "keywords": ["sunset", "mountain"]}"#;
        let metadata = parse_metadata(text).unwrap();
        assert_eq!(metadata.title, "Sunset Over Mountains");
        assert_eq!(metadata.keywords.len(), 2);
    }

    #[test]
    fn test_parse_metadata_strips_code_fences() {
        let text = "```json\n{\"title\": \"A Title Here\", \"description\": \"desc\", \"keywords\": [\"a\"]}\n```";
        let metadata = parse_metadata(text).unwrap();
        assert_eq!(metadata.title, "A Title Here");
    }

    #[test]
    fn test_parse_metadata_strips_bare_fences() {
        let text = "```\n{\"title\": \"T\", \"description\": \"d\", \"keywords\": []}\n```";
        assert!(parse_metadata(text).is_ok());
    }

    #[test]
    fn test_parse_metadata_missing_field() {
        let text = r#"{"title": "Only a title"}"#;
        match parse_metadata(text) {
            Err(Error::MalformedResponse(msg)) => assert!(msg.contains("description")),
            other => panic!("expected MalformedResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_metadata_non_string_keywords() {
        let text = r#"{"title": "T", "description": "d", "keywords": [1, 2]}"#;
        assert!(matches!(
            parse_metadata(text),
            Err(Error::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_classify_quota_with_retry_delay() {
        let body = r#"{"error": {"message": "Resource exhausted", "details": [
            {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "14s"},
            {"@type": "type.googleapis.com/google.rpc.QuotaFailure"}
        ]}}"#;
        match classify_http_error(429, body) {
            Error::QuotaExceeded {
                message,
                retry_after_seconds,
            } => {
                assert_eq!(message, "Resource exhausted");
                assert_eq!(retry_after_seconds, Some(14));
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_non_quota_error() {
        let body = r#"{"error": {"message": "API key not valid"}}"#;
        match classify_http_error(400, body) {
            Error::Api { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "API key not valid");
            }
            other => panic!("expected Api, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_unparseable_body() {
        match classify_http_error(500, "internal error") {
            Error::Api { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "internal error");
            }
            other => panic!("expected Api, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_display_omits_credential() {
        use crate::config::ApiConfig;
        use crate::resolver::ApiVariant;

        // Port 9 (discard) refuses the connection immediately
        let config = ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_seconds: 2,
            max_output_tokens: 64,
            temperature: 0.2,
        };
        let client = GeminiClient::new(config).unwrap();
        let model = ResolvedModel {
            model_id: "gemini-flash-latest".to_string(),
            api_variant: ApiVariant::V1Beta,
            display_name: "Gemini Flash".to_string(),
        };

        let credential = "AIzaSy-very-secret-credential";
        let err = client
            .generate(credential, &model, &[0xFF, 0xD8], "image/jpeg")
            .await
            .unwrap_err();

        let rendered = err.to_string();
        assert!(
            !rendered.contains(credential),
            "credential leaked into error: {}",
            rendered
        );
    }

    #[test]
    fn test_mime_type_lookup() {
        assert_eq!(mime_type_for_extension("JPG"), Some("image/jpeg"));
        assert_eq!(mime_type_for_extension("png"), Some("image/png"));
        assert_eq!(mime_type_for_extension("gif"), None);
    }
}
