use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;

use crate::config::DiscoveryConfig;
use crate::error::LlmError;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Service-suggested waits above this are treated as garbage and ignored.
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(15 * 60);

/// A single forced-tool request: the model must answer by calling `tool_name`.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub system: String,
    pub prompt: String,
    pub tool_name: String,
    pub tool_description: String,
    pub input_schema: serde_json::Value,
}

impl ToolRequest {
    fn tool(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.tool_name,
            "description": self.tool_description,
            "input_schema": self.input_schema,
        })
    }
}

/// What came back. Services that honour tool use give `Structured`; others
/// may answer in prose that still contains JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Generated {
    Structured(serde_json::Value),
    Text(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &ToolRequest) -> Result<Generated, LlmError>;
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Messages API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
    max_tokens: u32,
    timeout: Duration,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, config: &DiscoveryConfig) -> Result<Self, LlmError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: config.model.clone(),
            api_url: config.api_url.clone(),
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl TextGenerator for AnthropicClient {
    async fn generate(&self, request: &ToolRequest) -> Result<Generated, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system,
            "tools": [request.tool()],
            "tool_choice": {"type": "tool", "name": request.tool_name},
            "messages": [{"role": "user", "content": request.prompt}]
        });

        tracing::debug!(
            model = %self.model,
            prompt_chars = request.prompt.len(),
            "Sending discovery request"
        );

        let response = self
            .http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let raw = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &raw, retry_after));
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let mut text = String::new();
        for block in parsed.content {
            match block {
                AnthropicContentBlock::ToolUse { name, input } if name == request.tool_name => {
                    return Ok(Generated::Structured(input));
                }
                AnthropicContentBlock::Text { text: t } => text.push_str(&t),
                _ => {}
            }
        }
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse(format!(
                "No tool_use block found for tool '{}'",
                request.tool_name
            )));
        }
        Ok(Generated::Text(text))
    }
}

impl AnthropicClient {
    fn map_transport(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout(self.timeout)
        } else {
            LlmError::Network(e)
        }
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    hinted_wait(value.trim().parse::<f64>().ok()?)
}

/// A wait hint in seconds, or `None` when it is negative, not finite or
/// longer than [`MAX_RETRY_HINT`].
pub fn hinted_wait(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok().filter(|wait| *wait <= MAX_RETRY_HINT)
}

/// Turn a non-2xx answer into a typed error. 429 and the `rate_limit_error`
/// / `overloaded_error` bodies are rate limits; the message is kept so the
/// wait hint inside it can be parsed later.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> LlmError {
    let (kind, message) = match serde_json::from_str::<AnthropicErrorBody>(body) {
        Ok(parsed) => (Some(parsed.error.kind), parsed.error.message),
        Err(_) => (None, body.trim().to_string()),
    };

    let rate_limited = status == 429
        || matches!(kind.as_deref(), Some("rate_limit_error") | Some("overloaded_error"))
        || status == 529;
    if rate_limited {
        return LlmError::RateLimited { message, retry_after };
    }
    LlmError::ServerError { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_use_blocks() {
        let raw = r#"{
            "id": "msg_1",
            "content": [
                {"type": "text", "text": "Here you go"},
                {"type": "tool_use", "id": "tu_1", "name": "report_highlights",
                 "input": {"segments": []}}
            ]
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert!(matches!(
            &parsed.content[1],
            AnthropicContentBlock::ToolUse { name, .. } if name == "report_highlights"
        ));
    }

    #[test]
    fn unknown_blocks_are_tolerated() {
        let raw = r#"{"content": [{"type": "thinking", "thinking": "hmm"}]}"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed.content[0], AnthropicContentBlock::Unknown));
    }

    #[test]
    fn rate_limit_status_keeps_message_and_header() {
        let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"Please try again in 6.5s"}}"#;
        match classify_status(429, body, Some(Duration::from_secs(7))) {
            LlmError::RateLimited { message, retry_after } => {
                assert_eq!(message, "Please try again in 6.5s");
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overloaded_counts_as_rate_limit() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(matches!(
            classify_status(529, body, None),
            LlmError::RateLimited { .. }
        ));
    }

    #[test]
    fn other_statuses_are_server_errors() {
        let err = classify_status(400, "bad things", None);
        assert!(matches!(err, LlmError::ServerError { status: 400, .. }));
        assert!(!err.is_retryable());
        assert!(classify_status(503, "", None).is_retryable());
    }

    #[test]
    fn retry_after_header_rejects_unusable_values() {
        let header = |value: &str| {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, value.parse().unwrap());
            retry_after_header(&headers)
        };
        assert_eq!(header("7"), Some(Duration::from_secs(7)));
        assert_eq!(header(" 2.5 "), Some(Duration::from_millis(2500)));
        assert_eq!(header("inf"), None);
        assert_eq!(header("NaN"), None);
        assert_eq!(header("1e30"), None);
        assert_eq!(header("-3"), None);
        assert_eq!(header("901"), None);
        assert_eq!(header("Wed, 21 Oct 2026 07:28:00 GMT"), None);
        assert_eq!(retry_after_header(&HeaderMap::new()), None);
    }
}
