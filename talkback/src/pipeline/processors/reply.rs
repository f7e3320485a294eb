//! Reply generation via an OpenAI-compatible chat-completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::{ReplyGenerator, ReplySegment};
use crate::utils::http_client::{build_http_client, request_error, status_error};
use crate::{Error, Result};

/// Upper bound on segments per reply; extra segments are dropped.
pub const MAX_SEGMENTS: usize = 3;

const SERVICE: &str = "text generation";

const SYSTEM_PROMPT: &str = r#"You are a friendly virtual companion.
Always reply with a JSON object of the form {"messages": [...]} holding at most 3 messages.
Each message has "text", "facialExpression" and "animation".
Facial expressions: smile, sad, angry, surprised, funnyFace, default.
Animations: Talking_0, Talking_1, Talking_2, Crying, Laughing, Rumba, Idle, Terrified, Angry."#;

/// Parse raw reply content into at most [`MAX_SEGMENTS`] segments.
///
/// Accepts `{"messages": [...]}` or a bare array, optionally wrapped in a
/// markdown code fence. Anything else is [`Error::MalformedUpstreamOutput`].
pub fn parse_reply(raw: &str) -> Result<Vec<ReplySegment>> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| Error::malformed(format!("reply is not valid JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(items)) => items,
            _ => return Err(Error::malformed("reply has no \"messages\" array")),
        },
        _ => return Err(Error::malformed("reply is neither an object nor an array")),
    };

    if items.is_empty() {
        return Err(Error::malformed("reply contains no segments"));
    }
    if items.len() > MAX_SEGMENTS {
        warn!(
            "Reply has {} segments, keeping the first {}",
            items.len(),
            MAX_SEGMENTS
        );
    }

    items
        .into_iter()
        .take(MAX_SEGMENTS)
        .enumerate()
        .map(|(i, item)| {
            let segment: ReplySegment = serde_json::from_value(item)
                .map_err(|e| Error::malformed(format!("segment {} is invalid: {}", i, e)))?;
            if segment.text.trim().is_empty()
                || segment.facial_expression.trim().is_empty()
                || segment.animation.trim().is_empty()
            {
                return Err(Error::malformed(format!(
                    "segment {} has an empty field",
                    i
                )));
            }
            Ok(segment)
        })
        .collect()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    response_format: ResponseFormat,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Settings for [`OpenAiReplyGenerator`].
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

pub struct OpenAiReplyGenerator {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiReplyGenerator {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::config("OPENAI_API_KEY is not set"));
        }
        let client = build_http_client(config.request_timeout)?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiReplyGenerator {
    async fn generate(&self, message: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            max_tokens: 1000,
            temperature: 0.6,
            response_format: ResponseFormat {
                kind: "json_object",
            },
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: message,
                },
            ],
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| request_error(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(SERVICE, status, &body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| request_error(SERVICE, e))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::malformed("text generation returned no content"))?;

        debug!("Generated reply ({} bytes)", content.len());
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_form() {
        let segments = parse_reply(
            r#"{"messages":[
                {"text":"Hi!","facialExpression":"smile","animation":"Talking_1"},
                {"text":"How are you?","facialExpression":"default","animation":"Idle"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Hi!");
        assert_eq!(segments[1].animation, "Idle");
    }

    #[test]
    fn test_parse_bare_array_in_fence() {
        let raw = "```json\n[{\"text\":\"a\",\"facialExpression\":\"sad\",\"animation\":\"Crying\"}]\n```";
        let segments = parse_reply(raw).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].facial_expression, "sad");
    }

    #[test]
    fn test_parse_truncates_to_max_segments() {
        let item = r#"{"text":"x","facialExpression":"smile","animation":"Idle"}"#;
        let raw = format!("[{}]", vec![item; 5].join(","));
        assert_eq!(parse_reply(&raw).unwrap().len(), MAX_SEGMENTS);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "not json",
            "[]",
            r#"{"messages":[]}"#,
            r#"{"reply":"hi"}"#,
            r#""just a string""#,
            r#"[{"text":"hi"}]"#,
            r#"[{"text":"  ","facialExpression":"smile","animation":"Idle"}]"#,
        ] {
            let err = parse_reply(raw).unwrap_err();
            assert!(
                matches!(err, Error::MalformedUpstreamOutput(_)),
                "{raw}: {err}"
            );
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_requires_api_key() {
        let err = OpenAiReplyGenerator::new(OpenAiConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let generator = OpenAiReplyGenerator::new(OpenAiConfig {
            api_key: "k".to_string(),
            base_url: "http://localhost:8080/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(generator.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
