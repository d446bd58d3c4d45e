//! OpenAI-compatible chat-completions provider.
//!
//! Works against any endpoint speaking the `/v1/chat/completions` dialect.
//! The key header and its format are configurable for gateways that use
//! `x-api-key` or similar instead of a bearer token.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use taskfabric::{ReasoningError, ReasoningProvider, ReasoningRequest, ReasoningResponse};

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    /// Base URL; `/v1/chat/completions` is appended unless already present.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Header carrying the key. Default: `Authorization`.
    pub api_key_header: String,
    /// Key format with `{key}` placeholder. Default: `Bearer {key}`.
    pub api_key_format: String,
    pub timeout_secs: u64,
}

impl OpenAiCompatibleConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            api_key_header: "Authorization".into(),
            api_key_format: "Bearer {key}".into(),
            timeout_secs: 60,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// [`ReasoningProvider`] backed by an OpenAI-compatible HTTP endpoint.
pub struct OpenAiCompatibleProvider {
    client: Client,
    config: OpenAiCompatibleConfig,
    url: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: OpenAiCompatibleConfig) -> Result<Self, ReasoningError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ReasoningError::Transport {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let url = api_url(&config.base_url);
        Ok(Self {
            client,
            config,
            url,
        })
    }

    fn formatted_key(&self) -> Option<String> {
        self.config
            .api_key
            .as_ref()
            .map(|key| self.config.api_key_format.replace("{key}", key))
    }
}

fn api_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else if trimmed.ends_with("/v1") {
        format!("{trimmed}/chat/completions")
    } else {
        format!("{trimmed}/v1/chat/completions")
    }
}

#[async_trait]
impl ReasoningProvider for OpenAiCompatibleProvider {
    async fn complete(
        &self,
        request: ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: request.prompt,
        });

        let body = ChatRequest {
            model: self.config.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut http = self.client.post(&self.url).json(&body);
        if let Some(key) = self.formatted_key() {
            http = http.header(self.config.api_key_header.as_str(), key);
        }

        let response = http.send().await.map_err(|e| ReasoningError::Transport {
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Transport {
                message: format!("endpoint returned {status}: {body}"),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| ReasoningError::Malformed {
            message: e.to_string(),
        })?;
        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| ReasoningError::Malformed {
                message: "response carried no choices".into(),
            })?;

        tracing::debug!(
            target: "taskfabric::providers",
            model = parsed.model.as_deref().unwrap_or("unknown"),
            chars = text.len(),
            "completion received"
        );
        Ok(ReasoningResponse {
            text,
            model: parsed.model,
        })
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_assembly_handles_existing_paths() {
        assert_eq!(
            api_url("https://api.example.com"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            api_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            api_url("https://gw.internal/v1/chat/completions"),
            "https://gw.internal/v1/chat/completions"
        );
    }

    #[test]
    fn key_formatting_supports_custom_headers() {
        let config = OpenAiCompatibleConfig {
            api_key_header: "x-api-key".into(),
            api_key_format: "{key}".into(),
            ..OpenAiCompatibleConfig::new("https://gw.internal", "gpt-4o")
        }
        .with_api_key("sk-123");
        let provider = OpenAiCompatibleProvider::new(config).unwrap();
        assert_eq!(provider.formatted_key().as_deref(), Some("sk-123"));

        let bearer = OpenAiCompatibleProvider::new(
            OpenAiCompatibleConfig::new("https://api.example.com", "gpt-4o").with_api_key("sk-9"),
        )
        .unwrap();
        assert_eq!(bearer.formatted_key().as_deref(), Some("Bearer sk-9"));
    }

    #[test]
    fn request_body_shape() {
        let body = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "be terse".into(),
                },
                ChatMessage {
                    role: "user",
                    content: "hello".into(),
                },
            ],
            temperature: 0.0,
            max_tokens: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hello");
        assert!(value.get("max_tokens").is_none());
    }
}
