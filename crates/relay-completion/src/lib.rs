use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// Boundary to the remote chat-completion provider. The executor drives every
/// node through this trait; tests substitute scripted implementations.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<CompletionResponse>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpCompletionClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpCompletionClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: normalize_base(&base_url.into()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<CompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        if cancel.is_cancelled() {
            anyhow::bail!("completion call canceled");
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("completion call canceled"),
            result = req.send() => result?,
        };

        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_error(&value)
                .unwrap_or_else(|| format!("completion request failed with status {}", status));
            anyhow::bail!("{} (status {})", detail, status.as_u16());
        }
        if let Some(detail) = extract_error(&value) {
            anyhow::bail!(detail);
        }

        let Some(content) = extract_content(&value) else {
            anyhow::bail!(
                "completion returned no content for model `{}` (response: {})",
                request.model,
                truncate_for_error(&value.to_string(), 500)
            );
        };

        Ok(CompletionResponse {
            content,
            usage: extract_usage(&value),
        })
    }
}

fn normalize_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

/// `choices[0].message.content` is a string or an array of `{text}` parts;
/// flattening both shapes is part of the contract, not leniency.
pub fn extract_content(value: &serde_json::Value) -> Option<String> {
    let content = value
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .and_then(|v| v.get("content"))?;

    match content {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                } else if let Some(text) = part.as_str() {
                    out.push_str(text);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        _ => None,
    }
}

/// Missing usage fields default to zero; a missing total defaults to
/// `prompt + completion`.
pub fn extract_usage(value: &serde_json::Value) -> TokenUsage {
    let usage = value.get("usage").cloned().unwrap_or_default();
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            value
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
}
