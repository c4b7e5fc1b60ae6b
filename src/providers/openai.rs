//! OpenAI-compatible provider adapter
//!
//! Speaks the `/chat/completions` wire format over reqwest. Groq and
//! Gemini expose OpenAI-compatible endpoints, so the registry reuses
//! this adapter for them with a different base URL.

use async_stream::stream;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatCompletion, ChatStream, JsonMap, Provider, ProviderError, StreamChunk};
use crate::config::ProviderConfig;
use crate::core::types::Message;

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

pub struct OpenAIProvider {
    name: String,
    model: String,
    rpm_limit: u32,
    tpm_limit: u64,
    weight: f64,
    enabled: bool,
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// Build an adapter from a provider config, constructing its own
    /// HTTP client.
    pub fn from_config(config: &ProviderConfig, default_base: &str) -> Result<Self, ProviderError> {
        let client = default_http_client(&config.name)?;
        Ok(Self {
            name: config.name.clone(),
            model: config.model.clone(),
            rpm_limit: config.rpm_limit,
            tpm_limit: config.tpm_limit,
            weight: config.weight,
            enabled: config.enabled,
            api_key: config.api_key.clone(),
            api_base: config
                .api_base
                .clone()
                .unwrap_or_else(|| default_base.to_string()),
            client,
        })
    }

    /// Wrap a pre-configured client (BYOC). Credentials are expected to
    /// ride in the client's default headers; no Authorization header is
    /// added when `api_key` is left empty.
    #[allow(clippy::too_many_arguments)]
    pub fn with_client(
        name: &str,
        client: reqwest::Client,
        model: &str,
        rpm_limit: u32,
        tpm_limit: u64,
        weight: f64,
        api_base: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            rpm_limit,
            tpm_limit,
            weight,
            enabled: true,
            api_key: String::new(),
            api_base: api_base.to_string(),
            client,
        }
    }

    fn request_body(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        options: &JsonMap,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        for (key, value) in options {
            body[key.as_str()] = value.clone();
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_seconds(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                &self.name,
                status.as_u16(),
                &body,
                retry_after,
            ));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn rpm_limit(&self) -> u32 {
        self.rpm_limit
    }

    fn tpm_limit(&self) -> u64 {
        self.tpm_limit
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn chat(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        options: &JsonMap,
    ) -> Result<ChatCompletion, ProviderError> {
        let body = self.request_body(messages, max_tokens, temperature, options, false);
        let response = self.send(&body).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&self.name, e))?;

        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = value["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        let output_tokens = value["usage"]["completion_tokens"].as_u64().unwrap_or(0);

        Ok(ChatCompletion {
            content,
            input_tokens,
            output_tokens,
        })
    }

    async fn stream(
        &self,
        messages: &[Message],
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        options: &JsonMap,
    ) -> Result<ChatStream, ProviderError> {
        let body = self.request_body(messages, max_tokens, temperature, options, true);
        let response = self.send(&body).await?;

        let provider = self.name.clone();
        let out = stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage: Option<(u64, u64)> = None;

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ProviderError::stream(&provider, e.to_string()));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    match parse_sse_data(&line) {
                        SseData::Done => break 'outer,
                        SseData::Json(value) => {
                            if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                                if !delta.is_empty() {
                                    yield Ok(StreamChunk::Delta(delta.to_string()));
                                }
                            }
                            if let Some(u) = value.get("usage").filter(|u| !u.is_null()) {
                                usage = Some((
                                    u["prompt_tokens"].as_u64().unwrap_or(0),
                                    u["completion_tokens"].as_u64().unwrap_or(0),
                                ));
                            }
                        }
                        SseData::Skip => {}
                    }
                }
            }

            match usage {
                Some((input_tokens, output_tokens)) => {
                    yield Ok(StreamChunk::Done { input_tokens, output_tokens });
                }
                None => debug!(provider = %provider, "stream ended without a usage chunk"),
            }
        };

        Ok(Box::pin(out))
    }

    async fn close(&self) {
        // reqwest clients release their pool on drop.
    }
}

enum SseData {
    Json(Value),
    Done,
    Skip,
}

/// Decode one SSE line of an OpenAI-compatible stream.
fn parse_sse_data(line: &str) -> SseData {
    let Some(data) = line.strip_prefix("data:") else {
        return SseData::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseData::Done;
    }
    match serde_json::from_str(data) {
        Ok(value) => SseData::Json(value),
        Err(_) => SseData::Skip,
    }
}

pub(super) fn default_http_client(provider: &str) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .connect_timeout(std::time::Duration::from_secs(10))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| ProviderError::network(provider, format!("failed to build http client: {e}")))
}

pub(super) fn retry_after_seconds(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
