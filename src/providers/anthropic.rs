//! Anthropic provider adapter
//!
//! Speaks the `/v1/messages` wire format. Anthropic keeps the system
//! prompt outside the messages list, so the adapter splits it out of the
//! uniform message format the router uses. Streaming is SSE with typed
//! events; usage arrives in `message_start` (input) and `message_delta`
//! (output).

use async_stream::stream;
use futures::StreamExt;
use serde_json::{json, Value};

use super::openai::{default_http_client, retry_after_seconds};
use super::{ChatCompletion, ChatStream, JsonMap, Provider, ProviderError, StreamChunk};
use crate::config::ProviderConfig;
use crate::core::types::Message;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The messages API requires max_tokens; used when the request leaves it
/// unset.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
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

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
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
                .unwrap_or_else(|| ANTHROPIC_API_BASE.to_string()),
            client,
        })
    }

    /// Wrap a pre-configured client (BYOC); credentials ride in the
    /// client's default headers when `api_key` is empty.
    pub fn with_client(
        name: &str,
        client: reqwest::Client,
        model: &str,
        rpm_limit: u32,
        tpm_limit: u64,
        weight: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            rpm_limit,
            tpm_limit,
            weight,
            enabled: true,
            api_key: String::new(),
            api_base: ANTHROPIC_API_BASE.to_string(),
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
        let (system, chat) = split_system(messages);
        let mut body = json!({
            "model": self.model,
            "messages": chat,
            "max_tokens": max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        for (key, value) in options {
            body[key.as_str()] = value.clone();
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        if !self.api_key.is_empty() {
            request = request.header("x-api-key", &self.api_key);
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
impl Provider for AnthropicProvider {
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

        let content = value["content"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let input_tokens = value["usage"]["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = value["usage"]["output_tokens"].as_u64().unwrap_or(0);

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
            let mut input_tokens = 0u64;
            let mut output_tokens = 0u64;

            while let Some(chunk) = bytes.next().await {
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

                    let Some(event) = parse_event(&line) else {
                        continue;
                    };
                    match event {
                        StreamEvent::Start { input } => input_tokens = input,
                        StreamEvent::Delta(text) => {
                            if !text.is_empty() {
                                yield Ok(StreamChunk::Delta(text));
                            }
                        }
                        StreamEvent::Usage { output } => output_tokens = output,
                        StreamEvent::Stop => {
                            yield Ok(StreamChunk::Done { input_tokens, output_tokens });
                            return;
                        }
                        StreamEvent::Error(message) => {
                            yield Err(ProviderError::stream(&provider, message));
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }

    async fn close(&self) {}
}

/// Extract the system prompt; everything else stays in order.
fn split_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let mut system = None;
    let mut chat = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == "system" {
            system = Some(message.content.clone());
        } else {
            chat.push(message);
        }
    }
    (system, chat)
}

#[derive(Debug)]
enum StreamEvent {
    Start { input: u64 },
    Delta(String),
    Usage { output: u64 },
    Stop,
    Error(String),
}

/// Decode one SSE data line into a stream event. Lines that carry no
/// routable payload (pings, block boundaries, event name lines) return
/// `None`.
fn parse_event(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(data).ok()?;
    match value["type"].as_str()? {
        "message_start" => Some(StreamEvent::Start {
            input: value["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0),
        }),
        "content_block_delta" => Some(StreamEvent::Delta(
            value["delta"]["text"].as_str().unwrap_or_default().to_string(),
        )),
        "message_delta" => Some(StreamEvent::Usage {
            output: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        }),
        "message_stop" => Some(StreamEvent::Stop),
        "error" => Some(StreamEvent::Error(
            value["error"]["message"]
                .as_str()
                .unwrap_or("unknown streaming error")
                .to_string(),
        )),
        _ => None,
    }
}
