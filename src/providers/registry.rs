//! Provider registry
//!
//! Single source of truth for which adapters exist. The router queries
//! it on every routing decision; registration is idempotent by name
//! (re-registering replaces the previous adapter). All accessors
//! serialize through one cooperative lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::anthropic::AnthropicProvider;
use super::openai::{OpenAIProvider, GEMINI_API_BASE, GROQ_API_BASE, OPENAI_API_BASE};
use super::Provider;
use crate::config::ProviderConfig;
use crate::error::{Result, RouterError};

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a built-in adapter from a provider config.
    ///
    /// Known names: `openai`, `anthropic`, `groq`, `gemini` (the latter
    /// two through their OpenAI-compatible endpoints). Anything else
    /// must come in through [`register_adapter`](Self::register_adapter)
    /// as a custom [`Provider`] implementation.
    pub async fn register_from_config(&self, config: &ProviderConfig) -> Result<()> {
        if !config.enabled {
            debug!(provider = %config.name, "skipping disabled provider");
            return Ok(());
        }

        let adapter: Arc<dyn Provider> = match config.name.as_str() {
            "openai" => Arc::new(OpenAIProvider::from_config(config, OPENAI_API_BASE)?),
            "groq" => Arc::new(OpenAIProvider::from_config(config, GROQ_API_BASE)?),
            "gemini" => Arc::new(OpenAIProvider::from_config(config, GEMINI_API_BASE)?),
            "anthropic" => Arc::new(AnthropicProvider::from_config(config)?),
            other => {
                return Err(RouterError::Config(format!(
                    "unknown provider '{other}'; built-ins are openai, anthropic, gemini, groq; \
                     register custom adapters with register_adapter()"
                )))
            }
        };
        self.register_adapter(adapter).await;
        Ok(())
    }

    /// Register a pre-built adapter. Replaces any adapter with the same
    /// name.
    pub async fn register_adapter(&self, adapter: Arc<dyn Provider>) {
        let mut providers = self.providers.write().await;
        debug!(provider = adapter.name(), "registering provider adapter");
        providers.insert(adapter.name().to_string(), adapter);
    }

    /// Register a BYOC provider: the caller keeps its fully configured
    /// `reqwest::Client` (credentials in default headers, custom proxies,
    /// timeouts) and the router wraps it in the matching built-in
    /// adapter.
    pub async fn register_byoc(
        &self,
        name: &str,
        client: reqwest::Client,
        model: &str,
        rpm_limit: u32,
        tpm_limit: u64,
        weight: f64,
    ) -> Result<()> {
        let adapter: Arc<dyn Provider> = match name {
            "openai" => Arc::new(OpenAIProvider::with_client(
                name, client, model, rpm_limit, tpm_limit, weight, OPENAI_API_BASE,
            )),
            "groq" => Arc::new(OpenAIProvider::with_client(
                name, client, model, rpm_limit, tpm_limit, weight, GROQ_API_BASE,
            )),
            "gemini" => Arc::new(OpenAIProvider::with_client(
                name, client, model, rpm_limit, tpm_limit, weight, GEMINI_API_BASE,
            )),
            "anthropic" => Arc::new(AnthropicProvider::with_client(
                name, client, model, rpm_limit, tpm_limit, weight,
            )),
            other => {
                return Err(RouterError::Config(format!(
                    "unknown provider '{other}' for BYOC registration; \
                     implement Provider and use register_adapter()"
                )))
            }
        };
        self.register_adapter(adapter).await;
        Ok(())
    }

    /// Adapter by name, if registered.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        providers.get(name).cloned()
    }

    /// All enabled adapters.
    pub async fn get_all_enabled(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        providers.values().filter(|p| p.enabled()).cloned().collect()
    }

    /// Names of every registered adapter.
    pub async fn names(&self) -> Vec<String> {
        let providers = self.providers.read().await;
        providers.keys().cloned().collect()
    }

    /// Close every adapter.
    pub async fn close_all(&self) {
        let providers = self.providers.read().await;
        for provider in providers.values() {
            provider.close().await;
        }
    }
}
