//! Configuration loading
//!
//! YAML files support `${VAR}` environment interpolation so API keys can
//! stay out of the file. `from_env` builds a minimal config from a fixed
//! set of variables for the known providers.

use std::env;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::models::{ProviderConfig, RouterConfig};
use crate::error::{Result, RouterError};
use crate::providers::JsonMap;

static ENV_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid pattern"));

/// Known providers auto-configured by `from_env`:
/// (env var, name, default model, default rpm, default tpm).
const KNOWN_PROVIDERS: &[(&str, &str, &str, u32, u64)] = &[
    ("OPENAI_API_KEY", "openai", "gpt-4o", 500, 200_000),
    ("ANTHROPIC_API_KEY", "anthropic", "claude-sonnet-4-5", 50, 200_000),
    ("GEMINI_API_KEY", "gemini", "gemini-1.5-pro", 60, 100_000),
    ("GROQ_API_KEY", "groq", "llama-3.1-70b-versatile", 30, 100_000),
];

/// Replace every `${VAR}` placeholder with the value of the environment
/// variable, erroring on the first one that is unset.
fn interpolate_env(raw: &str) -> Result<String> {
    let mut missing: Option<String> = None;
    let expanded = ENV_VAR_RE.replace_all(raw, |caps: &regex::Captures<'_>| {
        let var = &caps[1];
        match env::var(var) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(var) => Err(RouterError::Config(format!(
            "environment variable '{var}' referenced in config is not set"
        ))),
        None => Ok(expanded.into_owned()),
    }
}

impl RouterConfig {
    /// Parse a YAML document, interpolating `${VAR}` placeholders first.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let expanded = interpolate_env(raw)?;
        let config: RouterConfig = serde_yaml::from_str(&expanded)?;
        config.validate().map_err(RouterError::Config)?;
        Ok(config)
    }

    /// Load a YAML config file.
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading router config from file");
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&raw)
    }

    /// Build a minimal config from environment variables.
    ///
    /// Registers a provider for each of `OPENAI_API_KEY`,
    /// `ANTHROPIC_API_KEY`, `GEMINI_API_KEY` and `GROQ_API_KEY` that is
    /// set, with conservative default models and limits. Honors
    /// `LLM_ROUTER_REDIS_URL` and `LLM_ROUTER_WINDOW_SECONDS`.
    pub fn from_env() -> Result<Self> {
        let mut config = RouterConfig::default();

        for &(env_var, name, model, rpm, tpm) in KNOWN_PROVIDERS {
            if let Ok(api_key) = env::var(env_var) {
                if api_key.is_empty() {
                    continue;
                }
                config.providers.push(ProviderConfig {
                    name: name.to_string(),
                    model: model.to_string(),
                    api_key,
                    rpm_limit: rpm,
                    tpm_limit: tpm,
                    weight: 1.0,
                    enabled: true,
                    api_base: None,
                    options: JsonMap::new(),
                });
            }
        }
        debug!(providers = config.providers.len(), "providers discovered in environment");

        if let Ok(url) = env::var("LLM_ROUTER_REDIS_URL") {
            if !url.is_empty() {
                config.shared_store_url = Some(url);
            }
        }
        if let Ok(window) = env::var("LLM_ROUTER_WINDOW_SECONDS") {
            config.window_seconds = window.parse().map_err(|e| {
                RouterError::Config(format!("invalid LLM_ROUTER_WINDOW_SECONDS: {e}"))
            })?;
        }

        config.validate().map_err(RouterError::Config)?;
        Ok(config)
    }
}
