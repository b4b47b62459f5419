use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gemini::GeminiProvider;
use crate::llm::ChatProvider;
use crate::ollama::OllamaProvider;

/**
 * \brief Provider name → adapter, built once at startup and read-only afterwards.
 */
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<(String, Arc<dyn ChatProvider>)>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: Vec::new(),
            default_provider: default_provider.into().to_lowercase(),
        }
    }

    /** \brief Add or replace an adapter under its lowercase name. */
    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        let key = provider.name().to_lowercase();
        info!(provider = %key, "registered provider");
        match self.providers.iter_mut().find(|(name, _)| *name == key) {
            Some(slot) => slot.1 = provider,
            None => self.providers.push((key, provider)),
        }
    }

    /**
     * \brief Build every adapter the configuration allows. An adapter that fails
     * to initialize is logged and left out; the rest still register.
     */
    pub fn from_config(config: &Config, client: reqwest::Client) -> Self {
        let mut registry = Self::new(config.default_provider.clone());

        match OllamaProvider::new(client.clone(), &config.ollama_base_url) {
            Ok(p) => registry.register(Arc::new(p)),
            Err(e) => warn!(provider = "ollama", "provider not registered: {e:#}"),
        }
        match GeminiProvider::from_key(
            client,
            config.gemini_api_key.as_deref(),
            &config.gemini_base_url,
        ) {
            Ok(p) => registry.register(Arc::new(p)),
            Err(e) => warn!(provider = "gemini", "provider not registered: {e:#}"),
        }

        if !registry.is_available(&registry.default_provider) {
            warn!(
                default = %registry.default_provider,
                available = ?registry.list_available(),
                "default provider is not registered"
            );
        }
        registry
    }

    /**
     * \brief Explicit name (case-insensitive), else the configured default.
     */
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn ChatProvider>> {
        let key = name
            .filter(|n| !n.is_empty())
            .unwrap_or(self.default_provider.as_str())
            .to_lowercase();
        self.providers
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, p)| p.clone())
            .ok_or_else(|| GatewayError::ProviderNotFound {
                name: key,
                available: self.list_available(),
            })
    }

    /** \brief Registered names in registration order. */
    pub fn list_available(&self) -> Vec<String> {
        self.providers.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_available(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        self.providers.iter().any(|(name, _)| *name == key)
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }
}
