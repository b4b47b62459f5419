use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::telemetry::TelemetryConfig;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_PROVIDER: &str = "ollama";
pub const DEFAULT_PORT: u16 = 8081;

/**
 * \brief Process configuration, read once at startup.
 */
#[derive(Debug, Clone)]
pub struct Config {
    /** \brief Local inference server base URL */
    pub ollama_base_url: String,
    /** \brief Cloud credential; the cloud adapter is not registered without it */
    pub gemini_api_key: Option<String>,
    pub gemini_base_url: String,
    /** \brief Provider used when a request names none */
    pub default_provider: String,
    pub host: String,
    pub port: u16,
    pub enable_security_service: bool,
    pub security_service_url: String,
    pub security_application_id: String,
    /** \brief Static API key for standalone mode */
    pub hardcoded_api_key: Option<String>,
    pub enable_anonymous_access: bool,
    /** \brief Optional SPA directory served for non-API paths */
    pub ui_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_base_url: DEFAULT_OLLAMA_BASE_URL.to_string(),
            gemini_api_key: None,
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            default_provider: DEFAULT_PROVIDER.to_string(),
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            enable_security_service: true,
            security_service_url: "http://localhost:8080".to_string(),
            security_application_id: "ai-service".to_string(),
            hardcoded_api_key: None,
            enable_anonymous_access: false,
            ui_dir: None,
            log_file: None,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /**
     * \brief Load configuration from the process environment.
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief Load configuration through an arbitrary key lookup; empty values count as unset.
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let port = match get("PORT").or_else(|| get("MODELGATE_PORT")) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid port: {raw}"))?,
            None => defaults.port,
        };

        Ok(Self {
            ollama_base_url: get("OLLAMA_BASE_URL").unwrap_or(defaults.ollama_base_url),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_base_url: get("GEMINI_BASE_URL").unwrap_or(defaults.gemini_base_url),
            default_provider: get("DEFAULT_PROVIDER")
                .map(|p| p.to_ascii_lowercase())
                .unwrap_or(defaults.default_provider),
            host: get("MODELGATE_HOST").unwrap_or(defaults.host),
            port,
            enable_security_service: get("ENABLE_SECURITY_SERVICE")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.enable_security_service),
            security_service_url: get("SECURITY_SERVICE_URL")
                .unwrap_or(defaults.security_service_url),
            security_application_id: get("SECURITY_APPLICATION_ID")
                .unwrap_or(defaults.security_application_id),
            hardcoded_api_key: get("HARDCODED_API_KEY"),
            enable_anonymous_access: get("ENABLE_ANONYMOUS_ACCESS")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.enable_anonymous_access),
            ui_dir: get("MODELGATE_UI_DIR").map(PathBuf::from),
            log_file: get("MODELGATE_LOG_FILE").map(PathBuf::from),
            log_filter: get("MODELGATE_LOG").unwrap_or(defaults.log_filter),
        })
    }

    /**
     * \brief Reject auth setups that could never admit a request.
     */
    pub fn validate(&self) -> Result<()> {
        if self.gemini_api_key.is_none() {
            warn!("GEMINI_API_KEY not set; gemini provider will not be registered");
        }
        if self.enable_security_service {
            if self.security_application_id.is_empty() {
                bail!("SECURITY_APPLICATION_ID must be set when security service is enabled");
            }
        } else if self.hardcoded_api_key.is_none() {
            bail!(
                "HARDCODED_API_KEY must be set when ENABLE_SECURITY_SERVICE is false \
                 (standalone mode)"
            );
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            filter: self.log_filter.clone(),
            log_file: self.log_file.clone(),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
