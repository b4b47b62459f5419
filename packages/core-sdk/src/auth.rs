use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result as AnyResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::llm::error_chain;

pub const SECURITY_TIMEOUT: Duration = Duration::from_secs(5);
pub const MICROSERVICE_NAME: &str = "ai-service";
pub const HARDCODED_KEY_ID: &str = "hardcoded-key";

const API_KEY_PREFIXES: [&str; 2] = ["sk_live_", "sk_test_"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    Token(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Token,
}

/**
 * \brief Who made the request, as reported by the authorizer. Attached to
 * request extensions by the auth middleware.
 */
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: Option<String>,
    pub auth_type: AuthType,
    /** \brief Raw validation payload from the authorizer */
    pub info: Value,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Missing(String),
    #[error("{0}")]
    Denied(String),
    #[error("{0}")]
    Unavailable(String),
}

/** \brief Credentials shaped like issued API keys rather than session tokens. */
pub fn is_api_key(value: &str) -> bool {
    let value = strip_bearer(value);
    API_KEY_PREFIXES.iter().any(|p| value.starts_with(p))
}

fn strip_bearer(value: &str) -> &str {
    value.strip_prefix("Bearer ").unwrap_or(value).trim()
}

/**
 * \brief Pick credentials from `X-API-Key` / `Authorization`.
 *
 * `X-API-Key` wins. An `Authorization` value counts as an API key when it
 * looks like one, or when the authorizer cannot validate tokens at all.
 */
pub fn extract_credentials(
    api_key_header: Option<&str>,
    authorization: Option<&str>,
    accepts_tokens: bool,
) -> Result<Credentials, AuthError> {
    if let Some(key) = api_key_header.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(Credentials::ApiKey(key.to_string()));
    }
    let Some(auth) = authorization.map(strip_bearer).filter(|a| !a.is_empty()) else {
        let hint = if accepts_tokens {
            "Missing Authorization header or X-API-Key header"
        } else {
            "Missing X-API-Key header or Authorization header with API key"
        };
        return Err(AuthError::Missing(hint.to_string()));
    };
    if !accepts_tokens || is_api_key(auth) {
        Ok(Credentials::ApiKey(auth.to_string()))
    } else {
        Ok(Credentials::Token(auth.to_string()))
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /** \brief Whether session/JWT tokens can be validated. */
    fn accepts_tokens(&self) -> bool;

    async fn authorize(
        &self,
        credentials: &Credentials,
        path: &str,
        method: &str,
    ) -> Result<Identity, AuthError>;
}

/**
 * \brief Standalone mode: a single configured key, no tokens.
 */
pub struct StaticKeyAuthorizer {
    key: String,
}

impl StaticKeyAuthorizer {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Authorizer for StaticKeyAuthorizer {
    fn accepts_tokens(&self) -> bool {
        false
    }

    async fn authorize(
        &self,
        credentials: &Credentials,
        _path: &str,
        _method: &str,
    ) -> Result<Identity, AuthError> {
        match credentials {
            Credentials::ApiKey(key) if *key == self.key => Ok(Identity {
                id: Some(HARDCODED_KEY_ID.to_string()),
                auth_type: AuthType::ApiKey,
                info: json!({
                    "keyId": HARDCODED_KEY_ID,
                    "valid": true,
                    "message": "API key validated successfully"
                }),
            }),
            Credentials::ApiKey(_) => Err(AuthError::Denied("Invalid API key".to_string())),
            Credentials::Token(_) => Err(AuthError::Denied(
                "Token validation requires security service. \
                 Use API key authentication (X-API-Key header) for standalone mode."
                    .to_string(),
            )),
        }
    }
}

/**
 * \brief Delegates every decision to the external security service.
 */
pub struct SecurityServiceAuthorizer {
    client: reqwest::Client,
    base_url: String,
    application_id: String,
}

impl SecurityServiceAuthorizer {
    pub fn new(client: reqwest::Client, base_url: &str, application_id: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            application_id: application_id.into(),
        }
    }

    async fn validate(
        &self,
        endpoint: &str,
        body: Value,
        denied_default: &str,
    ) -> Result<Value, AuthError> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(url = %url, "validating credentials with security service");
        let resp = self
            .client
            .post(&url)
            .timeout(SECURITY_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, "security service unreachable: {}", error_chain(&e));
                let reason = if e.is_timeout() {
                    "Timeout connecting to security service"
                } else {
                    "Failed to connect to security service"
                };
                AuthError::Unavailable(format!("{reason}: {}", error_chain(&e)))
            })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let payload: Option<Value> = serde_json::from_str(&text).ok();
        if status.is_success() {
            return payload.ok_or_else(|| {
                AuthError::Unavailable("Security service returned an invalid response".to_string())
            });
        }
        let message = payload
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| match status.as_u16() {
                401 | 403 => denied_default.to_string(),
                code => format!("Security service error: {code}"),
            });
        warn!(status = status.as_u16(), "credential validation failed: {message}");
        Err(AuthError::Denied(message))
    }
}

#[async_trait]
impl Authorizer for SecurityServiceAuthorizer {
    fn accepts_tokens(&self) -> bool {
        true
    }

    async fn authorize(
        &self,
        credentials: &Credentials,
        path: &str,
        method: &str,
    ) -> Result<Identity, AuthError> {
        match credentials {
            Credentials::ApiKey(key) => {
                let info = self
                    .validate(
                        "/api/v1/apikeys/validate",
                        json!({
                            "api_key": key,
                            "microservice": MICROSERVICE_NAME,
                            "resource_path": path,
                            "http_method": method,
                        }),
                        "API key is invalid or does not have access",
                    )
                    .await?;
                Ok(Identity {
                    id: string_field(&info, "keyId"),
                    auth_type: AuthType::ApiKey,
                    info,
                })
            }
            Credentials::Token(token) => {
                let info = self
                    .validate(
                        "/api/v1/validate",
                        json!({
                            "token": token,
                            "application_id": self.application_id,
                            "path": path,
                            "http_method": method,
                        }),
                        "Token is invalid or expired",
                    )
                    .await?;
                Ok(Identity {
                    id: string_field(&info, "userId"),
                    auth_type: AuthType::Token,
                    info,
                })
            }
        }
    }
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/**
 * \brief Security service when enabled, otherwise the static key.
 */
pub fn from_config(config: &Config, client: reqwest::Client) -> AnyResult<Arc<dyn Authorizer>> {
    if config.enable_security_service {
        info!(
            url = %config.security_service_url,
            application_id = %config.security_application_id,
            "using security service for authentication"
        );
        return Ok(Arc::new(SecurityServiceAuthorizer::new(
            client,
            &config.security_service_url,
            config.security_application_id.clone(),
        )));
    }
    match config.hardcoded_api_key.as_deref() {
        Some(key) if !key.is_empty() => {
            info!("security service disabled; using static API key");
            Ok(Arc::new(StaticKeyAuthorizer::new(key)))
        }
        _ => bail!("HARDCODED_API_KEY must be set when the security service is disabled"),
    }
}
