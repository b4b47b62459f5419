use std::sync::Arc;

use anyhow::{anyhow, Context, Result as AnyResult};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::directory::ModelDirectory;
use crate::error::{GatewayError, Result};
use crate::llm::{error_chain, ChatProvider, ChatStream, LineBuffer, GENERATE_TIMEOUT, LIST_TIMEOUT};
use crate::models::Message;

pub const PROVIDER_NAME: &str = "ollama";

/** \brief Used when the backend lists nothing. */
pub const FALLBACK_MODEL: &str = "llama3.2:1b";

/** \brief Weight for identifiers with no recognizable size. */
pub const UNKNOWN_SIZE_WEIGHT: u32 = 50;

const RESOURCE_KEYWORDS: [&str; 5] = ["memory", "buffer", "allocate", "cuda", "out of memory"];
const CONNECTION_RESOURCE_KEYWORDS: [&str; 2] = ["buffer", "allocate"];
const SIZE_BUCKETS: [(&[&str], u32); 5] = [
    (&["1b", "1.5b", "2b", "3b"], 1),
    (&["7b", "8b"], 7),
    (&["13b", "14b"], 14),
    (&["32b", "34b"], 32),
    (&["70b", "72b"], 70),
];
const SUGGESTED_MODELS: usize = 5;

/**
 * \brief Adapter for a local Ollama server (`/api/tags`, `/api/chat`).
 */
#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    directory: Arc<ModelDirectory>,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, base_url: &str) -> AnyResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url)
            .with_context(|| format!("invalid Ollama base URL: {base_url}"))?;
        info!(base_url = %base_url, "ollama provider configured");
        Ok(Self {
            client,
            base_url,
            directory: Arc::new(ModelDirectory::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /**
     * \brief Query `/api/tags`; entries without an identifier are skipped.
     */
    async fn fetch_models(&self) -> AnyResult<Vec<String>> {
        let url = self.endpoint("/api/tags");
        debug!(url = %url, "fetching ollama models");
        let resp = self
            .client
            .get(&url)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("connect to Ollama at {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("list models failed: {} -> {}", status, text));
        }
        let v: Value = resp.json().await.context("decode Ollama model listing")?;
        Ok(parse_model_list(&v))
    }

    /**
     * \brief Backend-order snapshot, fetched on first use or when `force_refresh`.
     *
     * The cache is only ever swapped once per fetch, so concurrent readers keep
     * seeing the previous listing until the new one lands.
     */
    async fn snapshot(&self, force_refresh: bool) -> Option<Arc<Vec<String>>> {
        if !force_refresh {
            if let Some(cached) = self.directory.cached() {
                return Some(cached);
            }
        }
        match self.fetch_models().await {
            Ok(models) => Some(self.directory.replace(models)).filter(|m| !m.is_empty()),
            Err(e) => {
                warn!("ollama model listing failed: {e:#}");
                if force_refresh {
                    self.directory.replace(Vec::new());
                }
                None
            }
        }
    }

    fn chat_body(model: &str, messages: &[Message], stream: bool) -> Value {
        json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        })
    }

    /**
     * \brief Turn a non-2xx chat response into a provider or resource error.
     */
    async fn backend_failure(&self, model: &str, resp: reqwest::Response) -> GatewayError {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or_else(|| format!("Ollama API error: {}", status.as_u16()));

        if is_resource_error(&message) {
            let available = self
                .list_models(false)
                .await
                .unwrap_or_default()
                .into_iter()
                .take(SUGGESTED_MODELS)
                .collect();
            warn!(model, "ollama reported resource exhaustion: {message}");
            return GatewayError::ResourceExhausted {
                model: model.to_string(),
                message,
                available,
            };
        }
        GatewayError::Provider(message)
    }

    async fn send_chat(
        &self,
        model: &str,
        messages: &[Message],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint("/api/chat"))
            .header(CONTENT_TYPE, "application/json")
            .json(&Self::chat_body(model, messages, stream));
        if !stream {
            request = request.timeout(GENERATE_TIMEOUT);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| connection_failure(model, &e))?;
        if !resp.status().is_success() {
            return Err(self.backend_failure(model, resp).await);
        }
        Ok(resp)
    }

    fn chat_stream(
        self,
        messages: Vec<Message>,
        model: Option<String>,
    ) -> impl Stream<Item = Result<String>> + Send {
        try_stream! {
            let model = self.resolve_model(model.as_deref()).await;
            let resp = self.send_chat(&model, &messages, true).await?;
            let mut body = resp.bytes_stream();
            let mut lines = LineBuffer::default();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| connection_failure(&model, &e))?;
                for line in lines.push(&chunk) {
                    if let Some(text) = parse_chat_line(&line)? {
                        yield text;
                    }
                }
            }
            if let Some(line) = lines.finish() {
                if let Some(text) = parse_chat_line(&line)? {
                    yield text;
                }
            }
        }
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    /**
     * \brief Smallest estimated model wins, keeping memory pressure on the backend low.
     */
    async fn default_model(&self) -> String {
        match self.snapshot(false).await {
            Some(models) => {
                let preferred = preferred_model(&models).unwrap_or(FALLBACK_MODEL);
                debug!(
                    model = preferred,
                    weight = estimate_model_size(preferred),
                    "selected default ollama model"
                );
                preferred.to_string()
            }
            None => {
                debug!("no ollama models listed, using fallback {FALLBACK_MODEL}");
                FALLBACK_MODEL.to_string()
            }
        }
    }

    async fn list_models(&self, force_refresh: bool) -> Result<Vec<String>> {
        let mut models = self
            .snapshot(force_refresh)
            .await
            .map(|m| m.to_vec())
            .unwrap_or_default();
        models.sort();
        Ok(models)
    }

    async fn generate(&self, messages: &[Message], model: Option<&str>) -> Result<String> {
        let model = self.resolve_model(model).await;
        let resp = self.send_chat(&model, messages, false).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Provider(format!("invalid response from Ollama: {e}")))?;
        Ok(v.pointer("/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string())
    }

    fn stream(&self, messages: Vec<Message>, model: Option<String>) -> ChatStream {
        Box::pin(self.clone().chat_stream(messages, model))
    }
}

/**
 * \brief Estimated parameter count in billions, parsed from the identifier.
 *
 * Tries `:<n>b`, then `-<n>b`, then any `<n>b`; falls back to keyword buckets
 * and finally to [`UNKNOWN_SIZE_WEIGHT`].
 */
pub fn estimate_model_size(model: &str) -> u32 {
    let lower = model.to_ascii_lowercase();
    for prefix in [Some(b':'), Some(b'-'), None] {
        if let Some(size) = find_size_token(&lower, prefix) {
            return size;
        }
    }
    SIZE_BUCKETS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(_, weight)| *weight)
        .unwrap_or(UNKNOWN_SIZE_WEIGHT)
}

/**
 * \brief First digit run followed by `b`, optionally required to follow `prefix`.
 */
fn find_size_token(name: &str, prefix: Option<u8>) -> Option<u32> {
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let prefixed = match prefix {
            Some(p) => start > 0 && bytes[start - 1] == p,
            None => true,
        };
        if prefixed && bytes.get(i) == Some(&b'b') {
            if let Ok(size) = name[start..i].parse::<u32>() {
                return Some(size);
            }
        }
    }
    None
}

/**
 * \brief Lowest-weight model; ties keep list order.
 */
pub fn preferred_model(models: &[String]) -> Option<&str> {
    models
        .iter()
        .min_by_key(|m| estimate_model_size(m))
        .map(String::as_str)
}

fn is_resource_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RESOURCE_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn connection_failure(model: &str, err: &reqwest::Error) -> GatewayError {
    let text = error_chain(err);
    let lower = text.to_lowercase();
    if CONNECTION_RESOURCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return GatewayError::ResourceExhausted {
            model: model.to_string(),
            message: format!("Memory allocation error: {text}"),
            available: Vec::new(),
        };
    }
    GatewayError::Provider(format!("Failed to connect to Ollama: {text}"))
}

fn parse_model_list(v: &Value) -> Vec<String> {
    let Some(entries) = v.get("models") else {
        warn!("ollama listing has no 'models' key");
        return Vec::new();
    };
    let Some(entries) = entries.as_array() else {
        warn!("ollama listing 'models' is not a list: {entries}");
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let name = entry
                .get("name")
                .or_else(|| entry.get("model"))
                .and_then(|n| n.as_str())
                .filter(|n| !n.is_empty());
            match name {
                Some(name) => {
                    let size = entry.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
                    debug!(
                        model = name,
                        size_bytes = size,
                        estimated_params_b = estimate_model_size(name),
                        "listed ollama model"
                    );
                    Some(name.to_string())
                }
                None => {
                    warn!("skipping ollama model entry without name: {entry}");
                    None
                }
            }
        })
        .collect()
}

/**
 * \brief One NDJSON line → text fragment. Unparseable lines are skipped;
 * an `error` field ends the stream.
 */
fn parse_chat_line(line: &str) -> Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("skipping invalid ollama stream line: {e}");
            return Ok(None);
        }
    };
    if let Some(err) = v.get("error").and_then(|e| e.as_str()) {
        return Err(GatewayError::Provider(format!("Ollama stream error: {err}")));
    }
    Ok(v.pointer("/message/content")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string))
}
