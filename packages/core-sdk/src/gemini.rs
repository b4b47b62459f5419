use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result as AnyResult};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::directory::ModelDirectory;
use crate::error::{GatewayError, Result};
use crate::llm::{ChatProvider, ChatStream, LineBuffer, GENERATE_TIMEOUT, LIST_TIMEOUT};
use crate::models::{Message, Role};
use crate::telemetry::mask_secret;

pub const PROVIDER_NAME: &str = "gemini";

/** \brief Static preferred model: cheap and fast. */
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/**
 * \brief Reference table, cheapest first. Used as the fallback listing and
 * as the ordering key for live listings.
 */
pub const GEMINI_MODELS_BY_PRICE: [&str; 9] = [
    "gemini-2.0-flash-lite",
    "gemini-2.0-flash-exp",
    "gemini-2.0-flash",
    "gemini-1.5-flash",
    "gemini-1.5-flash-8b",
    "gemini-1.5-pro",
    "gemini-1.5-pro-latest",
    "gemini-pro",
    "gemini-pro-vision",
];

pub const UNKNOWN_PRICE_RANK: usize = 9999;

const LIST_PAGE_SIZE: &str = "100";

/** \brief Price position of a model; exact match first, then substring either way. */
pub fn price_rank(model: &str) -> usize {
    if let Some(idx) = GEMINI_MODELS_BY_PRICE.iter().position(|m| *m == model) {
        return idx;
    }
    GEMINI_MODELS_BY_PRICE
        .iter()
        .position(|known| model.contains(known) || known.contains(model))
        .unwrap_or(UNKNOWN_PRICE_RANK)
}

/** \brief Stable sort by price rank. */
pub fn sort_by_price(mut models: Vec<String>) -> Vec<String> {
    models.sort_by_key(|m| price_rank(m));
    models
}

fn fallback_models() -> Vec<String> {
    GEMINI_MODELS_BY_PRICE.iter().map(|m| m.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part { text: text.into() }],
        }
    }
}

/**
 * \brief Body of `generateContent` / `streamGenerateContent`.
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/**
 * \brief Map normalized messages onto Gemini roles: assistant → model,
 * system messages lifted into `system_instruction`.
 */
pub fn to_request(messages: &[Message]) -> GenerateContentRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.as_str()),
            Role::Assistant => contents.push(Content::text(Some("model"), msg.content.clone())),
            Role::User => contents.push(Content::text(Some("user"), msg.content.clone())),
        }
    }
    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(Content::text(None, system_parts.join("\n\n")))
    };
    GenerateContentRequest {
        contents,
        system_instruction,
    }
}

pub type TextStream = Pin<Box<dyn Stream<Item = AnyResult<String>> + Send>>;

/**
 * \brief SDK-shaped surface of the Gemini API. The REST client implements it;
 * tests substitute their own.
 */
#[async_trait]
pub trait GeminiApi: Send + Sync {
    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> AnyResult<String>;

    fn generate_content_stream(&self, model: String, request: GenerateContentRequest)
        -> TextStream;

    /** \brief Full model resource names, e.g. `models/gemini-2.0-flash`. */
    async fn list_models(&self) -> AnyResult<Vec<String>>;
}

/**
 * \brief `generativelanguage` REST client.
 */
#[derive(Clone)]
pub struct GeminiRestClient {
    client: reqwest::Client,
    base: String,
    api_key: String,
}

impl GeminiRestClient {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base: normalize_gemini_base(base_url),
            api_key: api_key.into(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base, model, method)
    }

    fn sse_stream(
        self,
        model: String,
        request: GenerateContentRequest,
    ) -> impl Stream<Item = AnyResult<String>> + Send {
        try_stream! {
            let resp = self
                .client
                .post(self.model_url(&model, "streamGenerateContent"))
                .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
                .json(&request)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                Err::<(), _>(anyhow!("gemini request failed: {} -> {}", status, text))?;
            } else {
                let mut body = resp.bytes_stream();
                let mut lines = LineBuffer::default();
                while let Some(chunk) = body.next().await {
                    let chunk = chunk?;
                    for line in lines.push(&chunk) {
                        if let Some(text) = parse_sse_line(&line)? {
                            yield text;
                        }
                    }
                }
                if let Some(line) = lines.finish() {
                    if let Some(text) = parse_sse_line(&line)? {
                        yield text;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GeminiApi for GeminiRestClient {
    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> AnyResult<String> {
        let resp = self
            .client
            .post(self.model_url(model, "generateContent"))
            .query(&[("key", self.api_key.as_str())])
            .timeout(GENERATE_TIMEOUT)
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("gemini request failed: {} -> {}", status, text));
        }
        let v: Value = resp.json().await?;
        Ok(extract_gemini_content(&v))
    }

    fn generate_content_stream(
        &self,
        model: String,
        request: GenerateContentRequest,
    ) -> TextStream {
        Box::pin(self.clone().sse_stream(model, request))
    }

    async fn list_models(&self) -> AnyResult<Vec<String>> {
        let url = format!("{}/models", self.base);
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("key", self.api_key.as_str()), ("pageSize", LIST_PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let resp = self
                .client
                .get(&url)
                .query(&query)
                .timeout(LIST_TIMEOUT)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                bail!("gemini list models failed: {} -> {}", status, text);
            }
            let v: Value = resp.json().await?;
            models.extend(parse_gemini_model_list(&v)?);
            page_token = v
                .get("nextPageToken")
                .and_then(|t| t.as_str())
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(models)
    }
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}

fn parse_gemini_model_list(v: &Value) -> AnyResult<Vec<String>> {
    match v.get("models") {
        Some(Value::Array(arr)) => Ok(arr
            .iter()
            .filter_map(|item| {
                item.get("name")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.get("id").and_then(|s| s.as_str()))
            })
            .map(|s| s.to_string())
            .collect()),
        // An empty page omits the key entirely.
        None => Ok(Vec::new()),
        Some(_) => Err(anyhow!("unexpected gemini models payload: {}", v)),
    }
}

fn extract_gemini_content(v: &Value) -> String {
    let Some(first) = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return v.get("text").and_then(|t| t.as_str()).unwrap_or("").to_string();
    };
    if let Some(parts) = first.pointer("/content/parts").and_then(|p| p.as_array()) {
        return parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");
    }
    first
        .get("output")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string()
}

/**
 * \brief One SSE line → text. Non-data lines are ignored; an `error` object fails the stream.
 */
fn parse_sse_line(line: &str) -> AnyResult<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let v: Value = serde_json::from_str(data).context("decode gemini stream event")?;
    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        bail!("{message}");
    }
    let text = extract_gemini_content(&v);
    Ok(Some(text).filter(|t| !t.is_empty()))
}

/**
 * \brief Cloud adapter. Validates the model against the directory before any
 * generation call reaches the API.
 */
#[derive(Clone)]
pub struct GeminiProvider {
    api: Arc<dyn GeminiApi>,
    directory: Arc<ModelDirectory>,
}

impl GeminiProvider {
    /**
     * \brief REST-backed adapter; fails without a credential.
     */
    pub fn from_key(
        client: reqwest::Client,
        api_key: Option<&str>,
        base_url: &str,
    ) -> AnyResult<Self> {
        let Some(api_key) = api_key.filter(|k| !k.is_empty()) else {
            bail!("GEMINI_API_KEY is required for the gemini provider");
        };
        let rest = GeminiRestClient::new(client, base_url, api_key);
        info!(
            base = rest.base(),
            api_key = %mask_secret(api_key),
            "gemini provider configured"
        );
        Ok(Self::with_api(Arc::new(rest)))
    }

    pub fn with_api(api: Arc<dyn GeminiApi>) -> Self {
        Self {
            api,
            directory: Arc::new(ModelDirectory::new()),
        }
    }

    async fn fetch_models(&self) -> AnyResult<Vec<String>> {
        let names = self.api.list_models().await?;
        Ok(names
            .into_iter()
            .map(|name| match name.rsplit_once('/') {
                Some((_, id)) => id.to_string(),
                None => name,
            })
            .filter(|id| !id.is_empty())
            .collect())
    }

    async fn ensure_available(&self, model: &str) -> Result<()> {
        let available = self.list_models(false).await?;
        if available.iter().any(|m| m == model) {
            Ok(())
        } else {
            Err(GatewayError::ModelUnavailable {
                model: model.to_string(),
                available,
            })
        }
    }

    async fn checked_model(&self, model: Option<&str>) -> Result<String> {
        let model = self.resolve_model(model).await;
        self.ensure_available(&model).await?;
        Ok(model)
    }

    fn chat_stream(
        self,
        messages: Vec<Message>,
        model: Option<String>,
    ) -> impl Stream<Item = Result<String>> + Send {
        try_stream! {
            let model = self.checked_model(model.as_deref()).await?;
            let mut upstream = self.api.generate_content_stream(model, to_request(&messages));
            while let Some(text) = upstream.next().await {
                let text = text.map_err(|e| {
                    GatewayError::Provider(format!("Gemini API stream error: {e:#}"))
                })?;
                if !text.is_empty() {
                    yield text;
                }
            }
        }
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    async fn list_models(&self, force_refresh: bool) -> Result<Vec<String>> {
        if !force_refresh {
            if let Some(cached) = self.directory.cached() {
                return Ok(cached.to_vec());
            }
        }
        let models = match self.fetch_models().await {
            Ok(models) if !models.is_empty() => {
                debug!(count = models.len(), "fetched gemini models");
                sort_by_price(models)
            }
            Ok(_) => {
                warn!("gemini listing returned no models, using reference table");
                fallback_models()
            }
            Err(e) => {
                warn!("gemini model listing failed, using reference table: {e:#}");
                fallback_models()
            }
        };
        Ok(self.directory.replace(models).to_vec())
    }

    async fn generate(&self, messages: &[Message], model: Option<&str>) -> Result<String> {
        let model = self.checked_model(model).await?;
        self.api
            .generate_content(&model, &to_request(messages))
            .await
            .map_err(|e| GatewayError::Provider(format!("Gemini API error: {e:#}")))
    }

    fn stream(&self, messages: Vec<Message>, model: Option<String>) -> ChatStream {
        Box::pin(self.clone().chat_stream(messages, model))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::stream;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct FakeApi {
        listing: Option<Vec<String>>,
        generate_calls: AtomicUsize,
        list_calls: AtomicUsize,
        last_request: std::sync::Mutex<Option<GenerateContentRequest>>,
    }

    impl FakeApi {
        fn listing(models: &[&str]) -> Self {
            Self {
                listing: Some(models.iter().map(|m| m.to_string()).collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl GeminiApi for FakeApi {
        async fn generate_content(
            &self,
            model: &str,
            request: &GenerateContentRequest,
        ) -> AnyResult<String> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(format!("reply from {model}"))
        }

        fn generate_content_stream(
            &self,
            _model: String,
            _request: GenerateContentRequest,
        ) -> TextStream {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(stream::iter(vec![
                Ok("Hel".to_string()),
                Ok(String::new()),
                Ok("lo".to_string()),
                Err(anyhow!("quota exceeded")),
            ]))
        }

        async fn list_models(&self) -> AnyResult<Vec<String>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.listing
                .clone()
                .ok_or_else(|| anyhow!("listing not supported"))
        }
    }

    #[test]
    fn price_rank_matches_exact_then_substring() {
        assert_eq!(price_rank("gemini-2.0-flash-lite"), 0);
        assert_eq!(price_rank("gemini-2.0-flash"), 2);
        assert_eq!(price_rank("gemini-2.0-flash-001"), 2);
        assert_eq!(price_rank("text-embedding-004"), UNKNOWN_PRICE_RANK);
    }

    #[test]
    fn live_listing_is_price_ordered() {
        let sorted = sort_by_price(vec!["gemini-pro".into(), "gemini-2.0-flash".into()]);
        assert_eq!(sorted, vec!["gemini-2.0-flash", "gemini-pro"]);

        let sorted = sort_by_price(vec![
            "embedding-001".into(),
            "gemini-1.5-pro".into(),
            "aqa".into(),
            "gemini-2.0-flash-lite".into(),
        ]);
        assert_eq!(
            sorted,
            vec!["gemini-2.0-flash-lite", "gemini-1.5-pro", "embedding-001", "aqa"]
        );
    }

    #[test]
    fn roles_are_mapped_and_system_lifted() {
        let req = to_request(&[
            Message::system("be brief"),
            Message::user("hi"),
            Message::assistant("hello"),
            Message::system("no emoji"),
        ]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v,
            json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]}
                ],
                "system_instruction": {"parts": [{"text": "be brief\n\nno emoji"}]}
            })
        );
        let plain = serde_json::to_value(to_request(&[Message::user("x")])).unwrap();
        assert!(plain.get("system_instruction").is_none());
    }

    #[test]
    fn base_url_gets_api_version() {
        assert_eq!(
            normalize_gemini_base("https://generativelanguage.googleapis.com"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(
            normalize_gemini_base("http://127.0.0.1:9000/v1beta/"),
            "http://127.0.0.1:9000/v1beta"
        );
    }

    #[test]
    fn sse_lines_are_decoded() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"Hi"},{"text":"!"}]}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().as_deref(), Some("Hi!"));
        assert_eq!(parse_sse_line("").unwrap(), None);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), None);
        assert!(parse_sse_line(r#"data: {"error":{"message":"boom"}}"#).is_err());
    }

    #[tokio::test]
    async fn listing_strips_prefix_and_sorts() {
        let api = Arc::new(FakeApi::listing(&["models/gemini-pro", "models/gemini-2.0-flash"]));
        let provider = GeminiProvider::with_api(api.clone());
        assert_eq!(
            provider.list_models(false).await.unwrap(),
            vec!["gemini-2.0-flash", "gemini-pro"]
        );
        provider.list_models(false).await.unwrap();
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);
        provider.list_models(true).await.unwrap();
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_listing_falls_back_to_reference_table() {
        let provider = GeminiProvider::with_api(Arc::new(FakeApi::default()));
        let models = provider.list_models(false).await.unwrap();
        assert_eq!(models.len(), GEMINI_MODELS_BY_PRICE.len());
        assert_eq!(models[0], "gemini-2.0-flash-lite");
    }

    #[tokio::test]
    async fn unknown_model_fails_before_calling_backend() {
        let api = Arc::new(FakeApi::listing(&["models/gemini-2.0-flash"]));
        let provider = GeminiProvider::with_api(api.clone());
        let err = provider
            .generate(&[Message::user("hi")], Some("gpt-4"))
            .await
            .unwrap_err();
        match err {
            GatewayError::ModelUnavailable { model, available } => {
                assert_eq!(model, "gpt-4");
                assert_eq!(available, vec!["gemini-2.0-flash"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let mut stream = provider.stream(vec![Message::user("hi")], Some("gpt-4".into()));
        assert!(matches!(
            stream.next().await,
            Some(Err(GatewayError::ModelUnavailable { .. }))
        ));
        assert_eq!(api.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generate_uses_default_model() {
        let api = Arc::new(FakeApi::default());
        let provider = GeminiProvider::with_api(api.clone());
        let reply = provider
            .generate(&[Message::user("hi"), Message::assistant("yo")], None)
            .await
            .unwrap();
        assert_eq!(reply, "reply from gemini-2.0-flash");
        let request = api.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.contents[1].role.as_deref(), Some("model"));
    }

    #[tokio::test]
    async fn stream_skips_empty_chunks_and_wraps_errors() {
        let provider = GeminiProvider::with_api(Arc::new(FakeApi::default()));
        let items: Vec<_> = provider
            .stream(vec![Message::user("hi")], None)
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_deref().unwrap(), "Hel");
        assert_eq!(items[1].as_deref().unwrap(), "lo");
        let err = items[2].as_ref().unwrap_err().to_string();
        assert!(err.starts_with("Gemini API stream error: "), "{err}");
        assert!(err.contains("quota exceeded"));
    }

    #[test]
    fn missing_key_is_an_init_failure() {
        let client = reqwest::Client::new();
        assert!(GeminiProvider::from_key(client.clone(), None, "http://x").is_err());
        assert!(GeminiProvider::from_key(client.clone(), Some(""), "http://x").is_err());
        assert!(GeminiProvider::from_key(client, Some("secret-key"), "http://x").is_ok());
    }
}
