use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use axum::{
    extract::{rejection::JsonRejection, Query, Request, State},
    http::{header, HeaderName, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{any, get, post},
    Extension, Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::{
    cors::CorsLayer,
    services::{ServeDir, ServeFile},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthError, Authorizer, Identity};
use crate::config::Config;
use crate::conversation;
use crate::error::{GatewayError, Result};
use crate::llm::{self, ChatProvider};
use crate::models::{AllModels, ChatRequest, ChatResponse, Message, ModelsResponse, ProviderModels};
use crate::registry::ProviderRegistry;
use crate::stream::translate;

pub const SERVICE_NAME: &str = "ai-service";

/**
 * \brief Shared, read-only handler state.
 */
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub authorizer: Arc<dyn Authorizer>,
    pub anonymous_access: bool,
}

impl AppState {
    pub fn new(
        registry: ProviderRegistry,
        authorizer: Arc<dyn Authorizer>,
        anonymous_access: bool,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            authorizer,
            anonymous_access,
        }
    }
}

/**
 * \brief Start the HTTP service with providers and auth built from `config`.
 */
pub async fn run(config: &Config) -> AnyResult<()> {
    let client = llm::http_client()?;
    let registry = ProviderRegistry::from_config(config, client.clone());
    let authorizer = auth::from_config(config, client)?;
    let state = AppState::new(registry, authorizer, config.enable_anonymous_access);
    let app = router(state, config.ui_dir.as_deref());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief Route table. Non-API paths are served from `ui_dir` when it exists,
 * with `index.html` as the SPA fallback.
 */
pub fn router(state: AppState, ui_dir: Option<&Path>) -> Router {
    let protected = Router::new()
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/chat/stream", post(chat_stream))
        .route("/api/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let anonymous = Router::new()
        .route("/api/v1/chat/anonymous", post(chat_anonymous))
        .route("/api/v1/chat/stream/anonymous", post(chat_stream_anonymous))
        .route("/api/v1/models/anonymous", get(list_models_anonymous))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_anonymous_enabled,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(detailed_health))
        .route("/api", get(api_info))
        .route("/api/{*path}", any(not_found));

    let app = Router::new().merge(protected).merge(anonymous).merge(public);
    let app = match ui_dir.filter(|dir| dir.is_dir()) {
        Some(dir) => {
            info!(ui_dir = %dir.display(), "serving static UI");
            app.fallback_service(
                ServeDir::new(dir)
                    .append_index_html_on_directories(true)
                    .fallback(ServeFile::new(dir.join("index.html"))),
            )
        }
        None => app.fallback(not_found),
    };

    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), "request failed: {self}");
        } else {
            warn!(status = status.as_u16(), "request rejected: {self}");
        }
        let mut body = json!({
            "error": self.title(),
            "message": self.to_string(),
        });
        if let GatewayError::ResourceExhausted { available, .. } = &self {
            body["suggestion"] = json!("Try using a smaller model");
            body["available_models"] = json!(available);
        }
        (status, Json(body)).into_response()
    }
}

fn json_error(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": error, "message": message.into() }))).into_response()
}

fn read_body(payload: std::result::Result<Json<ChatRequest>, JsonRejection>) -> Result<ChatRequest> {
    payload
        .map(|Json(request)| request)
        .map_err(|rejection| GatewayError::invalid(rejection.body_text()))
}

async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let headers = req.headers();
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credentials = match auth::extract_credentials(
        api_key,
        authorization,
        state.authorizer.accepts_tokens(),
    ) {
        Ok(credentials) => credentials,
        Err(e) => return auth_failure(e),
    };

    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    match state.authorizer.authorize(&credentials, &path, &method).await {
        Ok(identity) => {
            debug!(identity = ?identity.id, auth_type = ?identity.auth_type, %path, "authenticated");
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => auth_failure(e),
    }
}

fn auth_failure(err: AuthError) -> Response {
    match err {
        AuthError::Missing(message) => {
            json_error(StatusCode::UNAUTHORIZED, "Authentication required", message)
        }
        AuthError::Denied(message) | AuthError::Unavailable(message) => {
            warn!("authentication failed: {message}");
            json_error(StatusCode::UNAUTHORIZED, "Authentication failed", message)
        }
    }
}

async fn require_anonymous_enabled(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.anonymous_access {
        return json_error(
            StatusCode::FORBIDDEN,
            "Anonymous access disabled",
            "This endpoint is not available. Use the authenticated endpoint instead.",
        );
    }
    next.run(req).await
}

/**
 * \brief Normalize, pick the provider, and pin the model before any backend call.
 */
async fn prepare(
    registry: &ProviderRegistry,
    request: &ChatRequest,
) -> Result<(Arc<dyn ChatProvider>, String, Vec<Message>)> {
    let messages = conversation::normalize(request)?;
    let provider = registry.resolve(request.provider.as_deref())?;
    let model = provider.resolve_model(request.model.as_deref()).await;
    Ok((provider, model, messages))
}

async fn complete(
    state: &AppState,
    request: ChatRequest,
    identity: Option<&Identity>,
) -> Result<Json<ChatResponse>> {
    let (provider, model, messages) = prepare(&state.registry, &request).await?;
    info!(
        provider = provider.name(),
        model = %model,
        messages = messages.len(),
        identity = ?identity.and_then(|i| i.id.as_deref()),
        "chat request"
    );
    let response = provider.generate(&messages, Some(&model)).await?;
    Ok(Json(ChatResponse {
        response,
        model,
        provider: provider.name().to_string(),
    }))
}

async fn open_stream(
    state: &AppState,
    request: ChatRequest,
    identity: Option<&Identity>,
) -> Result<Response> {
    let (provider, model, messages) = prepare(&state.registry, &request).await?;
    info!(
        provider = provider.name(),
        model = %model,
        messages = messages.len(),
        identity = ?identity.and_then(|i| i.id.as_deref()),
        "chat stream request"
    );
    let events = translate(provider, model, messages)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events).keep_alive(KeepAlive::default()),
    )
        .into_response())
}

async fn chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>> {
    complete(&state, read_body(payload)?, Some(&identity)).await
}

async fn chat_anonymous(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>> {
    complete(&state, read_body(payload)?, None).await
}

async fn chat_stream(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response> {
    open_stream(&state, read_body(payload)?, Some(&identity)).await
}

async fn chat_stream_anonymous(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response> {
    open_stream(&state, read_body(payload)?, None).await
}

#[derive(Debug, Default, Deserialize)]
struct ModelsQuery {
    provider: Option<String>,
    refresh: Option<String>,
}

impl ModelsQuery {
    fn force_refresh(&self) -> bool {
        self.refresh
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("true"))
    }
}

async fn provider_models(
    provider: &dyn ChatProvider,
    force_refresh: bool,
) -> Result<ProviderModels> {
    let models = provider.list_models(force_refresh).await?;
    Ok(ProviderModels {
        provider: provider.name().to_string(),
        models,
        default: Some(provider.default_model().await),
    })
}

async fn models_response(state: &AppState, query: ModelsQuery) -> Result<Json<ModelsResponse>> {
    let force_refresh = query.force_refresh();
    if let Some(name) = query.provider.as_deref().filter(|p| !p.is_empty()) {
        let provider = state.registry.resolve(Some(name))?;
        let listing = provider_models(provider.as_ref(), force_refresh).await?;
        return Ok(Json(ModelsResponse::Single(listing)));
    }

    let mut providers = Vec::new();
    for name in state.registry.list_available() {
        let provider = state.registry.resolve(Some(&name))?;
        match provider_models(provider.as_ref(), force_refresh).await {
            Ok(listing) => providers.push(listing),
            Err(e) => {
                warn!(provider = %name, "failed to list models: {e}");
                providers.push(ProviderModels {
                    provider: name,
                    models: Vec::new(),
                    default: None,
                });
            }
        }
    }
    Ok(Json(ModelsResponse::All(AllModels { providers })))
}

async fn list_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<ModelsResponse>> {
    models_response(&state, query).await
}

async fn list_models_anonymous(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<ModelsResponse>> {
    models_response(&state, query).await
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/**
 * \brief Per-provider reachability; `degraded` when any provider fails to list.
 */
async fn detailed_health(State(state): State<AppState>) -> Json<Value> {
    let mut providers = Map::new();
    let mut all_healthy = true;
    for name in state.registry.list_available() {
        let status = match state.registry.resolve(Some(&name)) {
            Ok(provider) => match provider.list_models(false).await {
                Ok(models) => json!({
                    "available": true,
                    "models_count": models.len(),
                    "default_model": provider.default_model().await,
                }),
                Err(e) => {
                    all_healthy = false;
                    json!({ "available": false, "error": e.to_string() })
                }
            },
            Err(e) => {
                all_healthy = false;
                json!({ "available": false, "error": e.to_string() })
            }
        };
        providers.insert(name, status);
    }
    let status = if all_healthy { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "service": SERVICE_NAME,
        "providers": providers,
    }))
}

async fn api_info() -> Json<Value> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "chat": "/api/v1/chat",
            "chat_stream": "/api/v1/chat/stream",
            "models": "/api/v1/models",
            "health": "/health",
            "detailed_health": "/api/v1/health",
        }
    }))
}

async fn not_found() -> Response {
    json_error(
        StatusCode::NOT_FOUND,
        "Not found",
        "The requested resource was not found",
    )
}
