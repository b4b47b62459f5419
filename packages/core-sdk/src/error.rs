use axum::http::StatusCode;
use thiserror::Error;

/**
 * \brief Error taxonomy shared by the normalizer, registry, adapters and HTTP layer.
 */
#[derive(Debug, Error)]
pub enum GatewayError {
    /** \brief Malformed or missing request fields; always a client error. */
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Provider '{name}' is not available. Available providers: {}", .available.join(", "))]
    ProviderNotFound { name: String, available: Vec<String> },

    #[error("Model {model} is not available. Available models: {}", .available.join(", "))]
    ModelUnavailable { model: String, available: Vec<String> },

    /** \brief The backend ran out of memory or similar; callers should suggest a smaller model. */
    #[error("Memory error loading model '{model}': {message}. Try using a smaller model.{}", models_hint(.available))]
    ResourceExhausted {
        model: String,
        message: String,
        available: Vec<String>,
    },

    /** \brief Any other backend failure: network, malformed response, backend-reported error. */
    #[error("{0}")]
    Provider(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

fn models_hint(available: &[String]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(" Available models: {}", available.join(", "))
    }
}

impl GatewayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::ModelUnavailable { .. } => StatusCode::BAD_REQUEST,
            Self::ProviderNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /** \brief Short category title used as the `error` field of response bodies. */
    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "Invalid request",
            Self::ProviderNotFound { .. } => "Provider not found",
            Self::ModelUnavailable { .. } => "Model unavailable",
            Self::ResourceExhausted { .. } => "Resource exhausted",
            Self::Provider(_) => "Generation failed",
            Self::Unexpected(_) => "Internal server error",
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(format!("{err:#}"))
    }
}
