pub mod auth;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod gemini;
pub mod llm;
pub mod models;
pub mod ollama;
pub mod registry;
pub mod server;
pub mod stream;
pub mod telemetry;

/**
 * \brief Common imports for embedding the gateway.
 */
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{GatewayError, Result};
    pub use crate::llm::{ChatProvider, ChatStream};
    pub use crate::models::{ChatRequest, ChatResponse, Message, Role};
    pub use crate::registry::ProviderRegistry;
    pub use crate::stream::{translate, StreamEvent};
}
