use std::sync::Arc;

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::llm::ChatProvider;
use crate::models::Message;

/**
 * \brief One frame of a streaming chat response.
 *
 * A well-formed sequence is `Metadata`, any number of `Chunk`s, then exactly
 * one of `Done` or `Error`.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Metadata { model: String, provider: String },
    Chunk { content: String },
    Done,
    Error { message: String },
}

impl StreamEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            error!("failed to encode stream event: {e}");
            r#"{"type":"error"}"#.to_string()
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/**
 * \brief Relay a provider stream as events. Metadata goes out before the
 * backend is contacted; nothing is retried.
 *
 * The backend stream is pulled only as fast as the returned stream is
 * polled, and dropping the returned stream drops the backend stream.
 */
pub fn translate(
    provider: Arc<dyn ChatProvider>,
    model: String,
    messages: Vec<Message>,
) -> impl Stream<Item = StreamEvent> + Send {
    stream! {
        yield StreamEvent::Metadata {
            model: model.clone(),
            provider: provider.name().to_string(),
        };

        let mut chunks = provider.stream(messages, Some(model));
        let mut count = 0usize;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(content) => {
                    count += 1;
                    yield StreamEvent::Chunk { content };
                }
                Err(e) => {
                    warn!(provider = provider.name(), chunks = count, "stream failed: {e}");
                    yield StreamEvent::Error { message: e.to_string() };
                    return;
                }
            }
        }
        debug!(provider = provider.name(), chunks = count, "stream complete");
        yield StreamEvent::Done;
    }
}
