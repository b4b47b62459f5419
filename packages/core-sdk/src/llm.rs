use std::pin::Pin;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use futures_util::Stream;

use crate::error::Result;
use crate::models::Message;

/** \brief Connection budget for every backend call. */
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/** \brief Total budget for model listing calls. */
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);
/** \brief Budget for generation: total for synchronous calls, per-read for streams. */
pub const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

/**
 * \brief Lazy, single-pass sequence of text fragments from a backend.
 *
 * Dropping the stream before it is exhausted drops the underlying HTTP
 * response and releases the backend connection.
 */
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/**
 * \brief Uniform contract every backend adapter implements.
 */
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /** \brief Stable lowercase registry key, e.g. "ollama". */
    fn name(&self) -> &str;

    /** \brief Model used when the caller does not name one. */
    async fn default_model(&self) -> String;

    /**
     * \brief Known model identifiers. A non-empty cache is returned as a copy
     * unless `force_refresh` is set, in which case the backend is queried again.
     */
    async fn list_models(&self, force_refresh: bool) -> Result<Vec<String>>;

    /** \brief Non-streaming completion. */
    async fn generate(&self, messages: &[Message], model: Option<&str>) -> Result<String>;

    /**
     * \brief Streaming completion. Nothing is sent to the backend until the
     * stream is first polled; failures surface as stream items.
     */
    fn stream(&self, messages: Vec<Message>, model: Option<String>) -> ChatStream;

    /** \brief Explicit model, else the provider default. */
    async fn resolve_model(&self, model: Option<&str>) -> String {
        match model.filter(|m| !m.is_empty()) {
            Some(explicit) => explicit.to_string(),
            None => self.default_model().await,
        }
    }
}

/**
 * \brief Shared HTTP client for all adapters.
 */
pub fn http_client() -> AnyResult<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(GENERATE_TIMEOUT)
        .build()?;
    Ok(client)
}

/**
 * \brief Splits a byte stream into complete lines across chunk boundaries.
 */
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /** \brief Feed one network chunk, returning every line it completed. */
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = find_newline(&self.buf) {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            lines.push(decode_line(&line));
        }
        lines
    }

    /** \brief Whatever trailing text arrived without a final newline. */
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let line = decode_line(&rest);
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

/**
 * \brief Render an error with all of its sources; reqwest hides the interesting part in the chain.
 */
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let part = inner.to_string();
        if !text.contains(&part) {
            text.push_str(": ");
            text.push_str(&part);
        }
        source = inner.source();
    }
    text
}
