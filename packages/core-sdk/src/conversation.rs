use crate::error::{GatewayError, Result};
use crate::models::{ChatRequest, Message};

/** \brief Context window applied when the request does not set one. */
pub const DEFAULT_CONTEXT_WINDOW: usize = 20;
pub const MIN_CONTEXT_WINDOW: i64 = 1;
pub const MAX_CONTEXT_WINDOW: i64 = 100;

/**
 * \brief Check the request shape before any provider is touched.
 */
pub fn validate(request: &ChatRequest) -> Result<()> {
    if let Some(window) = request.max_context_messages {
        if !(MIN_CONTEXT_WINDOW..=MAX_CONTEXT_WINDOW).contains(&window) {
            return Err(GatewayError::invalid(format!(
                "max_context_messages must be between {MIN_CONTEXT_WINDOW} and {MAX_CONTEXT_WINDOW}, got {window}"
            )));
        }
    }

    let has_prompt = request.prompt.as_deref().is_some_and(|p| !p.is_empty());
    let has_messages = request.messages.as_ref().is_some_and(|m| !m.is_empty());
    match (has_prompt, has_messages) {
        (false, false) => {
            return Err(GatewayError::invalid(
                "Either 'prompt' or 'messages' must be provided",
            ))
        }
        (true, true) => {
            return Err(GatewayError::invalid(
                "Provide either 'prompt' or 'messages', not both",
            ))
        }
        _ => {}
    }

    if let Some(messages) = &request.messages {
        if let Some(idx) = messages.iter().position(|m| m.content.is_empty()) {
            return Err(GatewayError::invalid(format!(
                "messages[{idx}].content must not be empty"
            )));
        }
    }
    Ok(())
}

/**
 * \brief Turn a request into the ordered message list handed to adapters.
 *
 * History is trimmed to the newest `max_context_messages` entries; a lone
 * prompt becomes a single user message.
 */
pub fn normalize(request: &ChatRequest) -> Result<Vec<Message>> {
    validate(request)?;

    if let Some(messages) = request.messages.as_ref().filter(|m| !m.is_empty()) {
        let window = request
            .max_context_messages
            .map(|w| w as usize)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let start = messages.len().saturating_sub(window);
        return Ok(messages[start..].to_vec());
    }

    match request.prompt.as_deref() {
        Some(prompt) if !prompt.is_empty() => Ok(vec![Message::user(prompt)]),
        _ => Err(GatewayError::invalid(
            "Either 'prompt' or 'messages' must be provided",
        )),
    }
}
