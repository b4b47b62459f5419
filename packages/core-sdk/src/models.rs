use serde::{Deserialize, Serialize};

/**
 * \brief Conversation role; serialized lowercase to match the local backend's native roles.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/**
 * \brief A single conversation message.
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief Role: user/assistant/system */
    pub role: Role,
    /** \brief Non-empty message text */
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/**
 * \brief Inbound chat request. Exactly one of `prompt` (legacy) or `messages` must be set.
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /** \brief Single prompt, legacy shape. */
    #[serde(default)]
    pub prompt: Option<String>,
    /** \brief Conversation history, oldest first. */
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
    /** \brief Explicit model; the provider default applies when absent. */
    #[serde(default)]
    pub model: Option<String>,
    /** \brief Provider name, case-insensitive; the configured default applies when absent. */
    #[serde(default)]
    pub provider: Option<String>,
    /** \brief Context window in messages, 1..=100, default 20. */
    #[serde(default)]
    pub max_context_messages: Option<i64>,
}

impl ChatRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::default()
        }
    }
}

/**
 * \brief Synchronous chat result.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub model: String,
    pub provider: String,
}

/**
 * \brief Model listing for one provider. `default` is null when the listing failed.
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderModels {
    pub provider: String,
    pub models: Vec<String>,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllModels {
    pub providers: Vec<ProviderModels>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelsResponse {
    Single(ProviderModels),
    All(AllModels),
}
