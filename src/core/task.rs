//! The task model: what travels from a network handler to the worker loop
//! and back.

use std::fmt;

use crate::error::EngineError;

/// Identifier assigned to a task when it enters the inbound queue.
///
/// Monotonically increasing and unique for the process lifetime; handlers
/// use it to retrieve their own result from the outbound registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Completion,
    ChatCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Per-request sampling overrides. An absent field means "use the server
/// default".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingOverrides {
    pub max_tokens: Option<usize>,
    pub top_k: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

/// What a handler submits to the inbound queue.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Completion {
        prompt: String,
        overrides: SamplingOverrides,
    },
    ChatCompletion {
        messages: Vec<ChatMessage>,
        overrides: SamplingOverrides,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            RequestPayload::Completion { .. } => TaskKind::Completion,
            RequestPayload::ChatCompletion { .. } => TaskKind::ChatCompletion,
        }
    }

    pub fn overrides(&self) -> &SamplingOverrides {
        match self {
            RequestPayload::Completion { overrides, .. } => overrides,
            RequestPayload::ChatCompletion { overrides, .. } => overrides,
        }
    }
}

/// A queued request. Owned by exactly one component at a time: the queue
/// until the worker takes it, the worker until it publishes the completed
/// counterpart.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: RequestPayload,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// What the worker produces for a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Text(String),
    Message(ChatMessage),
}

impl ResponsePayload {
    /// The response text regardless of variant.
    pub fn into_text(self) -> String {
        match self {
            ResponsePayload::Text(text) => text,
            ResponsePayload::Message(message) => message.content,
        }
    }

    /// The response as a chat message; bare text becomes an assistant
    /// message.
    pub fn into_message(self) -> ChatMessage {
        match self {
            ResponsePayload::Text(content) => ChatMessage {
                role: Role::Assistant,
                content,
            },
            ResponsePayload::Message(message) => message,
        }
    }
}

/// A finished task, placed in the outbound registry under the id the
/// request was submitted with.
#[derive(Debug)]
pub struct CompletedTask {
    pub id: TaskId,
    pub result: Result<ResponsePayload, EngineError>,
}

/// Server-wide generation defaults, fixed at startup.
#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub max_length: usize,
    pub max_context_length: usize,
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub num_threads: usize,
}

/// Parameters for a single engine invocation, overrides already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Max total length, prompt included.
    pub max_length: usize,
    /// Max prompt length; longer prompts are truncated from the front.
    pub max_context_length: usize,
    /// Stochastic sampling vs. greedy decoding.
    pub do_sample: bool,
    /// Top-k filter; 0 disables it.
    pub top_k: usize,
    pub top_p: f32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub num_threads: usize,
}

impl GenerationConfig {
    /// Resolves per-request overrides against the server defaults. Sampling
    /// is stochastic exactly when the effective temperature is positive.
    pub fn resolve(overrides: &SamplingOverrides, defaults: &GenerationDefaults) -> Self {
        let temperature = overrides.temperature.unwrap_or(defaults.temperature);

        GenerationConfig {
            max_length: overrides.max_tokens.unwrap_or(defaults.max_length),
            max_context_length: defaults.max_context_length,
            do_sample: temperature > 0.0,
            top_k: overrides.top_k.unwrap_or(defaults.top_k),
            top_p: overrides.top_p.unwrap_or(defaults.top_p),
            temperature,
            repeat_penalty: defaults.repeat_penalty,
            num_threads: defaults.num_threads,
        }
    }
}
