//! Completion endpoints
//!
//! Each handler turns the wire request into a task payload, submits it,
//! suspends until the matching result is published, and serializes the
//! response.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use log::debug;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::core::task::RequestPayload;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/completions", post(completions))
        .route("/chat/completions", post(chat_completions))
}

/// Plain-text liveness probe, mounted at the server root.
pub async fn index() -> &'static str {
    "hello world!"
}

async fn completions(
    State(state): State<AppState>,
    Json(request): Json<schemas::CompletionRequest>,
) -> Result<Json<schemas::CompletionResponse>, ApiError> {
    if request.prompt.is_empty() {
        return Err(ApiError::Validation("prompt must not be empty"));
    }

    let payload = RequestPayload::Completion {
        prompt: request.prompt,
        overrides: request.sampling.into(),
    };

    let id = state.queue.submit(payload).await;
    debug!("completion task {id} submitted");
    let result = state.registry.retrieve(id).await?;

    Ok(Json(schemas::CompletionResponse {
        id: Uuid::new_v4().to_string(),
        choices: vec![schemas::CompletionChoice {
            text: result.into_text(),
        }],
    }))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<schemas::ChatCompletionRequest>,
) -> Result<Json<schemas::ChatCompletionResponse>, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty"));
    }

    let payload = RequestPayload::ChatCompletion {
        messages: request.messages.into_iter().map(Into::into).collect(),
        overrides: request.sampling.into(),
    };

    let id = state.queue.submit(payload).await;
    debug!("chat completion task {id} submitted");
    let result = state.registry.retrieve(id).await?;

    Ok(Json(schemas::ChatCompletionResponse {
        id: Uuid::new_v4().to_string(),
        choices: vec![schemas::ChatChoice {
            message: result.into_message().into(),
        }],
    }))
}

pub mod schemas {
    use serde::{Deserialize, Serialize};

    use crate::core::task;
    use crate::core::task::SamplingOverrides;

    /// Optional sampling fields shared by both request bodies. `n` selects
    /// top-k.
    #[derive(Deserialize, Debug, Default)]
    pub struct SamplingParams {
        pub max_tokens: Option<usize>,
        pub n: Option<usize>,
        pub temperature: Option<f32>,
        pub top_p: Option<f32>,
    }

    impl From<SamplingParams> for SamplingOverrides {
        fn from(params: SamplingParams) -> Self {
            SamplingOverrides {
                max_tokens: params.max_tokens,
                top_k: params.n,
                temperature: params.temperature,
                top_p: params.top_p,
            }
        }
    }

    #[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum Role {
        System,
        User,
        Assistant,
    }

    impl From<Role> for task::Role {
        fn from(role: Role) -> Self {
            match role {
                Role::System => task::Role::System,
                Role::User => task::Role::User,
                Role::Assistant => task::Role::Assistant,
            }
        }
    }

    impl From<task::Role> for Role {
        fn from(role: task::Role) -> Self {
            match role {
                task::Role::System => Role::System,
                task::Role::User => Role::User,
                task::Role::Assistant => Role::Assistant,
            }
        }
    }

    #[derive(Serialize, Deserialize, Debug, Clone)]
    pub struct ChatMessage {
        pub role: Role,
        pub content: String,
    }

    impl From<ChatMessage> for task::ChatMessage {
        fn from(message: ChatMessage) -> Self {
            task::ChatMessage {
                role: message.role.into(),
                content: message.content,
            }
        }
    }

    impl From<task::ChatMessage> for ChatMessage {
        fn from(message: task::ChatMessage) -> Self {
            ChatMessage {
                role: message.role.into(),
                content: message.content,
            }
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct CompletionRequest {
        pub prompt: String,
        #[serde(flatten)]
        pub sampling: SamplingParams,
    }

    #[derive(Serialize, Debug)]
    pub struct CompletionResponse {
        pub id: String,
        pub choices: Vec<CompletionChoice>,
    }

    #[derive(Serialize, Debug)]
    pub struct CompletionChoice {
        pub text: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct ChatCompletionRequest {
        pub messages: Vec<ChatMessage>,
        #[serde(flatten)]
        pub sampling: SamplingParams,
    }

    #[derive(Serialize, Debug)]
    pub struct ChatCompletionResponse {
        pub id: String,
        pub choices: Vec<ChatChoice>,
    }

    #[derive(Serialize, Debug)]
    pub struct ChatChoice {
        pub message: ChatMessage,
    }
}
