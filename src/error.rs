//! Error types shared across the server.

use thiserror::Error;

/// Failure of a single inference invocation.
///
/// An `EngineError` belongs to exactly one task: it is published under that
/// task's id and reported to the caller that submitted it. The worker loop
/// carries on with the next task.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The prompt does not fit the context window even after truncation.
    #[error("prompt of {prompt_tokens} tokens exceeds the {max_context_length}-token context window")]
    PromptTooLong {
        prompt_tokens: usize,
        max_context_length: usize,
    },

    /// The model's chat template could not be applied to the messages.
    #[error("chat template error: {0}")]
    Template(String),

    /// The inference backend itself failed.
    #[error("inference backend error: {0}")]
    Backend(String),
}
