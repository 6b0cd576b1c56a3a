//! The seam between the queue machinery and the inference backend.

use async_trait::async_trait;

use crate::core::task::{ChatMessage, GenerationConfig};
use crate::error::EngineError;

/// A stateful, non-reentrant text generation backend.
///
/// Methods take `&mut self`: the engine carries mutable session and
/// performance state, and exactly one caller (the worker loop, which owns
/// the engine value) may drive it.
#[async_trait]
pub trait InferenceEngine: Send {
    /// Single-shot generation from a raw prompt.
    async fn generate(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, EngineError>;

    /// Chat-style generation. Messages arrive in conversation order and are
    /// handed to the backend unchanged.
    async fn chat(
        &mut self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ChatMessage, EngineError>;

    /// Clears per-request performance counters so successive requests are
    /// measured independently.
    fn reset_stats(&mut self) {}
}
