//! The serial worker loop: the only caller of the inference engine.

use std::sync::Arc;

use log::{debug, warn};

use crate::core::queue::{InboundQueue, OutboundRegistry};
use crate::core::task::{
    CompletedTask, GenerationConfig, GenerationDefaults, RequestPayload, ResponsePayload, Task,
};
use crate::core::traits::InferenceEngine;
use crate::error::EngineError;

/// Runs for the process lifetime. Takes tasks in submission order, resolves
/// their generation parameters against the server defaults, drives the
/// engine, and publishes each result under the id it was submitted with.
///
/// The engine value is moved in here, so nothing else can reach it.
pub async fn worker_loop(
    queue: Arc<InboundQueue>,
    registry: Arc<OutboundRegistry>,
    mut engine: Box<dyn InferenceEngine>,
    defaults: GenerationDefaults,
) {
    loop {
        let task = queue.take().await;
        debug!("task {} dequeued", task.id);

        // An engine failure fails this task, not the loop.
        let result = execute(engine.as_mut(), &defaults, &task).await;
        if let Err(err) = &result {
            warn!("task {} failed: {err}", task.id);
        }
        engine.reset_stats();

        registry.publish(CompletedTask { id: task.id, result }).await;
        debug!("task {} published", task.id);
    }
}

async fn execute(
    engine: &mut dyn InferenceEngine,
    defaults: &GenerationDefaults,
    task: &Task,
) -> Result<ResponsePayload, EngineError> {
    match &task.payload {
        RequestPayload::Completion { prompt, overrides } => {
            let config = GenerationConfig::resolve(overrides, defaults);
            let text = engine.generate(prompt, &config).await?;
            Ok(ResponsePayload::Text(text))
        }
        RequestPayload::ChatCompletion { messages, overrides } => {
            let config = GenerationConfig::resolve(overrides, defaults);
            let message = engine.chat(messages, &config).await?;
            Ok(ResponsePayload::Message(message))
        }
    }
}
