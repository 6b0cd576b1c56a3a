//! Worker loop behavior, driven with deterministic stub engines.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_local_llm_server::core::queue::{InboundQueue, OutboundRegistry};
use tokio_local_llm_server::core::task::{
    ChatMessage, GenerationConfig, GenerationDefaults, RequestPayload, ResponsePayload, Role,
    SamplingOverrides,
};
use tokio_local_llm_server::core::traits::InferenceEngine;
use tokio_local_llm_server::core::worker::worker_loop;
use tokio_local_llm_server::error::EngineError;

fn defaults() -> GenerationDefaults {
    GenerationDefaults {
        max_length: 2048,
        max_context_length: 512,
        top_k: 0,
        top_p: 0.7,
        temperature: 0.95,
        repeat_penalty: 1.0,
        num_threads: 0,
    }
}

/// Records every invocation and produces deterministic output. Prompts
/// containing "boom" fail, everything else echoes.
struct EchoEngine {
    calls: mpsc::UnboundedSender<(String, GenerationConfig)>,
    resets: Arc<AtomicUsize>,
}

impl EchoEngine {
    fn start(
        queue: &Arc<InboundQueue>,
        registry: &Arc<OutboundRegistry>,
    ) -> (
        mpsc::UnboundedReceiver<(String, GenerationConfig)>,
        Arc<AtomicUsize>,
    ) {
        let (calls, seen) = mpsc::unbounded_channel();
        let resets = Arc::new(AtomicUsize::new(0));
        let engine = EchoEngine {
            calls,
            resets: resets.clone(),
        };
        tokio::spawn(worker_loop(
            queue.clone(),
            registry.clone(),
            Box::new(engine),
            defaults(),
        ));
        (seen, resets)
    }
}

#[async_trait]
impl InferenceEngine for EchoEngine {
    async fn generate(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, EngineError> {
        self.calls.send((prompt.to_string(), config.clone())).unwrap();
        if prompt.contains("boom") {
            return Err(EngineError::Backend("synthetic failure".to_string()));
        }
        Ok(format!("echo:{prompt}"))
    }

    async fn chat(
        &mut self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ChatMessage, EngineError> {
        let transcript = messages
            .iter()
            .map(|m| format!("{}:{}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("|");
        self.calls.send((transcript, config.clone())).unwrap();

        Ok(ChatMessage {
            role: Role::Assistant,
            content: format!("reply:{}", messages.last().unwrap().content),
        })
    }

    fn reset_stats(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

fn completion(prompt: &str, overrides: SamplingOverrides) -> RequestPayload {
    RequestPayload::Completion {
        prompt: prompt.to_string(),
        overrides,
    }
}

#[tokio::test]
async fn test_completion_with_defaults_resolves_exact_values() {
    // Scenario: {prompt: "hello"} with server defaults top_k=0, top_p=0.7,
    // temp=0.95 reaches the engine with exactly those values.
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (mut seen, _) = EchoEngine::start(&queue, &registry);

    let id = queue
        .submit(completion("hello", SamplingOverrides::default()))
        .await;
    let result = registry.retrieve(id).await.unwrap();
    assert_eq!(result, ResponsePayload::Text("echo:hello".to_string()));

    let (prompt, config) = seen.recv().await.unwrap();
    assert_eq!(prompt, "hello");
    assert_eq!(config.top_k, 0);
    assert_eq!(config.top_p, 0.7);
    assert_eq!(config.temperature, 0.95);
    assert_eq!(config.max_length, 2048);
    assert!(config.do_sample);
}

#[tokio::test]
async fn test_zero_temperature_request_runs_greedy() {
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (mut seen, _) = EchoEngine::start(&queue, &registry);

    let overrides = SamplingOverrides {
        temperature: Some(0.0),
        ..Default::default()
    };
    let id = queue.submit(completion("x", overrides)).await;
    registry.retrieve(id).await.unwrap();

    let (_, config) = seen.recv().await.unwrap();
    assert!(!config.do_sample);
}

#[tokio::test]
async fn test_overrides_replace_defaults() {
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (mut seen, _) = EchoEngine::start(&queue, &registry);

    let overrides = SamplingOverrides {
        max_tokens: Some(64),
        top_k: Some(40),
        temperature: Some(0.5),
        top_p: Some(0.9),
    };
    let id = queue.submit(completion("x", overrides)).await;
    registry.retrieve(id).await.unwrap();

    let (_, config) = seen.recv().await.unwrap();
    assert_eq!(config.max_length, 64);
    assert_eq!(config.top_k, 40);
    assert_eq!(config.temperature, 0.5);
    assert_eq!(config.top_p, 0.9);
}

#[tokio::test]
async fn test_chat_messages_reach_the_engine_in_order() {
    // Scenario: system + user messages arrive at the chat entry point in
    // their original order; the response embeds the single output message.
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (mut seen, _) = EchoEngine::start(&queue, &registry);

    let id = queue
        .submit(RequestPayload::ChatCompletion {
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: "be brief".to_string(),
                },
                ChatMessage {
                    role: Role::User,
                    content: "hi".to_string(),
                },
            ],
            overrides: SamplingOverrides::default(),
        })
        .await;

    let result = registry.retrieve(id).await.unwrap();
    let message = result.into_message();
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.content, "reply:hi");

    let (transcript, _) = seen.recv().await.unwrap();
    assert_eq!(transcript, "system:be brief|user:hi");
}

#[tokio::test]
async fn test_engine_error_fails_one_task_not_the_loop() {
    // Scenario: an engine error on one task does not prevent a later task
    // from completing.
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (_seen, _) = EchoEngine::start(&queue, &registry);

    let failing = queue
        .submit(completion("boom", SamplingOverrides::default()))
        .await;
    let ok = queue
        .submit(completion("fine", SamplingOverrides::default()))
        .await;

    let err = registry.retrieve(failing).await.unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));

    let result = registry.retrieve(ok).await.unwrap();
    assert_eq!(result, ResponsePayload::Text("echo:fine".to_string()));
}

#[tokio::test]
async fn test_stats_reset_after_every_task_including_failures() {
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (_seen, resets) = EchoEngine::start(&queue, &registry);

    let a = queue
        .submit(completion("boom", SamplingOverrides::default()))
        .await;
    let b = queue
        .submit(completion("ok", SamplingOverrides::default()))
        .await;
    registry.retrieve(a).await.unwrap_err();
    registry.retrieve(b).await.unwrap();

    // The publish happens after the reset, so both are counted by now.
    assert_eq!(resets.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_fifty_concurrent_completions_each_get_their_own_result() {
    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());
    let (_seen, _) = EchoEngine::start(&queue, &registry);

    let callers: Vec<_> = (0..50)
        .map(|i| {
            let queue = queue.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                let prompt = format!("prompt-{i}");
                let id = queue
                    .submit(completion(&prompt, SamplingOverrides::default()))
                    .await;
                // Stagger retrievals relative to worker progress a little.
                if i % 7 == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let result = registry.retrieve(id).await.unwrap();
                (prompt, result.into_text())
            })
        })
        .collect();

    for caller in join_all(callers).await {
        let (prompt, text) = caller.unwrap();
        assert_eq!(text, format!("echo:{prompt}"));
    }
}
