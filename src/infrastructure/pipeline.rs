//! wgml-backed inference pipeline.
//!
//! Owns the GPU transformer, tokenizer and the model's chat template. One
//! pipeline exists per process and only the worker loop drives it; nothing
//! here is safe for concurrent use.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use log::{debug, info};
use nalgebra::DVector;
use tokio::fs::File;
use wgcore::gpu::GpuInstance;
use wgcore::kernel::CommandEncoderExt;
use wgcore::shapes::ViewShapeBuffers;
use wgml::gguf::Gguf;
use wgml::models::gpt2::Gpt2Tokenizer;
use wgml::models::llama2::cpu::Llama2Config;
use wgml::models::llama2::{Llama2, Llama2State, Llama2Weights, LlamaModelType};
use wgml::models::sampler::Sampler;

use crate::core::task::{ChatMessage, GenerationConfig, Role};
use crate::core::traits::InferenceEngine;
use crate::error::EngineError;

const CHAT_TEMPLATE: &str = "chat";

/// Token and wall-clock counters for the request currently being served.
#[derive(Debug, Default, Clone)]
pub struct PerfStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prefill: Duration,
    pub generation: Duration,
}

impl PerfStats {
    fn reset(&mut self) {
        *self = PerfStats::default();
    }

    fn log(&self) {
        info!(
            "prefill: {} tokens in {:.2?} ({:.2} tok/s), generation: {} tokens in {:.2?} ({:.2} tok/s)",
            self.prompt_tokens,
            self.prefill,
            self.prompt_tokens as f32 / self.prefill.as_secs_f32(),
            self.generated_tokens,
            self.generation,
            self.generated_tokens as f32 / self.generation.as_secs_f32(),
        );
    }
}

pub struct LlamaPipeline {
    gpu: GpuInstance,
    transformer: Llama2,
    config: Llama2Config,
    weights: Llama2Weights,
    state: Llama2State,
    tokenizer: Gpt2Tokenizer,
    chat_templates: minijinja::Environment<'static>,
    view_shapes: ViewShapeBuffers,
    stats: PerfStats,
}

impl LlamaPipeline {
    /// Loads the GGUF file, uploads the weights to the GPU and prepares the
    /// tokenizer and chat template. `context_size` caps the sequence length
    /// (and with it the KV cache) below what the model supports.
    pub async fn load(model_path: &Path, context_size: usize) -> anyhow::Result<Self> {
        let gguf_file = File::open(model_path)
            .await
            .with_context(|| format!("failed to open model file {}", model_path.display()))?;
        let gguf_start_time = Instant::now();
        let gguf_mmap =
            unsafe { memmap2::Mmap::map(&gguf_file) }.context("failed to map model file")?;
        let gguf = Gguf::from_bytes(&gguf_mmap[..])
            .map_err(|err| anyhow!("failed to parse GGUF: {err:?}"))?;
        info!(
            "GGUF model loaded in {:.2} seconds.",
            gguf_start_time.elapsed().as_secs_f32()
        );

        let gpu = GpuInstance::new()
            .await
            .map_err(|err| anyhow!("failed to create GPU instance: {err:?}"))?;
        let device = gpu.device();
        info!("GPU device features: {:?}", device.features());

        let chat_template_str = gguf
            .metadata
            .get("tokenizer.chat_template")
            .map(|v| v.as_string().to_owned());

        let transformer = Llama2::new(device, LlamaModelType::Llama)
            .map_err(|err| anyhow!("failed to create transformer: {err:?}"))?;

        let mut config = Llama2Config::from_gguf(&gguf);
        config.seq_len = config.seq_len.min(context_size);
        let weights = Llama2Weights::from_gguf(device, &config, &gguf);
        let tokenizer = Gpt2Tokenizer::from_gguf(&gguf);
        let state = Llama2State::new(device, &config);

        let mut chat_templates = minijinja::Environment::new();
        chat_templates.set_trim_blocks(true);
        chat_templates.add_global("bos_token", tokenizer.bos_str());
        chat_templates.add_global("eos_token", tokenizer.eos_str());
        chat_templates.add_global("add_generation_prompt", true);
        if let Some(source) = chat_template_str {
            chat_templates
                .add_template_owned(CHAT_TEMPLATE, source)
                .context("failed to compile the model's chat template")?;
        }

        Ok(LlamaPipeline {
            gpu,
            transformer,
            config,
            weights,
            state,
            tokenizer,
            chat_templates,
            view_shapes: ViewShapeBuffers::new(),
            stats: PerfStats::default(),
        })
    }

    fn render_chat_prompt(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        let template = self
            .chat_templates
            .get_template(CHAT_TEMPLATE)
            .map_err(|err| EngineError::Template(err.to_string()))?;

        let messages: Vec<minijinja::Value> = messages
            .iter()
            .map(|m| {
                minijinja::context! {
                    role => m.role.as_str(),
                    content => m.content,
                }
            })
            .collect();

        template
            .render(minijinja::context! { messages => messages })
            .map_err(|err| EngineError::Template(err.to_string()))
    }

    /// The prefill/decode loop for an already rendered prompt.
    async fn run(
        &mut self,
        prompt: &str,
        gen_config: &GenerationConfig,
    ) -> Result<String, EngineError> {
        let mut prompt_tokens = self.tokenizer.encode(prompt);
        if prompt_tokens.is_empty() {
            return Err(EngineError::Backend("prompt tokenized to nothing".to_string()));
        }

        // Keep the tail when the prompt exceeds the context window.
        let max_context = gen_config.max_context_length.min(self.config.seq_len);
        if prompt_tokens.len() > max_context {
            let excess = prompt_tokens.len() - max_context;
            prompt_tokens.drain(..excess);
        }
        if prompt_tokens.len() >= self.config.seq_len {
            return Err(EngineError::PromptTooLong {
                prompt_tokens: prompt_tokens.len(),
                max_context_length: max_context,
            });
        }

        // Total sequence-length cap, prompt included.
        let max_length = gen_config.max_length.min(self.config.seq_len);

        self.stats.prompt_tokens = prompt_tokens.len();

        let mut token = prompt_tokens[0];
        let mut logits = DVector::zeros(self.config.vocab_size);
        self.view_shapes.clear_tmp();

        let mut output = String::new();
        let mut generated = Vec::new();

        let inference_start = Instant::now();
        let mut prefill_end = Instant::now();

        for pos in 0..max_length {
            let is_prefill = pos < prompt_tokens.len() - 1;

            let (rope_config, rms_norm_config, attn_params) =
                self.config.derived_configs(pos as u32);

            let mut encoder = self.gpu.device().create_command_encoder(&Default::default());
            self.gpu.queue().write_buffer(
                self.state.rope_config().buffer(),
                0,
                bytemuck::cast_slice(&[rope_config]),
            );
            self.gpu.queue().write_buffer(
                self.state.rms_norm_config().buffer(),
                0,
                bytemuck::cast_slice(&[rms_norm_config]),
            );
            self.gpu.queue().write_buffer(
                self.state.attn_params().buffer(),
                0,
                bytemuck::cast_slice(&[attn_params]),
            );

            if token < (self.config.vocab_size / 2) {
                self.state
                    .x
                    .copy_from_view(&mut encoder, self.weights.token_embd.column(token as u32));
            } else {
                self.state.x.copy_from_view(
                    &mut encoder,
                    self.weights
                        .token_embd
                        .column((token - self.config.vocab_size / 2) as u32),
                );
            }

            if pos % 50 == 0 {
                if is_prefill {
                    debug!("prefilling token {pos}");
                } else {
                    debug!("generating token {pos}");
                }
            }

            let mut compute_pass = encoder.compute_pass("transformer", None);
            self.transformer.dispatch(
                self.gpu.device(),
                &self.view_shapes,
                self.gpu.queue(),
                &mut compute_pass,
                &self.state,
                &self.weights,
                &self.config,
                &attn_params,
                pos as u32,
            );
            drop(compute_pass);

            if !is_prefill {
                self.state
                    .logits_readback()
                    .copy_from(&mut encoder, self.state.logits());

                self.gpu.queue().submit(Some(encoder.finish()));

                self.state
                    .logits_readback()
                    .read_to(self.gpu.device(), logits.as_mut_slice())
                    .await
                    .map_err(|err| {
                        EngineError::Backend(format!("logits readback failed: {err:?}"))
                    })?;
            } else {
                self.gpu.queue().submit(Some(encoder.finish()));
            }

            if pos + 1 >= prompt_tokens.len() {
                let next_token = pick_next_token(&mut logits, &generated, gen_config);

                if next_token == self.tokenizer.eos() {
                    break;
                }
                output.push_str(&self.tokenizer.decode(&[next_token as u32]));
                generated.push(next_token);
                token = next_token;
            } else {
                token = prompt_tokens[pos + 1];
                prefill_end = Instant::now();
            }
        }

        self.stats.generated_tokens = generated.len();
        self.stats.prefill = prefill_end - inference_start;
        self.stats.generation = inference_start.elapsed() - self.stats.prefill;
        self.stats.log();

        Ok(output)
    }
}

#[async_trait]
impl InferenceEngine for LlamaPipeline {
    async fn generate(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String, EngineError> {
        self.run(prompt, config).await
    }

    async fn chat(
        &mut self,
        messages: &[ChatMessage],
        config: &GenerationConfig,
    ) -> Result<ChatMessage, EngineError> {
        let prompt = self.render_chat_prompt(messages)?;
        let content = self.run(&prompt, config).await?;

        Ok(ChatMessage {
            role: Role::Assistant,
            content,
        })
    }

    fn reset_stats(&mut self) {
        self.stats.reset();
    }
}

/// Picks the next token from the logits per the resolved config: greedy
/// argmax without sampling, otherwise repetition penalty + top-k filter +
/// temperature/top-p sampling.
fn pick_next_token(
    logits: &mut DVector<f32>,
    recent: &[usize],
    gen_config: &GenerationConfig,
) -> usize {
    apply_repeat_penalty(logits, recent, gen_config.repeat_penalty);

    if !gen_config.do_sample {
        return logits.argmax().0;
    }

    apply_top_k(logits, gen_config.top_k);

    let mut sampler = Sampler::new(logits.len(), gen_config.temperature, gen_config.top_p);
    sampler.sample(logits)
}

/// Penalizes tokens generated earlier in this request. A penalty of 1.0 is
/// a no-op.
fn apply_repeat_penalty(logits: &mut DVector<f32>, recent: &[usize], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    for &t in recent {
        let logit = logits[t];
        logits[t] = if logit < 0.0 {
            logit * penalty
        } else {
            logit / penalty
        };
    }
}

/// Masks every logit below the k-th largest. `k == 0` disables the filter.
fn apply_top_k(logits: &mut DVector<f32>, k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.iter().copied().collect();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let cutoff = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < cutoff {
            *logit = f32::NEG_INFINITY;
        }
    }
}
