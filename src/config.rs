//! Process configuration, fixed for the lifetime of the server.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::core::task::GenerationDefaults;

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Serves a local LLM over HTTP and gRPC")]
pub struct ServerConfig {
    /// HTTP listen address.
    #[arg(long, env = "LLM_SERVER_HOST", default_value = "127.0.0.1:8080")]
    pub host: SocketAddr,

    /// gRPC listen address.
    #[arg(long, env = "LLM_SERVER_RPC_HOST", default_value = "127.0.0.1:50051")]
    pub rpc_host: SocketAddr,

    /// GGUF model file.
    #[arg(
        long,
        env = "MODEL_FILE_NAME",
        default_value = "models/Llama-3.2-3B-Instruct-Q4_K_M.gguf"
    )]
    pub model: PathBuf,

    /// Max total length including prompt and output.
    #[arg(long, default_value_t = 2048)]
    pub max_length: usize,

    /// Max context length; longer prompts are truncated from the front.
    #[arg(long, env = "CONTEXT_SIZE", default_value_t = 512)]
    pub max_context_length: usize,

    /// Top-k sampling; 0 disables the top-k filter.
    #[arg(long, default_value_t = 0)]
    pub top_k: usize,

    /// Top-p sampling.
    #[arg(long, default_value_t = 0.7)]
    pub top_p: f32,

    /// Sampling temperature; 0 selects greedy decoding.
    #[arg(long, default_value_t = 0.95)]
    pub temp: f32,

    /// Penalty applied to recently generated tokens.
    #[arg(long, default_value_t = 1.0)]
    pub repeat_penalty: f32,

    /// Inference thread count hint; 0 lets the backend decide.
    #[arg(long, default_value_t = 0)]
    pub threads: usize,
}

impl ServerConfig {
    /// Server-wide generation defaults derived from the flags.
    pub fn generation_defaults(&self) -> GenerationDefaults {
        GenerationDefaults {
            max_length: self.max_length,
            max_context_length: self.max_context_length,
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temp,
            repeat_penalty: self.repeat_penalty,
            num_threads: self.threads,
        }
    }
}
