//! Local LLM completion server using WGPU
//!
//! (c) Softlandia 2025

use std::sync::Arc;

use tokio_local_llm_server::api::{self, AppState};
use tokio_local_llm_server::config::ServerConfig;
use tokio_local_llm_server::core::queue::{InboundQueue, OutboundRegistry};
use tokio_local_llm_server::core::worker::worker_loop;
use tokio_local_llm_server::infrastructure::pipeline::LlamaPipeline;
use tokio_local_llm_server::rpc::BackendService;

use anyhow::Context;
use axum::Router;
use axum::http::Method;
use axum::routing::get;
use clap::Parser;
use log::info;
use tokio::runtime::{Builder, Runtime};
use tower_http::cors::{Any, CorsLayer};

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let config = ServerConfig::parse();
    info!("config: {config:?}");

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    // The model is loaded before anything listens; a load failure is fatal.
    let engine = LlamaPipeline::load(&config.model, config.max_length).await?;
    info!("load model ok.");

    let queue = Arc::new(InboundQueue::new());
    let registry = Arc::new(OutboundRegistry::new());

    let _worker = tokio::spawn(worker_loop(
        queue.clone(),
        registry.clone(),
        Box::new(engine),
        config.generation_defaults(),
    ));

    let state = AppState {
        queue: queue.clone(),
        registry: registry.clone(),
    };

    let app = Router::new()
        .route("/", get(api::completions::index))
        .nest("/v1", api::completions::router())
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.host)
        .await
        .with_context(|| format!("failed to bind {}", config.host))?;
    info!("http listening on {}", listener.local_addr()?);

    let rpc_addr = config.rpc_host;
    let rpc = BackendService::new(queue, registry).into_server();
    info!("rpc listening on {rpc_addr}");

    let http_server = async { axum::serve(listener, app).await.map_err(anyhow::Error::from) };
    let rpc_server = async {
        tonic::transport::Server::builder()
            .add_service(rpc)
            .serve(rpc_addr)
            .await
            .with_context(|| format!("failed to serve rpc on {rpc_addr}"))
    };

    tokio::try_join!(http_server, rpc_server)?;

    Ok(())
}
