//! gRPC boundary. A second adapter over the same queue pair as the HTTP
//! handlers; the two transports share nothing else.

use std::sync::Arc;

use log::debug;
use tonic::{Request, Response, Status};

use crate::core::queue::{InboundQueue, OutboundRegistry};
use crate::core::task::{ChatMessage, RequestPayload, Role, SamplingOverrides};

pub mod proto {
    tonic::include_proto!("backend");
}

use proto::backend_server::{Backend, BackendServer};
use proto::{HealthMessage, PredictOptions, Reply};

pub struct BackendService {
    queue: Arc<InboundQueue>,
    registry: Arc<OutboundRegistry>,
}

impl BackendService {
    pub fn new(queue: Arc<InboundQueue>, registry: Arc<OutboundRegistry>) -> Self {
        BackendService { queue, registry }
    }

    pub fn into_server(self) -> BackendServer<BackendService> {
        BackendServer::new(self)
    }
}

#[tonic::async_trait]
impl Backend for BackendService {
    async fn health(&self, _request: Request<HealthMessage>) -> Result<Response<Reply>, Status> {
        Ok(Response::new(Reply {
            message: "OK".to_string(),
        }))
    }

    /// Maps a predict call onto a chat completion with a single user
    /// message. proto3 scalars carry no presence, so a zero field means
    /// "use the server default".
    async fn predict(&self, request: Request<PredictOptions>) -> Result<Response<Reply>, Status> {
        let options = request.into_inner();
        if options.prompt.is_empty() {
            return Err(Status::invalid_argument("prompt must not be empty"));
        }
        debug!("predict prompt: {}", options.prompt);

        let overrides = SamplingOverrides {
            max_tokens: (options.tokens > 0).then_some(options.tokens as usize),
            top_k: (options.topk > 0).then_some(options.topk as usize),
            temperature: (options.temperature > 0.0).then_some(options.temperature),
            top_p: (options.topp > 0.0).then_some(options.topp),
        };

        let payload = RequestPayload::ChatCompletion {
            messages: vec![ChatMessage {
                role: Role::User,
                content: options.prompt,
            }],
            overrides,
        };

        let id = self.queue.submit(payload).await;
        debug!("predict task {id} submitted");
        let result = self
            .registry
            .retrieve(id)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(Reply {
            message: result.into_message().content,
        }))
    }
}
