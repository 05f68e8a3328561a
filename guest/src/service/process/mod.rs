//! Process service implementation.
//!
//! - **Protocol Layer** (mod.rs): gRPC service implementation
//! - **Executor Layer** (executor.rs): process spawning
//! - **Stdio Layer** (exec_handle.rs): pipes, PTYs, exit status
//! - **State Layer** (registry.rs, state.rs): per-process state

pub(crate) mod exec_handle;
pub(in crate::service) mod executor;
pub(in crate::service) mod registry;
pub(in crate::service) mod state;

use std::pin::Pin;

use capsule_shared::{
    AttachRequest, CreateProcessRequest, CreateProcessResponse, DeleteProcessRequest,
    DeleteProcessResponse, InputChunk, KillRequest, KillResponse, OutputChunk, Process,
    ResizeRequest, ResizeResponse, SendInputAck, StartProcessRequest, StartProcessResponse,
    WaitRequest, WaitResponse,
};
use futures::stream::Stream;
use nix::sys::signal::Signal;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::error::GuestError;
use crate::service::server::GuestServer;
use executor::PendingSpawn;
use state::ProcessState;

#[tonic::async_trait]
impl Process for GuestServer {
    async fn create(
        &self,
        request: Request<CreateProcessRequest>,
    ) -> Result<Response<CreateProcessResponse>, Status> {
        let req = request.into_inner();
        info!(
            container_id = %req.container_id,
            process_id = %req.process_id,
            args = ?req.args,
            terminal = req.terminal.is_some(),
            "create process request"
        );

        if req.process_id.is_empty() {
            return Err(GuestError::InvalidArgument("process_id is required".into()).into());
        }
        if req.args.is_empty() {
            return Err(GuestError::InvalidArgument("args must not be empty".into()).into());
        }
        let container = self.container_record(&req.container_id).await?;
        if self.registry.contains(&req.container_id, &req.process_id).await {
            return Err(GuestError::ProcessExists(req.process_id).into());
        }

        let (stdio, child_stdio) = exec_handle::allocate(req.stdin, req.terminal.as_ref())?;
        let container_id = req.container_id.clone();
        let process_id = req.process_id.clone();
        let pending = PendingSpawn {
            request: req,
            rootfs: container.rootfs,
            hostname: self.private_hostname(container.hostname),
            stdio: child_stdio,
        };
        let state = ProcessState::new(&process_id, pending, stdio, self.options.output_chunk_size);
        self.registry
            .insert(&container_id, &process_id, state)
            .await?;

        Ok(Response::new(CreateProcessResponse {}))
    }

    async fn start(
        &self,
        request: Request<StartProcessRequest>,
    ) -> Result<Response<StartProcessResponse>, Status> {
        let req = request.into_inner();
        debug!(container_id = %req.container_id, process_id = %req.process_id, "start request");

        let state = self.registry.get(&req.container_id, &req.process_id).await?;
        let pid = state.start().await?;
        Ok(Response::new(StartProcessResponse { pid }))
    }

    type AttachStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, Status>> + Send + 'static>>;

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let req = request.into_inner();
        debug!(container_id = %req.container_id, process_id = %req.process_id, "attach request");

        let state = self.registry.get(&req.container_id, &req.process_id).await?;
        let rx = state.attach().await?;

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::AttachStream
        ))
    }

    async fn send_input(
        &self,
        request: Request<Streaming<InputChunk>>,
    ) -> Result<Response<SendInputAck>, Status> {
        let mut stream = request.into_inner();

        // First message must carry the ids
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("Empty stdin stream"))?;
        if first.process_id.is_empty() {
            return Err(Status::invalid_argument("process_id is required"));
        }

        let state = self
            .registry
            .get(&first.container_id, &first.process_id)
            .await?;
        state.send_input(first, stream).await?;
        Ok(Response::new(SendInputAck {}))
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let req = request.into_inner();
        debug!(container_id = %req.container_id, process_id = %req.process_id, "wait request");

        let state = self.registry.get(&req.container_id, &req.process_id).await?;
        let status = state.wait().await?;
        Ok(Response::new(status.into()))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<KillResponse>, Status> {
        let req = request.into_inner();
        info!(
            container_id = %req.container_id,
            process_id = %req.process_id,
            signal = req.signal,
            "kill request"
        );

        let signal = Signal::try_from(req.signal).map_err(|_| {
            Status::invalid_argument(format!("Invalid signal number: {}", req.signal))
        })?;
        let state = self.registry.get(&req.container_id, &req.process_id).await?;
        let delivered = state.kill(signal).await?;
        Ok(Response::new(KillResponse { delivered }))
    }

    async fn resize(
        &self,
        request: Request<ResizeRequest>,
    ) -> Result<Response<ResizeResponse>, Status> {
        let req = request.into_inner();
        let size = req
            .size
            .ok_or_else(|| Status::invalid_argument("size is required"))?;
        debug!(
            container_id = %req.container_id,
            process_id = %req.process_id,
            rows = size.rows,
            cols = size.cols,
            "resize request"
        );

        let state = self.registry.get(&req.container_id, &req.process_id).await?;
        state.resize(&size).await?;
        Ok(Response::new(ResizeResponse {}))
    }

    async fn delete(
        &self,
        request: Request<DeleteProcessRequest>,
    ) -> Result<Response<DeleteProcessResponse>, Status> {
        let req = request.into_inner();
        debug!(container_id = %req.container_id, process_id = %req.process_id, "delete request");

        let state = self.registry.get(&req.container_id, &req.process_id).await?;
        state.ensure_deletable().await?;
        self.registry.remove(&req.container_id, &req.process_id).await;
        Ok(Response::new(DeleteProcessResponse {}))
    }
}
