//! Process service interface.
//!
//! Unary control calls plus the two stdio streams: a server stream of
//! output chunks (Attach) and a client stream of input chunks (SendInput).
//! Each call is its own HTTP/2 stream, so concurrent processes never block
//! each other on the shared connection.

use capsule_shared::{
    AttachRequest, CreateProcessRequest, DeleteProcessRequest, InputChunk, KillRequest,
    OutputChunk, ProcessClient, ResizeRequest, StartProcessRequest, TerminalSize, WaitRequest,
    WaitResponse,
};
use futures::Stream;
use tonic::transport::Channel;
use tonic::Code;

use crate::error::{process_status, CapsuleError, CapsuleResult, ProcessError};

/// Ordered output chunks of one process.
pub type OutputStream = tonic::Streaming<OutputChunk>;

/// Process service interface.
#[derive(Clone)]
pub struct ProcessInterface {
    client: ProcessClient<Channel>,
}

impl ProcessInterface {
    /// Create from a channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ProcessClient::new(channel),
        }
    }

    /// Allocate the guest-side process and its stdio.
    pub async fn create(&mut self, request: CreateProcessRequest) -> CapsuleResult<()> {
        let process_id = request.process_id.clone();
        self.client
            .create(request)
            .await
            .map_err(|status| process_status(status, &process_id))?;
        Ok(())
    }

    /// Exec the process. Returns its guest pid.
    ///
    /// Any refusal other than a lost transport is a start failure.
    pub async fn start(&mut self, container_id: &str, process_id: &str) -> CapsuleResult<u32> {
        let request = StartProcessRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
        };
        match self.client.start(request).await {
            Ok(response) => Ok(response.into_inner().pid),
            Err(status) if status.code() == Code::NotFound => {
                Err(ProcessError::NotFound(process_id.to_string()).into())
            }
            Err(status) => match CapsuleError::from(status) {
                CapsuleError::Rpc { message, .. } => Err(ProcessError::StartFailed {
                    id: process_id.to_string(),
                    reason: message,
                }
                .into()),
                other => Err(other),
            },
        }
    }

    /// Open the output stream. Must happen before `start` to see all output.
    pub async fn attach(
        &mut self,
        container_id: &str,
        process_id: &str,
    ) -> CapsuleResult<OutputStream> {
        let request = AttachRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
        };
        let response = self
            .client
            .attach(request)
            .await
            .map_err(|status| process_status(status, process_id))?;
        Ok(response.into_inner())
    }

    /// Stream stdin. Resolves once the guest has consumed the whole stream.
    pub async fn send_input<S>(&mut self, chunks: S) -> CapsuleResult<()>
    where
        S: Stream<Item = InputChunk> + Send + 'static,
    {
        self.client.send_input(chunks).await?;
        Ok(())
    }

    /// Block until the process exits.
    pub async fn wait(&mut self, container_id: &str, process_id: &str) -> CapsuleResult<WaitResponse> {
        let request = WaitRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
        };
        let response = self
            .client
            .wait(request)
            .await
            .map_err(|status| process_status(status, process_id))?;
        Ok(response.into_inner())
    }

    /// Deliver a signal. Returns false when the process had already exited.
    pub async fn kill(
        &mut self,
        container_id: &str,
        process_id: &str,
        signal: i32,
    ) -> CapsuleResult<bool> {
        let request = KillRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            signal,
        };
        let response = self
            .client
            .kill(request)
            .await
            .map_err(|status| process_status(status, process_id))?;
        Ok(response.into_inner().delivered)
    }

    /// Resize the process terminal.
    pub async fn resize(
        &mut self,
        container_id: &str,
        process_id: &str,
        rows: u32,
        cols: u32,
    ) -> CapsuleResult<()> {
        let request = ResizeRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            size: Some(TerminalSize { rows, cols }),
        };
        self.client
            .resize(request)
            .await
            .map_err(|status| process_status(status, process_id))?;
        Ok(())
    }

    /// Release the guest-side process.
    pub async fn delete(&mut self, container_id: &str, process_id: &str) -> CapsuleResult<()> {
        let request = DeleteProcessRequest {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
        };
        self.client
            .delete(request)
            .await
            .map_err(|status| match status.code() {
                Code::FailedPrecondition => ProcessError::NotExited(process_id.to_string()).into(),
                _ => process_status(status, process_id),
            })?;
        Ok(())
    }
}
