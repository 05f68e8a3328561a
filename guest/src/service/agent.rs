//! Agent service: liveness, identity lookups, shutdown.

use std::path::Path;

use capsule_shared::passwd;
use capsule_shared::{
    Agent, LookupUserRequest, LookupUserResponse, PingRequest, PingResponse, ShutdownRequest,
    ShutdownResponse,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::GuestError;
use crate::service::server::GuestServer;

#[tonic::async_trait]
impl Agent for GuestServer {
    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            processes: self.registry.len().await as u32,
        }))
    }

    async fn lookup_user(
        &self,
        request: Request<LookupUserRequest>,
    ) -> Result<Response<LookupUserResponse>, Status> {
        let req = request.into_inner();
        debug!(
            container_id = %req.container_id,
            uid = ?req.uid,
            name = ?req.name,
            "lookup_user request"
        );

        let rootfs = self.container_rootfs(&req.container_id).await?;
        let entries = tokio::task::spawn_blocking(move || passwd::read_from_root(Path::new(&rootfs)))
            .await
            .map_err(|e| Status::internal(format!("passwd task failed: {}", e)))?
            .map_err(GuestError::from)?;

        let entry = match (req.uid, req.name.as_deref()) {
            (Some(uid), _) => passwd::find_by_uid(&entries, uid),
            (None, Some(name)) => passwd::find_by_name(&entries, name),
            (None, None) => {
                return Err(Status::invalid_argument("either uid or name is required"));
            }
        };

        Ok(Response::new(LookupUserResponse {
            entry: entry.cloned().map(Into::into),
        }))
    }

    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownResponse>, Status> {
        info!("shutdown request");
        let container_ids: Vec<String> = self.containers.lock().await.keys().cloned().collect();
        for container_id in container_ids {
            self.teardown_container(&container_id).await;
        }
        self.shutdown.cancel();
        Ok(Response::new(ShutdownResponse {}))
    }
}
