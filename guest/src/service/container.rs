//! Container service: registration and teardown.

use std::path::PathBuf;

use capsule_shared::constants::container::DEFAULT_HOSTNAME;
use capsule_shared::{
    Container, CreateContainerRequest, CreateContainerResponse, DeleteContainerRequest,
    DeleteContainerResponse,
};
use nix::sys::signal::Signal;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::error::GuestError;

/// Linux limit on a UTS hostname.
const HOST_NAME_MAX: usize = 64;
use crate::service::server::{ContainerRecord, GuestServer};

#[tonic::async_trait]
impl Container for GuestServer {
    async fn create(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        info!(
            container_id = %req.container_id,
            rootfs = %req.rootfs,
            hostname = %req.hostname,
            "create container request"
        );

        if req.container_id.is_empty() {
            return Err(GuestError::InvalidArgument("container_id is required".into()).into());
        }
        if req.rootfs.is_empty() {
            return Err(GuestError::InvalidArgument("rootfs is required".into()).into());
        }
        let hostname = if req.hostname.is_empty() {
            DEFAULT_HOSTNAME.to_string()
        } else {
            req.hostname
        };
        if hostname.len() > HOST_NAME_MAX {
            return Err(GuestError::InvalidArgument(format!(
                "hostname longer than {} bytes",
                HOST_NAME_MAX
            ))
            .into());
        }

        let mut containers = self.containers.lock().await;
        if containers.contains_key(&req.container_id) {
            return Err(GuestError::ContainerExists(req.container_id).into());
        }
        containers.insert(
            req.container_id,
            ContainerRecord {
                rootfs: PathBuf::from(req.rootfs),
                hostname,
            },
        );

        Ok(Response::new(CreateContainerResponse {}))
    }

    async fn delete(
        &self,
        request: Request<DeleteContainerRequest>,
    ) -> Result<Response<DeleteContainerResponse>, Status> {
        let req = request.into_inner();
        info!(container_id = %req.container_id, "delete container request");

        if !self.containers.lock().await.contains_key(&req.container_id) {
            return Err(GuestError::ContainerNotFound(req.container_id).into());
        }
        let killed = self.teardown_container(&req.container_id).await;
        Ok(Response::new(DeleteContainerResponse { killed }))
    }
}

impl GuestServer {
    /// Forget a container, killing whatever of it is still alive.
    ///
    /// Returns how many processes had to be killed.
    pub(crate) async fn teardown_container(&self, container_id: &str) -> u32 {
        let record = self.containers.lock().await.remove(container_id);
        let processes = self.registry.remove_container(container_id).await;

        let mut killed = 0;
        for process in processes {
            match process.kill(Signal::SIGKILL).await {
                Ok(true) => killed += 1,
                Ok(false) => {}
                Err(e) => warn!(container_id = %container_id, error = %e, "Failed to kill process"),
            }
        }
        if let Some(record) = record {
            info!(
                container_id = %container_id,
                hostname = %record.hostname,
                killed,
                "Container removed"
            );
        }
        killed
    }
}
