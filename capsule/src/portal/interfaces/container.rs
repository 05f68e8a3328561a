//! Container service interface.

use capsule_shared::{ContainerClient, CreateContainerRequest, DeleteContainerRequest};
use tonic::transport::Channel;

use crate::error::CapsuleResult;
use crate::vm::Rootfs;

/// Container service interface.
#[derive(Clone)]
pub struct ContainerInterface {
    client: ContainerClient<Channel>,
}

impl ContainerInterface {
    /// Create from a channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ContainerClient::new(channel),
        }
    }

    /// Register a container with the agent.
    pub async fn create(
        &mut self,
        container_id: &str,
        rootfs: &Rootfs,
        hostname: &str,
    ) -> CapsuleResult<()> {
        tracing::debug!(
            container_id = %container_id,
            rootfs = %rootfs,
            hostname = %hostname,
            "Sending Container.Create"
        );

        let request = CreateContainerRequest {
            container_id: container_id.to_string(),
            rootfs: rootfs.path().to_string_lossy().into_owned(),
            hostname: hostname.to_string(),
        };
        self.client.create(request).await?;
        Ok(())
    }

    /// Forget a container, killing whatever still runs in it.
    ///
    /// Returns how many processes had to be killed.
    pub async fn delete(&mut self, container_id: &str) -> CapsuleResult<u32> {
        let request = DeleteContainerRequest {
            container_id: container_id.to_string(),
        };
        let response = self.client.delete(request).await?.into_inner();
        if response.killed > 0 {
            tracing::debug!(
                container_id = %container_id,
                killed = response.killed,
                "Guest killed leftover processes"
            );
        }
        Ok(response.killed)
    }
}
