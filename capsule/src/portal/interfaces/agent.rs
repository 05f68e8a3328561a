//! Agent service interface.

use capsule_shared::{
    AgentClient, LookupUserRequest, PasswdEntry, PingRequest, PingResponse, ShutdownRequest,
};
use tonic::transport::Channel;

use crate::error::CapsuleResult;

/// Agent service interface.
#[derive(Clone)]
pub struct AgentInterface {
    client: AgentClient<Channel>,
}

impl AgentInterface {
    /// Create from a channel.
    pub fn new(channel: Channel) -> Self {
        Self {
            client: AgentClient::new(channel),
        }
    }

    /// Check the agent is alive.
    pub async fn ping(&mut self) -> CapsuleResult<PingResponse> {
        Ok(self.client.ping(PingRequest {}).await?.into_inner())
    }

    /// Look up a passwd entry by uid in the container's rootfs.
    pub async fn lookup_uid(
        &mut self,
        container_id: &str,
        uid: u32,
    ) -> CapsuleResult<Option<PasswdEntry>> {
        self.lookup(LookupUserRequest {
            container_id: container_id.to_string(),
            uid: Some(uid),
            name: None,
        })
        .await
    }

    /// Look up a passwd entry by account name in the container's rootfs.
    pub async fn lookup_name(
        &mut self,
        container_id: &str,
        name: &str,
    ) -> CapsuleResult<Option<PasswdEntry>> {
        self.lookup(LookupUserRequest {
            container_id: container_id.to_string(),
            uid: None,
            name: Some(name.to_string()),
        })
        .await
    }

    async fn lookup(&mut self, request: LookupUserRequest) -> CapsuleResult<Option<PasswdEntry>> {
        let response = self.client.lookup_user(request).await?.into_inner();
        Ok(response.entry.map(PasswdEntry::from))
    }

    /// Ask the agent to kill everything and exit.
    pub async fn shutdown(&mut self) -> CapsuleResult<()> {
        self.client.shutdown(ShutdownRequest {}).await?;
        Ok(())
    }
}
