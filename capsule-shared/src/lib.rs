//! Capsule Core - Shared code for host and guest
//!
//! This crate contains the socket family abstraction, the wire protocol and
//! the constants used by both the host-side runtime (capsule) and the guest
//! agent.

pub mod constants;
pub mod errors;
pub mod passwd;
pub mod protocol;
pub mod socket;

// Generated service stubs (messages live in `protocol`)
pub mod generated {
    #![allow(clippy::all, unused_qualifications)]
    include!(concat!(env!("OUT_DIR"), "/capsule.v1.Agent.rs"));
    include!(concat!(env!("OUT_DIR"), "/capsule.v1.Container.rs"));
    include!(concat!(env!("OUT_DIR"), "/capsule.v1.Process.rs"));
}

pub use errors::{TransportError, TransportResult};
pub use passwd::PasswdEntry;
pub use socket::{Socket, SocketStream, SocketType};

// Agent service
pub use generated::agent_client::AgentClient;
pub use generated::agent_server::{Agent, AgentServer};

// Container service
pub use generated::container_client::ContainerClient;
pub use generated::container_server::{Container, ContainerServer};

// Process service
pub use generated::process_client::ProcessClient;
pub use generated::process_server::{Process, ProcessServer};

// All wire messages
pub use protocol::*;
