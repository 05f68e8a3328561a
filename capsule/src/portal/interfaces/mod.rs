//! Service interfaces.
//!
//! High-level facades over gRPC services.

pub mod agent;
pub mod container;
pub mod process;

pub use agent::AgentInterface;
pub use container::ContainerInterface;
pub use process::{OutputStream, ProcessInterface};
