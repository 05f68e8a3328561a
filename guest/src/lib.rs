//! Capsule guest agent.
//!
//! Runs inside the VM (or in-process for tests) and serves the `capsule.v1`
//! services: it spawns container processes, streams their stdio and reports
//! their exit statuses.

mod error;
mod options;
mod service;

pub use error::{GuestError, GuestResult};
pub use options::AgentOptions;
pub use service::server::GuestServer;
