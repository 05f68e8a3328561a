//! Guest agent service implementations.
//!
//! This module contains the gRPC server and service implementations:
//! - `agent`: Ping, LookupUser, Shutdown
//! - `container`: container registration (Create, Delete)
//! - `process`: process lifecycle (Create, Start, Attach, SendInput, Wait, Kill, Resize, Delete)

mod agent;
mod container;
pub(crate) mod process;
pub(crate) mod server;
