//! Capsule: host-side control plane for containers running inside VMs.
//!
//! The host talks to a guest agent over a single socket (vsock, or a Unix
//! socket for in-process agents). A [`LinuxContainer`] drives the agent
//! through the container lifecycle, and every process in it (init and
//! execs) is a [`LinuxProcess`] whose stdio is streamed into [`Writer`]s.

pub mod container;
pub mod env;
pub mod error;
pub mod options;
pub mod portal;
pub mod process;
pub mod sink;
pub mod vm;

pub use container::{ContainerState, LinuxContainer};
pub use env::{resolve_environment, resolve_user, GuestIdentity, IdentityLookup, PasswdFile};
pub use error::{CapsuleError, CapsuleResult, ContainerError, ProcessError, SinkError};
pub use options::ContainerOptions;
pub use process::{ConsoleSize, LinuxProcess, ProcessConfig, ProcessState, Stdio, User};
pub use sink::{BoundedWriter, BufferWriter, DiscardWriter, FileWriter, Writer};
pub use vm::{Rootfs, VmHandle};

pub use capsule_shared::{PasswdEntry, SocketType, TransportError};
