//! Wire messages for the `capsule.v1` services.
//!
//! Kept as hand-written prost structs so the build does not depend on
//! `protoc`. Tags are part of the wire contract; never renumber them.

// ============================================================================
// Agent
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingResponse {
    #[prost(string, tag = "1")]
    pub version: ::prost::alloc::string::String,
    /// Number of processes the agent currently tracks.
    #[prost(uint32, tag = "2")]
    pub processes: u32,
}

/// Look up an account in the container's `/etc/passwd`.
///
/// Exactly one of `uid` / `name` is expected.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupUserRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(uint32, optional, tag = "2")]
    pub uid: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "3")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LookupUserResponse {
    #[prost(message, optional, tag = "1")]
    pub entry: ::core::option::Option<PasswdRecord>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PasswdRecord {
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub uid: u32,
    #[prost(uint32, tag = "3")]
    pub gid: u32,
    #[prost(string, tag = "4")]
    pub home: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub shell: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShutdownRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShutdownResponse {}

// ============================================================================
// Container
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateContainerRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    /// Root filesystem path as seen by the guest.
    #[prost(string, tag = "2")]
    pub rootfs: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub hostname: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateContainerResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteContainerRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteContainerResponse {
    /// Processes that were still alive and had to be killed.
    #[prost(uint32, tag = "1")]
    pub killed: u32,
}

// ============================================================================
// Process
// ============================================================================

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserSpec {
    #[prost(uint32, tag = "1")]
    pub uid: u32,
    #[prost(uint32, tag = "2")]
    pub gid: u32,
    #[prost(uint32, repeated, tag = "3")]
    pub additional_gids: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TerminalSize {
    #[prost(uint32, tag = "1")]
    pub rows: u32,
    #[prost(uint32, tag = "2")]
    pub cols: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateProcessRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "3")]
    pub args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Fully resolved `KEY=value` entries.
    #[prost(string, repeated, tag = "4")]
    pub env: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "5")]
    pub cwd: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "6")]
    pub user: ::core::option::Option<UserSpec>,
    /// Allocate a PTY; stdout and stderr are merged onto it.
    #[prost(message, optional, tag = "7")]
    pub terminal: ::core::option::Option<TerminalSize>,
    /// The host will stream stdin; otherwise the child gets `/dev/null`.
    #[prost(bool, tag = "8")]
    pub stdin: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateProcessResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartProcessRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartProcessResponse {
    #[prost(uint32, tag = "1")]
    pub pid: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AttachRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StreamKind {
    Stdout = 0,
    Stderr = 1,
}

/// One chunk of process output. Chunks of one stream arrive in order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OutputChunk {
    #[prost(enumeration = "StreamKind", tag = "1")]
    pub stream: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// One chunk of stdin. The first chunk of a stream must carry the ids.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InputChunk {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// Close the child's stdin after writing `data`.
    #[prost(bool, tag = "4")]
    pub close: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendInputAck {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
}

/// Termination report. `signal` is non-zero when the process was killed by
/// a signal, in which case `exit_code` is meaningless.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WaitResponse {
    #[prost(int32, tag = "1")]
    pub exit_code: i32,
    #[prost(int32, tag = "2")]
    pub signal: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
    #[prost(int32, tag = "3")]
    pub signal: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KillResponse {
    /// False when the process had already exited.
    #[prost(bool, tag = "1")]
    pub delivered: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResizeRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub size: ::core::option::Option<TerminalSize>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResizeResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteProcessRequest {
    #[prost(string, tag = "1")]
    pub container_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub process_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteProcessResponse {}

impl WaitResponse {
    /// Collapse into a single POSIX-style exit code (`128 + signal` when
    /// killed by a signal).
    pub fn posix_code(&self) -> i32 {
        if self.signal != 0 {
            crate::constants::process::SIGNAL_EXIT_BASE + self.signal
        } else {
            self.exit_code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_response_maps_signal_to_posix_code() {
        let killed = WaitResponse {
            exit_code: 0,
            signal: 9,
        };
        assert_eq!(killed.posix_code(), 137);

        let exited = WaitResponse {
            exit_code: 3,
            signal: 0,
        };
        assert_eq!(exited.posix_code(), 3);
    }

    #[test]
    fn test_output_chunk_stream_accessor() {
        let chunk = OutputChunk {
            stream: StreamKind::Stderr as i32,
            data: b"oops".to_vec(),
        };
        assert_eq!(chunk.stream(), StreamKind::Stderr);
    }
}
