//! Shared constants between host and guest
//!
//! These constants must be identical on both sides of the host-guest boundary.

/// Container defaults
pub mod container {
    /// Hostname used when the caller does not set one
    pub const DEFAULT_HOSTNAME: &str = "capsule";

    /// Working directory used when the process spec leaves it empty
    pub const DEFAULT_CWD: &str = "/";
}

/// Environment defaults applied by the host resolver
pub mod env {
    /// `PATH` injected when the process environment has none
    pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    /// `TERM` injected for terminal processes that do not set one
    pub const DEFAULT_TERM: &str = "xterm";
}

/// Process exit conventions
pub mod process {
    /// Exit code of a signal-terminated process is `SIGNAL_EXIT_BASE + signo`
    pub const SIGNAL_EXIT_BASE: i32 = 128;

    /// SIGKILL
    pub const SIGKILL: i32 = 9;

    /// Exit code observed by processes invalidated by container teardown
    /// (same as a SIGKILL'd process)
    pub const TEARDOWN_EXIT_CODE: i32 = SIGNAL_EXIT_BASE + SIGKILL;
}

/// Transport constants
pub mod network {
    /// Default vsock port for the guest agent gRPC server
    pub const GUEST_AGENT_PORT: u32 = 2695;

    /// Vsock port the guest dials once its server is ready
    pub const GUEST_READY_PORT: u32 = 2696;

    /// Backlog for rendezvous and agent listeners
    pub const LISTEN_BACKLOG: i32 = 128;
}

/// Guest agent tuning
pub mod agent {
    use std::time::Duration;

    /// HTTP/2 concurrent stream limit advertised by the agent.
    ///
    /// Every live process holds up to three streams (attach, stdin, wait).
    pub const MAX_CONCURRENT_STREAMS: u32 = 4096;

    /// Bytes read from a child pipe per output chunk
    pub const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

    /// Output chunks buffered per process before the reader stalls
    pub const OUTPUT_BUFFER: usize = 16;

    /// Once a process has exited, forwarding stops after its output has
    /// been idle this long. Children that inherited the pipes may keep them
    /// open indefinitely.
    pub const OUTPUT_EXIT_GRACE: Duration = Duration::from_millis(250);

    /// How long the agent keeps retrying the ready notification
    pub const NOTIFY_DEADLINE: Duration = Duration::from_secs(30);

    /// Delay between ready notification attempts
    pub const NOTIFY_RETRY: Duration = Duration::from_millis(50);
}
