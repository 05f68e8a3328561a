//! Configuration for containers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Container Options
// ============================================================================

/// Tuning knobs for a [`LinuxContainer`](crate::LinuxContainer).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// How long `create()` waits for the guest agent to connect back.
    ///
    /// Default: 30s
    #[serde(default = "default_ready_timeout", with = "duration_ms")]
    pub ready_timeout: Duration,

    /// How long connecting the gRPC session may take once the guest is ready.
    ///
    /// Default: 10s
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// How long `force_stop()` waits for init to die after SIGKILL.
    ///
    /// Default: 10s
    #[serde(default = "default_stop_timeout", with = "duration_ms")]
    pub stop_timeout: Duration,

    /// Output chunks buffered per stream between the transport and a sink.
    ///
    /// A sink that falls this far behind stalls only the process it belongs to.
    /// Default: 32
    #[serde(default = "default_stdio_buffer")]
    pub stdio_buffer: usize,
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stdio_buffer() -> usize {
    32
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            ready_timeout: default_ready_timeout(),
            connect_timeout: default_connect_timeout(),
            stop_timeout: default_stop_timeout(),
            stdio_buffer: default_stdio_buffer(),
        }
    }
}

/// Durations are configured as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let opts: ContainerOptions = serde_json::from_str(r#"{"stop_timeout": 250}"#).unwrap();
        assert_eq!(opts.stop_timeout, Duration::from_millis(250));
        assert_eq!(opts.ready_timeout, default_ready_timeout());
        assert_eq!(opts.stdio_buffer, 32);
    }

    #[test]
    fn test_serialize_as_millis() {
        let json = serde_json::to_value(ContainerOptions::default()).unwrap();
        assert_eq!(json["ready_timeout"], 30_000);
        assert_eq!(json["connect_timeout"], 10_000);
    }
}
