//! Agent configuration.

use capsule_shared::constants::agent::OUTPUT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

/// Options for the guest agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Run each process in its own UTS namespace carrying the container
    /// hostname. Needs root; an unprivileged agent leaves processes in its
    /// own namespace.
    #[serde(default = "default_isolate_hostname")]
    pub isolate_hostname: bool,

    /// Bytes read from a process output per chunk.
    #[serde(default = "default_output_chunk_size")]
    pub output_chunk_size: usize,
}

fn default_isolate_hostname() -> bool {
    true
}

fn default_output_chunk_size() -> usize {
    OUTPUT_CHUNK_SIZE
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            isolate_hostname: default_isolate_hostname(),
            output_chunk_size: default_output_chunk_size(),
        }
    }
}
