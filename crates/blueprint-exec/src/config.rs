//! Executor configuration

use serde::Deserialize;

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 512 * 1024;
const DEFAULT_POLL_CHUNK_BYTES: usize = 64 * 1024;

/// Tunables for one executor instance. All fields have defaults so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Maximum number of concurrently running nodes; `None` is unbounded.
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Overall timeout applied to the shared HTTP client.
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    /// Cap on captured subprocess stdout/stderr; output beyond this is
    /// dropped, not buffered.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Read-buffer size for event-source streams and datagrams.
    #[serde(default = "default_poll_chunk_bytes")]
    pub event_chunk_bytes: usize,
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_poll_chunk_bytes() -> usize {
    DEFAULT_POLL_CHUNK_BYTES
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            event_chunk_bytes: DEFAULT_POLL_CHUNK_BYTES,
        }
    }
}
