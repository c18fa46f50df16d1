//! Tunables for the engine and the pool.
//!
//! Grouped into `Copy` structs rather than loose function parameters,
//! matching the builder-oriented configuration style used throughout the
//! corpus this crate descends from.

use std::time::Duration;

/// Per-connection tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Deadline for writing one full request (head + body).
    pub write_timeout: Duration,
    /// Deadline for each individual read performed while parsing a
    /// response head or pulling a body chunk.
    pub read_timeout: Duration,
    /// How long a connection may sit `Idle` before it is no longer fit
    /// for reuse.
    pub keep_alive_timeout: Duration,
    /// Requests served before a connection refuses reuse even if
    /// otherwise healthy.
    pub max_requests_per_connection: u32,
    /// Size of the buffer used to read response bytes off the wire.
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(300),
            max_requests_per_connection: 100,
            read_buffer_size: 65536,
        }
    }
}

/// Pool-wide tunables.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Total leased-plus-idle connections across every origin.
    pub max_total: usize,
    /// Leased-plus-idle connections for a single origin.
    pub max_per_host: usize,
    /// Must match (or bound) [`EngineConfig::keep_alive_timeout`].
    pub keep_alive_timeout: Duration,
    /// Passed through to every engine the pool creates.
    pub max_requests_per_connection: u32,
    /// How often the background reaper sweeps idle connections for
    /// expiry.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 10,
            max_per_host: 5,
            keep_alive_timeout: Duration::from_secs(300),
            max_requests_per_connection: 100,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Engine config derived from the pool config, for the engines the
    /// pool dials itself.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            keep_alive_timeout: self.keep_alive_timeout,
            max_requests_per_connection: self.max_requests_per_connection,
            ..EngineConfig::default()
        }
    }
}
