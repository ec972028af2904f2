//! Engine configuration.
//!
//! Plain `Clone + Debug` structs with `Default` impls, the same
//! library-level configuration pattern the teacher's own daemon uses
//! (`DaemonConfig`) — this crate has no CLI surface, so there is no
//! `clap`/`figment` layer above it.

use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the error hub's sliding buffer.
    pub error_sliding_capacity: usize,

    /// Batching configuration. `None` disables the batching stage entirely —
    /// `Batched`-mode webhooks then fall back to per-event dispatch.
    pub batching: Option<BatchingConfig>,

    /// Retry subsystem configuration.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_sliding_capacity: 256,
            batching: Some(BatchingConfig::default()),
            retry: RetryConfig::default(),
        }
    }
}

/// Configuration for the optional batching stage.
#[derive(Debug, Clone, Copy)]
pub struct BatchingConfig {
    /// Capacity of the inbound batching queue.
    pub capacity: usize,
    /// Maximum number of events per batch before a flush.
    pub max_size: usize,
    /// Maximum time since the first accumulated event before a flush.
    pub max_wait: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self { capacity: 1024, max_size: 100, max_wait: Duration::from_secs(1) }
    }
}

/// Configuration for the per-webhook retry subsystem.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Capacity of each webhook's dispatch queue while it is `Retrying`.
    pub capacity: usize,
    /// Base backoff duration (`attempt == 1`'s delay).
    pub exponential_base: Duration,
    /// Factor by which the backoff grows per attempt.
    pub exponential_factor: u32,
    /// Total time budget for a webhook's retry loop before it is declared
    /// `Unavailable`.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            exponential_base: Duration::from_millis(500),
            exponential_factor: 2,
            timeout: Duration::from_secs(300),
        }
    }
}
