//! Scheduler constants.

/// Default interval of the fallback poll loop.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default capacity of the pending queue (jobs seen while at the concurrency ceiling).
pub const DEFAULT_PENDING_QUEUE_CAPACITY: usize = 100;

/// Initial reconnect delay for the realtime subscription.
pub const REALTIME_BACKOFF_INITIAL_MS: u64 = 1_000;

/// Upper bound for the realtime reconnect delay.
pub const REALTIME_BACKOFF_MAX_MS: u64 = 60_000;

/// Request timeout for control-plane HTTP calls.
pub const CONTROL_PLANE_TIMEOUT_SECS: u64 = 30;
