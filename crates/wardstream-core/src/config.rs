//! Centralized configuration for the Wardstream core.
//!
//! All timing, capacity, and threshold constants live here. The original
//! system scattered ad-hoc backoff constants across modules; this module is
//! the single authoritative definition.

use std::time::Duration;

/// Stream connection configuration.
pub struct StreamConfig;

impl StreamConfig {
    /// Window in which a connection attempt must be acknowledged.
    pub const CONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long a topic stays alive after its last subscriber detaches.
    pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);
    /// Replay buffer depth per connection.
    pub const REPLAY_BUFFER_FRAMES: usize = 100;
    /// Replay buffer depth on memory-constrained profiles.
    pub const REPLAY_BUFFER_FRAMES_CONSTRAINED: usize = 25;
    /// Per-subscriber delivery channel capacity.
    pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;
    /// How often a reconnecting driver re-checks an open breaker.
    pub const BREAKER_POLL_INTERVAL: Duration = Duration::from_secs(1);
    /// Consecutive malformed frames tolerated before the connection is
    /// treated as broken rather than dropping frames one by one.
    pub const MALFORMED_FRAME_TOLERANCE: u32 = 5;
}

/// Circuit breaker configuration.
pub struct BreakerConfig;

impl BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub const FAILURE_THRESHOLD: u32 = 5;
    /// Cooldown after the first opening; doubles on each re-opening.
    pub const BASE_COOLDOWN: Duration = Duration::from_secs(2);
    /// Cooldown growth cap.
    pub const MAX_COOLDOWN: Duration = Duration::from_secs(120);
    /// Probes permitted while half-open.
    pub const HALF_OPEN_MAX_PROBES: u32 = 1;
}

/// Retry backoff configuration (attempts inside a single `execute` call,
/// distinct from breaker cooldowns).
pub struct RetryDefaults;

impl RetryDefaults {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY: Duration = Duration::from_millis(500);
    pub const MAX_DELAY: Duration = Duration::from_secs(30);
}

/// Adaptive transport policy table.
///
/// Heartbeat intervals, payload ceilings, and batch sizes per network
/// quality bucket. Low power doubles every interval; a backgrounded client
/// relaxes them by half again.
pub struct TransportPolicy;

impl TransportPolicy {
    pub const HEARTBEAT_EXCELLENT: Duration = Duration::from_secs(30);
    pub const HEARTBEAT_FAIR: Duration = Duration::from_secs(45);
    pub const HEARTBEAT_POOR: Duration = Duration::from_secs(60);
    pub const HEARTBEAT_OFFLINE: Duration = Duration::from_secs(120);

    pub const MAX_MESSAGE_BYTES_EXCELLENT: usize = 65_536;
    pub const MAX_MESSAGE_BYTES_FAIR: usize = 32_768;
    pub const MAX_MESSAGE_BYTES_POOR: usize = 16_384;

    pub const BATCH_EXCELLENT: u32 = 1;
    pub const BATCH_FAIR: u32 = 2;
    pub const BATCH_POOR: u32 = 3;

    /// Payload size above which compression kicks in on constrained links.
    pub const COMPRESSION_THRESHOLD_BYTES: usize = 500;
    /// Power level (percent) below which all intervals double.
    pub const LOW_POWER_THRESHOLD: u8 = 20;
    /// Interval multiplier applied while backgrounded.
    pub const BACKGROUND_RELAX_FACTOR: f64 = 1.5;
}

/// Connectivity probing configuration defaults.
pub struct ConnectivityDefaults;

impl ConnectivityDefaults {
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const OFFLINE_RECHECK_INTERVAL: Duration = Duration::from_secs(30);
    pub const ONLINE_VERIFY_INTERVAL: Duration = Duration::from_secs(300);
}

/// Error queue configuration.
pub struct TelemetryConfig;

impl TelemetryConfig {
    /// Maximum queued failure events.
    pub const QUEUE_CAPACITY: usize = 200;
    /// Administrative TTL after which an undelivered event is pruned.
    pub const EVENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Breaker key guarding the telemetry endpoint.
    pub const BREAKER_KEY: &'static str = "telemetry";
    /// Interval for the background flusher when events are pending.
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
    /// Maximum events per delivery batch.
    pub const MAX_BATCH: usize = 50;
}

/// Fault isolation boundary defaults per tier.
pub struct BoundaryDefaults;

impl BoundaryDefaults {
    pub const CRITICAL_MAX_RETRIES: u32 = 5;
    pub const FEATURE_MAX_RETRIES: u32 = 3;
    pub const FALLBACK_MAX_RETRIES: u32 = 2;

    /// First retry delay; strictly doubles per attempt up to the cap.
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(15);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table_monotonic() {
        // Heartbeats must lengthen as quality degrades.
        assert!(TransportPolicy::HEARTBEAT_EXCELLENT < TransportPolicy::HEARTBEAT_FAIR);
        assert!(TransportPolicy::HEARTBEAT_FAIR < TransportPolicy::HEARTBEAT_POOR);
        assert!(TransportPolicy::HEARTBEAT_POOR < TransportPolicy::HEARTBEAT_OFFLINE);

        // Payload ceilings must shrink as quality degrades.
        assert!(TransportPolicy::MAX_MESSAGE_BYTES_EXCELLENT > TransportPolicy::MAX_MESSAGE_BYTES_FAIR);
        assert!(TransportPolicy::MAX_MESSAGE_BYTES_FAIR > TransportPolicy::MAX_MESSAGE_BYTES_POOR);
    }

    #[test]
    fn test_breaker_cooldown_bounds() {
        assert!(BreakerConfig::BASE_COOLDOWN < BreakerConfig::MAX_COOLDOWN);
        assert_eq!(BreakerConfig::HALF_OPEN_MAX_PROBES, 1);
    }
}
