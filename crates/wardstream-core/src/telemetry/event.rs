//! Failure-telemetry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Severity tier of the boundary (or pseudo-boundary) that captured a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryTier {
    /// Whole-view features; highest retry budget, loudest fallback.
    Critical,
    /// Self-contained features; degrade to cached or alternative content.
    Feature,
    /// Small widgets; minimal substitute, easily dismissed.
    Fallback,
}

impl std::fmt::Display for BoundaryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BoundaryTier::Critical => "critical",
            BoundaryTier::Feature => "feature",
            BoundaryTier::Fallback => "fallback",
        };
        write!(f, "{}", s)
    }
}

/// One captured fault, queued for delivery to the telemetry endpoint.
///
/// The endpoint is idempotent on `id`, so redelivery after an unacknowledged
/// flush is harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedErrorEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Name of the capturing boundary, or a `stream:{topic}` pseudo-name for
    /// faults reported by the stream layer.
    pub boundary_name: String,
    pub tier: BoundaryTier,
    pub message: String,
    /// Free-form key/value context (topic, error class, attempt, ...).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Correlation id, stamped by the queue at push time.
    pub session_id: Uuid,
    /// Delivery attempts so far for this event.
    pub retry_attempt: u32,
    pub delivered: bool,
}

impl QueuedErrorEvent {
    /// New undelivered event. `session_id` is stamped by the queue.
    pub fn new(
        boundary_name: impl Into<String>,
        tier: BoundaryTier,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            boundary_name: boundary_name.into(),
            tier,
            message: message.into(),
            context: BTreeMap::new(),
            session_id: Uuid::nil(),
            retry_attempt: 0,
            delivered: false,
        }
    }

    /// Attach a context key/value pair.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Event for a fault reported by the stream layer for `topic`.
    pub fn for_stream(topic: &str, tier: BoundaryTier, message: impl Into<String>) -> Self {
        Self::new(format!("stream:{}", topic), tier, message).with_context("topic", topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_is_undelivered() {
        let event = QueuedErrorEvent::new("ward-map", BoundaryTier::Feature, "render failed");
        assert!(!event.delivered);
        assert_eq!(event.retry_attempt, 0);
        assert!(event.session_id.is_nil());
    }

    #[test]
    fn test_stream_event_naming() {
        let event = QueuedErrorEvent::for_stream("ward-7", BoundaryTier::Critical, "fatal frame");
        assert_eq!(event.boundary_name, "stream:ward-7");
        assert_eq!(event.context.get("topic").map(String::as_str), Some("ward-7"));
    }

    #[test]
    fn test_event_serializes_with_tier_tag() {
        let event = QueuedErrorEvent::new("sidebar", BoundaryTier::Fallback, "boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tier"], "fallback");
        assert_eq!(json["delivered"], false);
    }
}
