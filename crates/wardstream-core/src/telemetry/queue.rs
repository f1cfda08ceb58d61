//! Durable-best-effort, bounded, ordered store of failure telemetry.
//!
//! Telemetry is best-effort by design: the queue never blocks a caller,
//! never grows past its bound, and never lets a failing collector endpoint
//! spin (delivery is gated through the breaker registry). On overflow the
//! oldest undelivered entry is evicted, never the newest.

use crate::cancel::CancellationToken;
use crate::config::TelemetryConfig;
use crate::error::{CoreError, Result};
use crate::resilience::{BreakerRegistry, RetryConfig};
use crate::telemetry::event::QueuedErrorEvent;
use crate::telemetry::sink::DynTelemetrySink;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the error queue.
#[derive(Debug, Clone)]
pub struct ErrorQueueConfig {
    /// Maximum queued events.
    pub capacity: usize,
    /// Administrative TTL after which an undelivered event is pruned.
    pub event_ttl: Duration,
    /// Background flush cadence while events are pending.
    pub flush_interval: Duration,
    /// Maximum events per delivery batch.
    pub max_batch: usize,
    /// Breaker key guarding the collector endpoint.
    pub breaker_key: String,
    /// Retry policy for one flush call.
    pub flush_retry: RetryConfig,
}

impl Default for ErrorQueueConfig {
    fn default() -> Self {
        Self {
            capacity: TelemetryConfig::QUEUE_CAPACITY,
            event_ttl: TelemetryConfig::EVENT_TTL,
            flush_interval: TelemetryConfig::FLUSH_INTERVAL,
            max_batch: TelemetryConfig::MAX_BATCH,
            breaker_key: TelemetryConfig::BREAKER_KEY.to_string(),
            flush_retry: RetryConfig::default(),
        }
    }
}

impl ErrorQueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_flush_retry(mut self, retry: RetryConfig) -> Self {
        self.flush_retry = retry;
        self
    }
}

/// Bounded FIFO of failure events with breaker-gated delivery.
pub struct ErrorQueue {
    events: Mutex<VecDeque<QueuedErrorEvent>>,
    sink: DynTelemetrySink,
    breakers: Arc<BreakerRegistry>,
    config: ErrorQueueConfig,
    /// Correlation id stamped on every pushed event.
    session_id: Uuid,
    /// Overflow evictions since creation.
    evicted: AtomicU64,
    /// Wakes the background flusher on push.
    pending: Notify,
    flusher_active: AtomicBool,
    flusher_cancel: CancellationToken,
}

impl ErrorQueue {
    pub fn new(sink: DynTelemetrySink, breakers: Arc<BreakerRegistry>) -> Self {
        Self::with_config(sink, breakers, ErrorQueueConfig::default())
    }

    pub fn with_config(
        sink: DynTelemetrySink,
        breakers: Arc<BreakerRegistry>,
        config: ErrorQueueConfig,
    ) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(config.capacity)),
            sink,
            breakers,
            config,
            session_id: Uuid::new_v4(),
            evicted: AtomicU64::new(0),
            pending: Notify::new(),
            flusher_active: AtomicBool::new(false),
            flusher_cancel: CancellationToken::new(),
        }
    }

    /// Correlation id for this core instance.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Append an event, stamping the session id.
    ///
    /// Synchronous and non-blocking: callers in fault paths must never wait
    /// on telemetry. At capacity the oldest undelivered entry is evicted to
    /// make room. The background flusher is woken so an event pushed while
    /// online is delivered promptly instead of waiting out the cadence.
    pub fn push(&self, mut event: QueuedErrorEvent) {
        event.session_id = self.session_id;

        {
            let mut events = self.events.lock().unwrap();
            if events.len() >= self.config.capacity {
                let victim = events
                    .iter()
                    .position(|e| !e.delivered)
                    .unwrap_or(0);
                if let Some(evicted) = events.remove(victim) {
                    self.evicted.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        "Error queue full ({}), evicting oldest undelivered event {} from {}",
                        self.config.capacity, evicted.id, evicted.boundary_name
                    );
                }
            }
            events.push_back(event);
        }
        self.pending.notify_one();
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// Deliver all undelivered events, in insertion order.
    ///
    /// Delivery is gated through the breaker keyed by the collector
    /// endpoint, so a dead collector degrades to fail-fast pushes instead of
    /// unbounded retry spin. Returns the number of events acknowledged.
    pub async fn flush(&self) -> Result<usize> {
        self.prune_expired();

        let mut total = 0;
        loop {
            let batch: Vec<QueuedErrorEvent> = {
                let events = self.events.lock().unwrap();
                events
                    .iter()
                    .filter(|e| !e.delivered)
                    .take(self.config.max_batch)
                    .cloned()
                    .collect()
            };
            if batch.is_empty() {
                return Ok(total);
            }

            let outcome = self
                .breakers
                .execute(
                    &self.config.breaker_key,
                    &self.config.flush_retry,
                    || self.sink.deliver(&batch),
                    None,
                )
                .await;

            match outcome {
                Ok(()) => {
                    let mut events = self.events.lock().unwrap();
                    // Mark-and-prune: acknowledged events leave the queue.
                    events.retain(|e| !batch.iter().any(|b| b.id == e.id));
                    total += batch.len();
                    debug!("Flushed {} telemetry events", batch.len());
                }
                Err(e) => {
                    let mut events = self.events.lock().unwrap();
                    for queued in events.iter_mut() {
                        if batch.iter().any(|b| b.id == queued.id) {
                            queued.retry_attempt += 1;
                        }
                    }
                    debug!("Telemetry flush failed, {} events left queued: {}", events.len(), e);
                    return Err(e);
                }
            }
        }
    }

    /// Drop undelivered events older than the administrative TTL.
    fn prune_expired(&self) {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.event_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut events = self.events.lock().unwrap();
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        let pruned = before - events.len();
        if pruned > 0 {
            debug!("Pruned {} expired telemetry events", pruned);
        }
    }

    /// Snapshot of the queue for embedders that persist across reloads.
    pub fn snapshot(&self) -> Vec<QueuedErrorEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    /// Restore a persisted snapshot, appending behind current entries.
    ///
    /// Whatever fits is kept; a snapshot that overflows the capacity bound
    /// reports the truncation as a capacity error.
    pub fn restore(&self, saved: Vec<QueuedErrorEvent>) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        for event in saved {
            if events.len() >= self.config.capacity {
                return Err(CoreError::Capacity {
                    resource: "error queue".into(),
                    limit: self.config.capacity,
                });
            }
            events.push_back(event);
        }
        Ok(())
    }

    /// Queue statistics for the status surface.
    pub fn stats(&self) -> ErrorQueueStats {
        let events = self.events.lock().unwrap();
        ErrorQueueStats {
            queued: events.len(),
            undelivered: events.iter().filter(|e| !e.delivered).count(),
            evicted: self.evicted.load(Ordering::SeqCst),
            session_id: self.session_id,
        }
    }

    // === Background flushing ===

    /// Start the background flusher.
    ///
    /// Flushes on a fixed cadence while online, immediately when an event is
    /// pushed, and immediately when the connectivity watch flips back to
    /// online. Idempotent; terminal once [`stop_flusher`](Self::stop_flusher)
    /// is called.
    pub fn start_flusher(self: &Arc<Self>, mut online: watch::Receiver<bool>) {
        if self.flusher_active.swap(true, Ordering::SeqCst) {
            debug!("Telemetry flusher already active");
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting telemetry flusher");

            loop {
                tokio::select! {
                    _ = queue.flusher_cancel.cancelled() => break,
                    _ = tokio::time::sleep(queue.config.flush_interval) => {}
                    // notify_one stores a permit, so a push racing the
                    // select is not lost.
                    _ = queue.pending.notified() => {}
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if !*online.borrow() {
                            continue;
                        }
                        debug!("Connectivity restored, flushing telemetry");
                    }
                }

                if !queue.flusher_active.load(Ordering::SeqCst) {
                    break;
                }
                if !*online.borrow() {
                    // Offline: leave everything queued.
                    continue;
                }
                if queue.is_empty() {
                    continue;
                }
                if let Err(e) = queue.flush().await {
                    debug!("Background telemetry flush failed: {}", e);
                }
            }

            info!("Telemetry flusher stopped");
        });
    }

    /// Stop the background flusher. Idempotent and terminal.
    pub fn stop_flusher(&self) {
        self.flusher_active.store(false, Ordering::SeqCst);
        self.flusher_cancel.cancel();
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone)]
pub struct ErrorQueueStats {
    pub queued: usize,
    pub undelivered: usize,
    pub evicted: u64,
    pub session_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::event::BoundaryTier;
    use crate::telemetry::sink::TelemetrySink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Sink that records batches and fails on demand.
    struct RecordingSink {
        delivered: Mutex<Vec<QueuedErrorEvent>>,
        failures_remaining: AtomicU32,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(0),
            })
        }

        fn failing(times: u32) -> Arc<Self> {
            let sink = Self::new();
            sink.failures_remaining.store(times, Ordering::SeqCst);
            sink
        }

        fn delivered_ids(&self) -> Vec<Uuid> {
            self.delivered.lock().unwrap().iter().map(|e| e.id).collect()
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn deliver(&self, events: &[QueuedErrorEvent]) -> Result<()> {
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(CoreError::Transport {
                    message: "collector unreachable".into(),
                    cause: None,
                });
            }
            self.delivered.lock().unwrap().extend_from_slice(events);
            Ok(())
        }
    }

    fn event(name: &str) -> QueuedErrorEvent {
        QueuedErrorEvent::new(name, BoundaryTier::Feature, "boom")
    }

    fn queue_with(sink: Arc<RecordingSink>, capacity: usize) -> ErrorQueue {
        ErrorQueue::with_config(
            sink,
            Arc::new(BreakerRegistry::new()),
            ErrorQueueConfig::default()
                .with_capacity(capacity)
                .with_flush_retry(RetryConfig::new().with_max_attempts(1)),
        )
    }

    #[test]
    fn test_push_stamps_session_id() {
        let queue = queue_with(RecordingSink::new(), 10);
        queue.push(event("a"));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot[0].session_id, queue.session_id());
    }

    #[test]
    fn test_overflow_evicts_oldest_undelivered() {
        let queue = queue_with(RecordingSink::new(), 3);
        queue.push(event("a"));
        queue.push(event("b"));
        queue.push(event("c"));
        queue.push(event("d"));

        let names: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|e| e.boundary_name)
            .collect();
        assert_eq!(names, vec!["b", "c", "d"]);
        assert_eq!(queue.stats().evicted, 1);
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order_and_prunes() {
        let sink = RecordingSink::new();
        let queue = queue_with(sink.clone(), 10);

        let first = event("first");
        let second = event("second");
        let first_id = first.id;
        let second_id = second.id;
        queue.push(first);
        queue.push(second);

        let flushed = queue.flush().await.unwrap();
        assert_eq!(flushed, 2);
        assert!(queue.is_empty());
        assert_eq!(sink.delivered_ids(), vec![first_id, second_id]);
    }

    #[tokio::test]
    async fn test_failed_flush_leaves_events_queued() {
        let sink = RecordingSink::failing(1);
        let queue = queue_with(sink.clone(), 10);
        queue.push(event("a"));

        assert!(queue.flush().await.is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].retry_attempt, 1);

        // Collector recovered: next flush drains.
        assert_eq!(queue.flush().await.unwrap(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_batches_large_backlogs() {
        let sink = RecordingSink::new();
        let mut config = ErrorQueueConfig::default()
            .with_capacity(100)
            .with_flush_retry(RetryConfig::new().with_max_attempts(1));
        config.max_batch = 10;
        let queue = ErrorQueue::with_config(sink.clone(), Arc::new(BreakerRegistry::new()), config);

        for i in 0..25 {
            queue.push(event(&format!("e{}", i)));
        }
        assert_eq!(queue.flush().await.unwrap(), 25);
        assert_eq!(sink.delivered_ids().len(), 25);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_wakes_flusher_without_waiting_the_cadence() {
        let sink = RecordingSink::new();
        let mut config = ErrorQueueConfig::default()
            .with_flush_retry(RetryConfig::new().with_max_attempts(1));
        config.flush_interval = Duration::from_secs(60);
        let queue = Arc::new(ErrorQueue::with_config(
            sink.clone(),
            Arc::new(BreakerRegistry::new()),
            config,
        ));
        let (online_tx, online_rx) = watch::channel(true);
        queue.start_flusher(online_rx);

        queue.push(event("a"));
        let delivered = tokio::time::timeout(Duration::from_secs(2), async {
            while sink.delivered_ids().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(delivered.is_ok(), "push did not wake the flusher");

        queue.stop_flusher();
        drop(online_tx);
    }

    #[tokio::test]
    async fn test_flush_prunes_expired_events() {
        let sink = RecordingSink::new();
        let mut config = ErrorQueueConfig::default()
            .with_flush_retry(RetryConfig::new().with_max_attempts(1));
        config.event_ttl = Duration::from_secs(60);
        let queue = ErrorQueue::with_config(sink.clone(), Arc::new(BreakerRegistry::new()), config);

        let mut stale = event("stale");
        stale.timestamp = chrono::Utc::now() - chrono::Duration::minutes(5);
        let fresh = event("fresh");
        let fresh_id = fresh.id;
        queue.push(stale);
        queue.push(fresh);

        assert_eq!(queue.flush().await.unwrap(), 1);
        assert_eq!(sink.delivered_ids(), vec![fresh_id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_restore_overflow_is_a_capacity_error() {
        let queue = queue_with(RecordingSink::new(), 3);
        queue.push(event("live"));

        let saved: Vec<_> = (0..4).map(|i| event(&format!("saved{}", i))).collect();
        let result = queue.restore(saved);
        assert!(matches!(result, Err(CoreError::Capacity { limit: 3, .. })));
        // Whatever fit is kept, behind current entries.
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.snapshot()[0].boundary_name, "live");
    }

    #[tokio::test]
    async fn test_dead_collector_trips_breaker_not_a_spin() {
        let sink = RecordingSink::failing(u32::MAX);
        let breakers = Arc::new(BreakerRegistry::new());
        let queue = ErrorQueue::with_config(
            sink,
            Arc::clone(&breakers),
            ErrorQueueConfig::default()
                .with_flush_retry(RetryConfig::new().with_max_attempts(1)),
        );
        queue.push(event("a"));

        // Breaker threshold is 5; the 6th flush is refused fail-fast.
        for _ in 0..5 {
            assert!(queue.flush().await.is_err());
        }
        let result = queue.flush().await;
        assert!(matches!(result, Err(CoreError::CircuitOpen { .. })));
        assert_eq!(queue.len(), 1);
    }
}
