//! Stream connection manager.
//!
//! Owns the pool of live per-topic connections, enforces the
//! at-most-one-connection-per-topic invariant, and fans decoded frames out
//! to subscribers in arrival order. Reconnection is driven per topic by a
//! background driver task: fresh tuning from the adaptive controller, each
//! attempt gated through the circuit breaker keyed by the topic.

use crate::cancel::{sleep_unless_cancelled, CancellationToken};
use crate::config::StreamConfig;
use crate::error::{CoreError, Result};
use crate::resilience::{BreakerRegistry, RetryConfig};
use crate::stream::connection::{ConnectionState, ConnectionStats, StreamConnection};
use crate::stream::message::{FramePayload, StreamFrame, StreamParams};
use crate::stream::transport::{DynStreamTransport, StreamEvent, StreamHandle};
use crate::telemetry::{BoundaryTier, ErrorQueue, QueuedErrorEvent};
use crate::transport::AdaptiveTransportController;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Configuration for the stream manager.
#[derive(Debug, Clone)]
pub struct StreamManagerConfig {
    /// Window in which a connect must be acknowledged.
    pub connect_ack_timeout: Duration,
    /// How long a topic survives its last unsubscribe.
    pub close_grace_period: Duration,
    /// Replay buffer depth per connection.
    pub replay_buffer_frames: usize,
    /// Per-subscriber channel capacity; a lagging subscriber loses frames
    /// rather than stalling the fan-out.
    pub subscriber_channel_capacity: usize,
    /// How often a reconnecting driver re-checks an open breaker.
    pub breaker_poll_interval: Duration,
    /// Consecutive malformed frames before the connection is torn down.
    pub malformed_frame_tolerance: u32,
    /// Backoff policy spacing reconnect attempts. Each connect is a single
    /// breaker-gated attempt; the driver loop owns the spacing, so this is
    /// the one authoritative backoff for connections.
    pub reconnect_backoff: RetryConfig,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            connect_ack_timeout: StreamConfig::CONNECT_ACK_TIMEOUT,
            close_grace_period: StreamConfig::CLOSE_GRACE_PERIOD,
            replay_buffer_frames: StreamConfig::REPLAY_BUFFER_FRAMES,
            subscriber_channel_capacity: StreamConfig::SUBSCRIBER_CHANNEL_CAPACITY,
            breaker_poll_interval: StreamConfig::BREAKER_POLL_INTERVAL,
            malformed_frame_tolerance: StreamConfig::MALFORMED_FRAME_TOLERANCE,
            reconnect_backoff: RetryConfig::default(),
        }
    }
}

impl StreamManagerConfig {
    /// Preset for memory-constrained or low-end device profiles.
    pub fn constrained() -> Self {
        Self {
            replay_buffer_frames: StreamConfig::REPLAY_BUFFER_FRAMES_CONSTRAINED,
            subscriber_channel_capacity: StreamConfig::SUBSCRIBER_CHANNEL_CAPACITY / 2,
            ..Self::default()
        }
    }
}

/// Opaque handle identifying one subscriber attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// One subscriber's view of a topic stream.
///
/// Dropping a subscription detaches it, as if
/// [`unsubscribe`](StreamManager::unsubscribe) had been called.
pub struct Subscription {
    handle: SubscriptionHandle,
    frames: mpsc::Receiver<StreamFrame>,
    state: watch::Receiver<ConnectionState>,
    manager: Weak<ManagerInner>,
}

impl Subscription {
    /// The opaque handle used to unsubscribe.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn topic(&self) -> &str {
        &self.handle.topic
    }

    /// Next frame for this subscriber, in per-topic arrival order.
    ///
    /// `None` once the manager drops the sender (topic closed and removed).
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    /// Non-blocking poll for the next frame.
    pub fn try_next_frame(&mut self) -> Option<StreamFrame> {
        self.frames.try_recv().ok()
    }

    /// Current connection state for the topic.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch receiver for state-change observation.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let handle = self.handle.clone();
        // Detaching takes the topics lock, so it has to run as a task. If
        // the runtime is already gone the manager is being torn down anyway.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                detach(&inner, &handle).await;
            });
        }
    }
}

struct TopicEntry {
    connection: Arc<StreamConnection>,
    subscribers: HashMap<u64, mpsc::Sender<StreamFrame>>,
    driver_cancel: CancellationToken,
    /// Bumped on every attach/detach; a pending grace close aborts if the
    /// generation moved under it.
    grace_generation: u64,
}

struct ManagerInner {
    topics: Mutex<HashMap<String, TopicEntry>>,
    transport: DynStreamTransport,
    controller: Arc<AdaptiveTransportController>,
    breakers: Arc<BreakerRegistry>,
    telemetry: Arc<ErrorQueue>,
    config: StreamManagerConfig,
    next_subscriber_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Owns all per-topic stream connections.
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    pub fn new(
        transport: DynStreamTransport,
        controller: Arc<AdaptiveTransportController>,
        breakers: Arc<BreakerRegistry>,
        telemetry: Arc<ErrorQueue>,
    ) -> Self {
        Self::with_config(
            transport,
            controller,
            breakers,
            telemetry,
            StreamManagerConfig::default(),
        )
    }

    pub fn with_config(
        transport: DynStreamTransport,
        controller: Arc<AdaptiveTransportController>,
        breakers: Arc<BreakerRegistry>,
        telemetry: Arc<ErrorQueue>,
        config: StreamManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                topics: Mutex::new(HashMap::new()),
                transport,
                controller,
                breakers,
                telemetry,
                config,
                next_subscriber_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register interest in a topic's stream.
    ///
    /// If a live connection exists for the topic the subscriber attaches to
    /// it (fan-out) and receives the replay buffer as backlog; otherwise a
    /// connection is created. The existence check and the registration
    /// happen under one lock hold with no await between them, which is what
    /// makes N concurrent subscribes produce exactly one connection.
    pub async fn subscribe(&self, topic: &str, params: StreamParams) -> Result<Subscription> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CoreError::ShutDown);
        }

        let mut topics = self.inner.topics.lock().await;

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        // The channel must hold at least a full replay buffer, or a late
        // subscriber loses the oldest backlog frames in the try_send replay.
        let capacity = self
            .inner
            .config
            .subscriber_channel_capacity
            .max(self.inner.config.replay_buffer_frames);
        let (tx, rx) = mpsc::channel(capacity);
        let handle = SubscriptionHandle {
            id,
            topic: topic.to_string(),
        };

        if let Some(entry) = topics.get_mut(topic) {
            if !entry.connection.state().is_terminal() {
                // Attach to the existing connection; invalidate any pending
                // grace close.
                entry.grace_generation += 1;
                for frame in entry.connection.buffered() {
                    let _ = tx.try_send(frame);
                }
                let state = entry.connection.watch_state();
                entry.subscribers.insert(id, tx);
                debug!(
                    "Subscriber {} attached to existing stream {} ({} total)",
                    id,
                    topic,
                    entry.subscribers.len()
                );
                return Ok(Subscription {
                    handle,
                    frames: rx,
                    state,
                    manager: Arc::downgrade(&self.inner),
                });
            }
            // Terminal leftover: tear it out and build anew.
            entry.driver_cancel.cancel();
            topics.remove(topic);
        }

        let connection = Arc::new(StreamConnection::new(
            topic,
            self.inner.config.replay_buffer_frames,
        ));
        let driver_cancel = CancellationToken::new();
        let state = connection.watch_state();

        let mut subscribers = HashMap::new();
        subscribers.insert(id, tx);
        topics.insert(
            topic.to_string(),
            TopicEntry {
                connection: Arc::clone(&connection),
                subscribers,
                driver_cancel: driver_cancel.clone(),
                grace_generation: 0,
            },
        );
        drop(topics);

        info!("Opening stream for topic {} (subscriber {})", topic, id);
        let inner = Arc::clone(&self.inner);
        let topic_owned = topic.to_string();
        tokio::spawn(async move {
            drive_connection(inner, topic_owned, params, connection, driver_cancel).await;
        });

        Ok(Subscription {
            handle,
            frames: rx,
            state,
            manager: Arc::downgrade(&self.inner),
        })
    }

    /// Detach a subscriber.
    ///
    /// When the topic's subscriber count reaches zero the connection is
    /// closed after a grace period, absorbing rapid resubscribes. Calling
    /// this twice with the same handle is a no-op.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        detach(&self.inner, handle).await;
    }

    /// Current state for a topic, if the manager knows it.
    pub async fn topic_state(&self, topic: &str) -> Option<ConnectionState> {
        let topics = self.inner.topics.lock().await;
        topics.get(topic).map(|e| e.connection.state())
    }

    /// Latest buffered frames for a topic (oldest first).
    pub async fn buffered(&self, topic: &str) -> Vec<StreamFrame> {
        let topics = self.inner.topics.lock().await;
        topics
            .get(topic)
            .map(|e| e.connection.buffered())
            .unwrap_or_default()
    }

    /// Current subscriber count for a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.lock().await;
        topics.get(topic).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// Stats for every known connection.
    pub async fn stats(&self) -> Vec<ConnectionStats> {
        let topics = self.inner.topics.lock().await;
        topics.values().map(|e| e.connection.stats()).collect()
    }

    /// Close every connection and refuse further subscriptions.
    ///
    /// Cancels all drivers and pending grace/reconnect timers. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut topics = self.inner.topics.lock().await;
        for (topic, entry) in topics.drain() {
            debug!("Shutting down stream for {}", topic);
            entry.driver_cancel.cancel();
            entry.connection.set_state(ConnectionState::Closed);
        }
        info!("Stream manager shut down");
    }
}

/// Close the topic after the grace period unless someone re-attached.
async fn detach(inner: &Arc<ManagerInner>, handle: &SubscriptionHandle) {
    let mut topics = inner.topics.lock().await;
    let Some(entry) = topics.get_mut(&handle.topic) else {
        return;
    };
    if entry.subscribers.remove(&handle.id).is_none() {
        return;
    }
    debug!(
        "Subscriber {} detached from {} ({} remaining)",
        handle.id,
        handle.topic,
        entry.subscribers.len()
    );
    if entry.subscribers.is_empty() {
        schedule_grace_close(inner, &handle.topic, entry);
    }
}

fn schedule_grace_close(inner: &Arc<ManagerInner>, topic: &str, entry: &mut TopicEntry) {
    entry.grace_generation += 1;
    let generation = entry.grace_generation;
    let grace = inner.config.close_grace_period;
    let cancel = entry.driver_cancel.clone();
    let inner = Arc::clone(inner);
    let topic = topic.to_string();

    tokio::spawn(async move {
        if !sleep_unless_cancelled(grace, &cancel).await {
            return;
        }
        let mut topics = inner.topics.lock().await;
        let Some(entry) = topics.get(&topic) else {
            return;
        };
        if entry.grace_generation != generation || !entry.subscribers.is_empty() {
            // Someone resubscribed during the grace window.
            return;
        }
        info!("Closing idle stream for {} after grace period", topic);
        entry.driver_cancel.cancel();
        entry.connection.set_state(ConnectionState::Closed);
        topics.remove(&topic);
    });
}

/// Fan a frame out to every subscriber of a topic, buffering it for late
/// arrivals. Subscribers whose receiver is gone are detached lazily.
async fn deliver(inner: &Arc<ManagerInner>, topic: &str, frame: StreamFrame) {
    let mut topics = inner.topics.lock().await;
    let Some(entry) = topics.get_mut(topic) else {
        return;
    };
    entry.connection.buffer_frame(frame.clone());

    let mut dead = Vec::new();
    for (id, tx) in &entry.subscribers {
        match tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A slow subscriber loses this frame; in-flight delivery to
                // the others is never held up.
                warn!("Subscriber {} lagging on {}, dropping frame", id, topic);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
        }
    }
    for id in dead {
        entry.subscribers.remove(&id);
        debug!("Subscriber {} of {} went away, detaching", id, topic);
    }
    if entry.subscribers.is_empty() {
        schedule_grace_close(inner, topic, entry);
    }
}

/// Why the frame-reading loop ended.
enum Disposition {
    /// Driver was cancelled (unsubscribe, grace close, shutdown).
    Cancelled,
    /// Server ended the stream deliberately; not retried.
    CleanClose,
    /// Explicit fatal error; not retried.
    Fatal,
    /// Transport loss or protocol breakdown; reconnect.
    Lost,
}

/// Per-topic driver: connect, read, reconnect, until cancelled or terminal.
async fn drive_connection(
    inner: Arc<ManagerInner>,
    topic: String,
    params: StreamParams,
    connection: Arc<StreamConnection>,
    cancel: CancellationToken,
) {
    let mut ever_connected = false;

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }

        // Offline: no active attempts; idle until connectivity returns.
        if inner.controller.is_offline() {
            connection.set_state(if ever_connected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
            if !wait_until_online(&inner.controller, &cancel).await {
                break;
            }
        }

        connection.set_state(if ever_connected || connection.retry_count() > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });

        // Fresh tuning per attempt: network quality may have changed since
        // the connection was first opened.
        let tuning = inner.controller.tuning();
        let ack_timeout = inner.config.connect_ack_timeout;
        let single_attempt = RetryConfig::new().with_max_attempts(1);

        let attempt = inner
            .breakers
            .execute(
                &topic,
                &single_attempt,
                || {
                    let fut = inner.transport.connect(&topic, &params, &tuning);
                    async move {
                        match tokio::time::timeout(ack_timeout, fut).await {
                            Ok(result) => result,
                            Err(_) => Err(CoreError::Timeout(ack_timeout)),
                        }
                    }
                },
                None,
            )
            .await;

        let mut handle = match attempt {
            Ok(handle) => handle,
            Err(CoreError::CircuitOpen { .. }) => {
                // Stay in one sustained reconnecting state while the breaker
                // cools down; no failure flood reaches subscribers.
                if !sleep_unless_cancelled(inner.config.breaker_poll_interval, &cancel).await {
                    break;
                }
                continue;
            }
            Err(e) if e.is_fatal() => {
                report_stream_fault(&inner, &topic, &e.to_string(), BoundaryTier::Critical);
                connection.set_state(ConnectionState::Error);
                break;
            }
            Err(e) => {
                let retries = connection.record_retry();
                let delay = inner
                    .config
                    .reconnect_backoff
                    .calculate_delay(retries.saturating_sub(1).min(10));
                warn!(
                    "Connect attempt {} for {} failed: {}. Next attempt in {:?}",
                    retries, topic, e, delay
                );
                if !sleep_unless_cancelled(delay, &cancel).await {
                    break;
                }
                continue;
            }
        };

        ever_connected = true;
        connection.reset_retries();
        connection.touch_activity();
        connection.set_state(ConnectionState::Connected);

        match read_frames(&inner, &topic, &connection, &mut handle, &cancel).await {
            Disposition::Cancelled => break,
            Disposition::CleanClose => {
                info!("Server closed stream for {} cleanly", topic);
                connection.set_state(ConnectionState::Closed);
                break;
            }
            Disposition::Fatal => {
                connection.set_state(ConnectionState::Error);
                break;
            }
            Disposition::Lost => {
                handle.close();
                warn!("Stream for {} lost, reconnecting", topic);
                continue 'reconnect;
            }
        }
    }

    if !connection.state().is_terminal() {
        connection.set_state(ConnectionState::Closed);
    }
}

/// Read frames until the stream ends one way or another.
async fn read_frames(
    inner: &Arc<ManagerInner>,
    topic: &str,
    connection: &Arc<StreamConnection>,
    handle: &mut StreamHandle,
    cancel: &CancellationToken,
) -> Disposition {
    let mut malformed_streak = 0u32;

    loop {
        // Two missed heartbeats mean the stream is stalled, not idle.
        let stall_window = inner
            .controller
            .tuning()
            .heartbeat_interval
            .saturating_mul(2);

        let event = tokio::select! {
            _ = cancel.cancelled() => return Disposition::Cancelled,
            event = handle.next_event() => event,
            _ = tokio::time::sleep(stall_window) => {
                warn!(
                    "No frames on {} within {:?}, treating stream as stalled",
                    topic, stall_window
                );
                return Disposition::Lost;
            }
        };

        match event {
            None => return Disposition::Lost,
            Some(StreamEvent::Closed { clean: true, .. }) => return Disposition::CleanClose,
            Some(StreamEvent::Closed {
                clean: false,
                message,
            }) => {
                debug!(
                    "Stream for {} closed abruptly: {}",
                    topic,
                    message.as_deref().unwrap_or("no reason given")
                );
                return Disposition::Lost;
            }
            Some(StreamEvent::Malformed { message }) => {
                malformed_streak += 1;
                warn!(
                    "Malformed frame on {} ({} consecutive): {}",
                    topic, malformed_streak, message
                );
                if malformed_streak >= inner.config.malformed_frame_tolerance {
                    report_stream_fault(
                        inner,
                        topic,
                        &format!("{} consecutive malformed frames", malformed_streak),
                        BoundaryTier::Feature,
                    );
                    return Disposition::Lost;
                }
            }
            Some(StreamEvent::Frame(frame)) => {
                malformed_streak = 0;
                connection.touch_activity();

                if frame.is_heartbeat() {
                    continue;
                }
                if !connection.accept_seq(&frame) {
                    continue;
                }

                if let FramePayload::Error { fatal, message } = &frame.payload {
                    // Error frames go to the reporting path, not to
                    // subscribers; only a fatal flag ends the stream.
                    let tier = if *fatal {
                        BoundaryTier::Critical
                    } else {
                        BoundaryTier::Feature
                    };
                    report_stream_fault(inner, topic, message, tier);
                    if *fatal {
                        return Disposition::Fatal;
                    }
                } else {
                    deliver(inner, topic, frame).await;
                }
            }
        }
    }
}

fn report_stream_fault(inner: &Arc<ManagerInner>, topic: &str, message: &str, tier: BoundaryTier) {
    inner.telemetry.push(
        QueuedErrorEvent::for_stream(topic, tier, message)
            .with_context("source", "stream-manager"),
    );
}

/// Wait for the connectivity watch to flip online. `false` on cancellation.
async fn wait_until_online(
    controller: &AdaptiveTransportController,
    cancel: &CancellationToken,
) -> bool {
    let mut online = controller.online_watch();
    loop {
        if *online.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = online.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}
