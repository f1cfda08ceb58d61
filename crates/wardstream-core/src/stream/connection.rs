//! Per-topic connection state and bookkeeping.
//!
//! A `StreamConnection` is the manager's record of one logical subscription
//! to a topic's event stream: its lifecycle state, reconnect count,
//! duplicate-suppression watermark, and a bounded replay buffer for late
//! subscribers.

use crate::stream::message::StreamFrame;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle state of a topic's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, no attempt issued yet.
    Idle,
    /// First connection attempt in flight.
    Connecting,
    /// Live; frames are flowing.
    Connected,
    /// Transport lost or breaker cooling down; re-attempts in progress.
    /// Subscribers observe this as one sustained state, not a failure flood.
    Reconnecting,
    /// Terminal: an explicitly fatal error ended the stream.
    Error,
    /// Terminal: closed cleanly (server end-of-stream, last unsubscribe, or
    /// manager shutdown).
    Closed,
}

impl ConnectionState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// One logical subscription to a topic's event stream.
pub struct StreamConnection {
    topic: String,
    state_tx: watch::Sender<ConnectionState>,
    /// Reconnect attempts since the last successful connect.
    retry_count: AtomicU32,
    /// Highest sequence number delivered; 0 before any sequenced frame.
    last_seq: AtomicU64,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    /// Replay buffer of recently delivered frames, oldest first.
    buffer: Mutex<VecDeque<StreamFrame>>,
    buffer_capacity: usize,
}

impl StreamConnection {
    pub fn new(topic: impl Into<String>, buffer_capacity: usize) -> Self {
        let now = Instant::now();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            topic: topic.into(),
            state_tx,
            retry_count: AtomicU32::new(0),
            last_seq: AtomicU64::new(0),
            created_at: now,
            last_activity: RwLock::new(now),
            buffer: Mutex::new(VecDeque::with_capacity(buffer_capacity)),
            buffer_capacity,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch receiver for state observation by subscribers.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Transition to a new state.
    ///
    /// Terminal states are sticky: a transition out of `Error` or `Closed`
    /// is ignored, so a late timer cannot resurrect a torn-down connection.
    pub fn set_state(&self, next: ConnectionState) {
        let current = self.state();
        if current == next || current.is_terminal() {
            return;
        }
        info!("Stream {}: {} -> {}", self.topic, current, next);
        self.state_tx.send_replace(next);
    }

    // === Activity ===

    pub fn touch_activity(&self) {
        *self.last_activity.write().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().unwrap().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    // === Reconnect bookkeeping ===

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn record_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_retries(&self) {
        self.retry_count.store(0, Ordering::SeqCst);
    }

    // === Ordering / duplicate suppression ===

    /// Record a frame's sequence number, returning `false` for a duplicate.
    ///
    /// The watermark survives reconnects, so a frame replayed by the server
    /// after a reconnect is suppressed. Unsequenced frames (heartbeats)
    /// always pass.
    pub fn accept_seq(&self, frame: &StreamFrame) -> bool {
        let Some(seq) = frame.seq else {
            return true;
        };
        let previous = self.last_seq.fetch_max(seq, Ordering::SeqCst);
        if previous >= seq {
            debug!(
                "Stream {}: dropping duplicate frame seq {} (seen {})",
                self.topic, seq, previous
            );
            return false;
        }
        true
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    // === Replay buffer ===

    /// Retain a delivered frame for late subscribers.
    ///
    /// Bounded: overflow drops the oldest buffered frame, never the one
    /// being appended.
    pub fn buffer_frame(&self, frame: StreamFrame) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() >= self.buffer_capacity {
            buffer.pop_front();
        }
        buffer.push_back(frame);
    }

    /// Snapshot of the replay buffer, oldest first.
    pub fn buffered(&self) -> Vec<StreamFrame> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Stats snapshot for the status surface.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            topic: self.topic.clone(),
            state: self.state(),
            retry_count: self.retry_count(),
            last_seq: self.last_seq(),
            buffered_frames: self.buffered_len(),
            age: self.age(),
            idle_for: self.idle_for(),
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub topic: String,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_seq: u64,
    pub buffered_frames: usize,
    pub age: Duration,
    pub idle_for: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::message::FramePayload;

    fn frame(seq: u64) -> StreamFrame {
        StreamFrame {
            seq: Some(seq),
            payload: FramePayload::Progress {
                stage: "tally".into(),
                percent: None,
            },
        }
    }

    #[test]
    fn test_state_transitions_logged_and_observable() {
        let conn = StreamConnection::new("ward-1", 10);
        assert_eq!(conn.state(), ConnectionState::Idle);

        let rx = conn.watch_state();
        conn.set_state(ConnectionState::Connecting);
        conn.set_state(ConnectionState::Connected);
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let conn = StreamConnection::new("ward-1", 10);
        conn.set_state(ConnectionState::Connecting);
        conn.set_state(ConnectionState::Closed);
        conn.set_state(ConnectionState::Connected);
        assert_eq!(conn.state(), ConnectionState::Closed);

        let conn = StreamConnection::new("ward-2", 10);
        conn.set_state(ConnectionState::Error);
        conn.set_state(ConnectionState::Reconnecting);
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[test]
    fn test_duplicate_suppression() {
        let conn = StreamConnection::new("ward-1", 10);
        assert!(conn.accept_seq(&frame(1)));
        assert!(conn.accept_seq(&frame(2)));
        assert!(conn.accept_seq(&frame(5)));

        // Replay after a reconnect: already-seen sequence numbers drop.
        assert!(!conn.accept_seq(&frame(5)));
        assert!(!conn.accept_seq(&frame(3)));
        assert!(conn.accept_seq(&frame(6)));
        assert_eq!(conn.last_seq(), 6);
    }

    #[test]
    fn test_unsequenced_frames_always_pass() {
        let conn = StreamConnection::new("ward-1", 10);
        let heartbeat = StreamFrame {
            seq: None,
            payload: FramePayload::Heartbeat,
        };
        assert!(conn.accept_seq(&heartbeat));
        assert!(conn.accept_seq(&heartbeat));
    }

    #[test]
    fn test_replay_buffer_drops_oldest() {
        let conn = StreamConnection::new("ward-1", 3);
        for seq in 1..=5 {
            conn.buffer_frame(frame(seq));
        }
        let buffered = conn.buffered();
        assert_eq!(buffered.len(), 3);
        assert_eq!(buffered[0].seq, Some(3));
        assert_eq!(buffered[2].seq, Some(5));
    }

    #[test]
    fn test_retry_bookkeeping() {
        let conn = StreamConnection::new("ward-1", 10);
        assert_eq!(conn.record_retry(), 1);
        assert_eq!(conn.record_retry(), 2);
        conn.reset_retries();
        assert_eq!(conn.retry_count(), 0);
    }
}
