//! Transport seam between the stream manager and the wire.
//!
//! The manager never touches sockets directly; it drives a
//! [`StreamTransport`] object. Production uses the HTTP event-stream
//! implementation in [`crate::stream::http`]; tests inject in-process fakes.

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::stream::message::{StreamFrame, StreamParams};
use crate::transport::TransportTuning;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event surfaced by an established stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// A decoded frame.
    Frame(StreamFrame),
    /// A frame that failed to decode. The manager drops it; repeated
    /// malformed frames break the connection.
    Malformed { message: String },
    /// Terminal: the server ended the stream. `clean` distinguishes a
    /// planned end-of-stream from an abrupt transport loss.
    Closed { clean: bool, message: Option<String> },
}

/// Handle to one established stream.
///
/// Events arrive in transport order. A `None` from
/// [`next_event`](Self::next_event) means the transport vanished without a
/// close event (the reader task died or the peer disappeared), which callers
/// treat like an unclean close.
pub struct StreamHandle {
    events: mpsc::Receiver<StreamEvent>,
    reader_cancel: CancellationToken,
}

impl StreamHandle {
    pub fn new(events: mpsc::Receiver<StreamEvent>, reader_cancel: CancellationToken) -> Self {
        Self {
            events,
            reader_cancel,
        }
    }

    /// Next event, in arrival order.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stop the underlying reader. Idempotent.
    pub fn close(&self) {
        self.reader_cancel.cancel();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

/// Opens one-way event streams, one per connect call.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a stream for `topic`.
    ///
    /// Resolves once the stream is acknowledged by the server; the manager
    /// bounds this with its connect timeout. The returned handle yields
    /// frames until a [`StreamEvent::Closed`] or transport loss.
    async fn connect(
        &self,
        topic: &str,
        params: &StreamParams,
        tuning: &TransportTuning,
    ) -> Result<StreamHandle>;
}

/// Shared trait object, the form the manager stores.
pub type DynStreamTransport = Arc<dyn StreamTransport>;
