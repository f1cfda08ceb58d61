//! Real-time topic streaming.
//!
//! This module provides:
//! - Wire frame types with a `kind` discriminator
//! - Per-topic connection state, ordering, and replay buffering
//! - The connection manager (one connection per topic, fan-out, reconnect)
//! - The transport seam and its HTTP event-stream implementation

mod connection;
mod http;
mod manager;
mod message;
mod transport;

pub use connection::{ConnectionState, ConnectionStats, StreamConnection};
pub use http::HttpStreamTransport;
pub use manager::{StreamManager, StreamManagerConfig, Subscription, SubscriptionHandle};
pub use message::{
    AlertSeverity, AnalysisDepth, FramePayload, ResultPhase, StreamFrame, StreamParams,
};
pub use transport::{DynStreamTransport, StreamEvent, StreamHandle, StreamTransport};
