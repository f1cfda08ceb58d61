//! Wardstream - Resilient real-time streaming core for the Wardstream
//! political-intelligence dashboard.
//!
//! This crate keeps live analysis streams usable on unreliable networks:
//! per-topic circuit breakers with growing cooldowns, a connection manager
//! that guarantees one connection per topic with subscriber fan-out, an
//! adaptive transport controller that tunes heartbeats and payload limits to
//! the device's conditions, a bounded error queue for failure telemetry, and
//! fault isolation boundaries that keep a broken widget from taking down its
//! siblings.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wardstream::{
//!     AdaptiveTransportController, BreakerRegistry, ErrorQueue,
//!     HttpStreamTransport, HttpTelemetrySink, StreamManager, StreamParams,
//! };
//!
//! #[tokio::main]
//! async fn main() -> wardstream::Result<()> {
//!     let controller = Arc::new(AdaptiveTransportController::new()?);
//!     let breakers = Arc::new(BreakerRegistry::new());
//!     let collector = "https://api.example.test/errors".parse().unwrap();
//!     let telemetry = Arc::new(ErrorQueue::new(
//!         Arc::new(HttpTelemetrySink::new(collector, Duration::from_secs(10))?),
//!         Arc::clone(&breakers),
//!     ));
//!     telemetry.start_flusher(controller.online_watch());
//!
//!     let manager = StreamManager::new(
//!         Arc::new(HttpStreamTransport::new("https://api.example.test/v1/")?),
//!         Arc::clone(&controller),
//!         breakers,
//!         telemetry,
//!     );
//!
//!     let mut sub = manager.subscribe("ward-7", StreamParams::default()).await?;
//!     while let Some(frame) = sub.next_frame().await {
//!         println!("{}: {:?}", frame.kind(), frame.seq);
//!     }
//!     Ok(())
//! }
//! ```

pub mod boundary;
pub mod cancel;
pub mod config;
pub mod error;
pub mod resilience;
pub mod stream;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use boundary::{BoundaryConfig, BoundaryStats, BoundaryStatus, FaultBoundary};
pub use cancel::CancellationToken;
pub use error::{CoreError, ErrorClass, Result};
pub use resilience::{
    retry_async, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig,
};
pub use stream::{
    AnalysisDepth, ConnectionState, FramePayload, HttpStreamTransport, StreamFrame, StreamManager,
    StreamManagerConfig, StreamParams, StreamTransport, Subscription, SubscriptionHandle,
};
pub use telemetry::{
    BoundaryTier, ErrorQueue, ErrorQueueConfig, HttpTelemetrySink, QueuedErrorEvent, TelemetrySink,
};
pub use transport::{
    AdaptiveTransportController, ConnectivityConfig, NetworkQuality, PowerState, TransportTuning,
    VisibilityState,
};
