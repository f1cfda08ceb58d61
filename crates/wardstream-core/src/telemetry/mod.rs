//! Failure telemetry: capture, bounded queueing, and best-effort delivery.

mod event;
mod queue;
mod sink;

pub use event::{BoundaryTier, QueuedErrorEvent};
pub use queue::{ErrorQueue, ErrorQueueConfig, ErrorQueueStats};
pub use sink::{DynTelemetrySink, HttpTelemetrySink, TelemetrySink};
