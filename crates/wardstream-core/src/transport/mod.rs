//! Adaptive transport tuning from device and network conditions.

mod signals;
mod tuning;

pub use signals::{ConditionSnapshot, NetworkQuality, PowerState, VisibilityState};
pub use tuning::{AdaptiveTransportController, ConnectivityConfig, TransportTuning};
