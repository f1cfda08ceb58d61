//! Adaptive transport controller.
//!
//! Derives heartbeat interval, payload ceiling, and batching behavior from
//! the latest network-quality, power, and visibility samples. The controller
//! is purely advisory: it produces [`TransportTuning`] snapshots and an
//! online/offline watch; it never opens or closes connections itself.

use crate::cancel::sleep_unless_cancelled;
use crate::config::{ConnectivityDefaults, TransportPolicy};
use crate::error::Result;
use crate::transport::signals::{
    ConditionSnapshot, NetworkQuality, PowerState, VisibilityState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Tuning snapshot consumed by the stream layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTuning {
    /// Expected heartbeat spacing; a silent connection past this window is
    /// treated as stalled.
    pub heartbeat_interval: Duration,
    /// Largest frame the client advertises willingness to receive.
    pub max_message_bytes: usize,
    /// Server-side batching hint (frames per flush).
    pub batch_size: u32,
    /// Whether payload compression is requested on this link.
    pub compression_enabled: bool,
}

/// Configuration for connectivity probing.
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// URLs probed (in order) to distinguish offline from a failing origin.
    pub probe_urls: Vec<String>,
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// How often to re-check connectivity while offline.
    pub offline_recheck_interval: Duration,
    /// How often to verify connectivity while online.
    pub online_verify_interval: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_urls: Vec::new(),
            probe_timeout: ConnectivityDefaults::PROBE_TIMEOUT,
            offline_recheck_interval: ConnectivityDefaults::OFFLINE_RECHECK_INTERVAL,
            online_verify_interval: ConnectivityDefaults::ONLINE_VERIFY_INTERVAL,
        }
    }
}

/// Samples device and network signals; exposes tuning snapshots.
pub struct AdaptiveTransportController {
    /// Latest sample of each signal kind.
    conditions: RwLock<ConditionSnapshot>,
    /// Online/offline watch for the error queue and stream manager.
    online_tx: watch::Sender<bool>,
    /// Probe client, built once.
    probe_client: reqwest::Client,
    config: ConnectivityConfig,
    monitoring_active: AtomicBool,
    monitor_cancel: crate::cancel::CancellationToken,
}

impl AdaptiveTransportController {
    /// Create a controller with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ConnectivityConfig::default())
    }

    /// Create a controller with custom probe configuration.
    pub fn with_config(config: ConnectivityConfig) -> Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()?;
        let (online_tx, _) = watch::channel(true);
        Ok(Self {
            conditions: RwLock::new(ConditionSnapshot::default()),
            online_tx,
            probe_client,
            config,
            monitoring_active: AtomicBool::new(false),
            monitor_cancel: crate::cancel::CancellationToken::new(),
        })
    }

    // === Signal intake ===

    /// Record a network-quality sample.
    pub fn observe_network(&self, quality: NetworkQuality) {
        let previous = {
            let mut conditions = self.conditions.write().unwrap();
            let previous = conditions.network;
            conditions.network = quality;
            previous
        };

        if previous != quality {
            debug!("Network quality {} -> {}", previous, quality);
        }
        if previous == NetworkQuality::Offline && quality.is_usable() {
            info!("Network connectivity restored ({})", quality);
        }
        if quality == NetworkQuality::Offline && previous.is_usable() {
            warn!("Network connectivity lost");
        }
        self.online_tx.send_replace(quality.is_usable());
    }

    /// Record a power sample.
    pub fn observe_power(&self, power: PowerState) {
        self.conditions.write().unwrap().power = power;
    }

    /// Record a visibility sample.
    pub fn observe_visibility(&self, visibility: VisibilityState) {
        self.conditions.write().unwrap().visibility = visibility;
    }

    /// The latest sample of every signal.
    pub fn conditions(&self) -> ConditionSnapshot {
        *self.conditions.read().unwrap()
    }

    /// Whether the network is known to be down.
    pub fn is_offline(&self) -> bool {
        self.conditions().network == NetworkQuality::Offline
    }

    /// Watch channel carrying `true` while the network is usable.
    pub fn online_watch(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    // === Tuning ===

    /// Compute the current tuning snapshot from the policy table.
    pub fn tuning(&self) -> TransportTuning {
        let snapshot = self.conditions();

        let (mut heartbeat, max_message_bytes, batch_size, compression_enabled) =
            match snapshot.network {
                NetworkQuality::Excellent | NetworkQuality::Good | NetworkQuality::Unknown => (
                    TransportPolicy::HEARTBEAT_EXCELLENT,
                    TransportPolicy::MAX_MESSAGE_BYTES_EXCELLENT,
                    TransportPolicy::BATCH_EXCELLENT,
                    false,
                ),
                NetworkQuality::Fair => (
                    TransportPolicy::HEARTBEAT_FAIR,
                    TransportPolicy::MAX_MESSAGE_BYTES_FAIR,
                    TransportPolicy::BATCH_FAIR,
                    true,
                ),
                NetworkQuality::Poor => (
                    TransportPolicy::HEARTBEAT_POOR,
                    TransportPolicy::MAX_MESSAGE_BYTES_POOR,
                    TransportPolicy::BATCH_POOR,
                    true,
                ),
                NetworkQuality::Offline => (
                    TransportPolicy::HEARTBEAT_OFFLINE,
                    TransportPolicy::MAX_MESSAGE_BYTES_POOR,
                    TransportPolicy::BATCH_EXCELLENT,
                    false,
                ),
            };

        // Low power doubles every interval regardless of network quality.
        if snapshot.power.is_low(TransportPolicy::LOW_POWER_THRESHOLD) {
            heartbeat *= 2;
        }
        // A backgrounded client relaxes intervals further.
        if snapshot.visibility.is_backgrounded() {
            heartbeat = heartbeat.mul_f64(TransportPolicy::BACKGROUND_RELAX_FACTOR);
        }

        TransportTuning {
            heartbeat_interval: heartbeat,
            max_message_bytes,
            batch_size,
            compression_enabled,
        }
    }

    // === Connectivity probing ===

    /// Probe configured endpoints to confirm or refute connectivity.
    ///
    /// Returns the resulting quality bucket: `Good` when any probe answers
    /// (explicit [`observe_network`](Self::observe_network) samples refine
    /// the bucket further), `Offline` when all probes fail. With no probe
    /// URLs configured the current sample is left untouched.
    pub async fn check_connectivity(&self) -> NetworkQuality {
        if self.config.probe_urls.is_empty() {
            return self.conditions().network;
        }

        for url in &self.config.probe_urls {
            match self.probe_url(url).await {
                true => {
                    // Only coarsen an Unknown/Offline sample; a finer bucket
                    // from the embedder wins.
                    let current = self.conditions().network;
                    if !current.is_usable() || current == NetworkQuality::Unknown {
                        self.observe_network(NetworkQuality::Good);
                    }
                    return self.conditions().network;
                }
                false => {
                    debug!("Probe failed for {}", url);
                    continue;
                }
            }
        }

        self.observe_network(NetworkQuality::Offline);
        NetworkQuality::Offline
    }

    async fn probe_url(&self, url: &str) -> bool {
        match self.probe_client.head(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                // Any answer at all proves the link; even a 4xx means the
                // packet made a round trip.
                status.is_success() || status.is_redirection() || status.is_client_error()
            }
            Err(e) => {
                debug!("Probe request failed: {}", e);
                false
            }
        }
    }

    // === Background monitoring ===

    /// Start periodic connectivity checks in a background task.
    ///
    /// Idempotent: a second call while monitoring is active is a no-op.
    pub fn start_monitoring(self: &Arc<Self>) {
        if self.monitoring_active.swap(true, Ordering::SeqCst) {
            debug!("Connectivity monitoring already active");
            return;
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting connectivity monitoring");

            while controller.monitoring_active.load(Ordering::SeqCst) {
                let interval = if controller.is_offline() {
                    controller.config.offline_recheck_interval
                } else {
                    controller.config.online_verify_interval
                };

                if !sleep_unless_cancelled(interval, &controller.monitor_cancel).await {
                    break;
                }
                if !controller.monitoring_active.load(Ordering::SeqCst) {
                    break;
                }

                controller.check_connectivity().await;
            }

            info!("Connectivity monitoring stopped");
        });
    }

    /// Stop background monitoring. Idempotent.
    pub fn stop_monitoring(&self) {
        self.monitoring_active.store(false, Ordering::SeqCst);
        self.monitor_cancel.cancel();
    }

    /// Whether background monitoring is active.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring_active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportPolicy;

    fn controller() -> AdaptiveTransportController {
        AdaptiveTransportController::new().unwrap()
    }

    #[test]
    fn test_policy_table_buckets() {
        let c = controller();

        c.observe_network(NetworkQuality::Excellent);
        let t = c.tuning();
        assert_eq!(t.heartbeat_interval, TransportPolicy::HEARTBEAT_EXCELLENT);
        assert_eq!(t.batch_size, 1);
        assert!(!t.compression_enabled);

        c.observe_network(NetworkQuality::Fair);
        let t = c.tuning();
        assert_eq!(t.heartbeat_interval, TransportPolicy::HEARTBEAT_FAIR);
        assert_eq!(t.batch_size, 2);
        assert!(t.compression_enabled);

        c.observe_network(NetworkQuality::Poor);
        let t = c.tuning();
        assert_eq!(t.heartbeat_interval, TransportPolicy::HEARTBEAT_POOR);
        assert_eq!(t.batch_size, 3);
        assert!(t.max_message_bytes < TransportPolicy::MAX_MESSAGE_BYTES_EXCELLENT);

        c.observe_network(NetworkQuality::Offline);
        let t = c.tuning();
        assert_eq!(t.heartbeat_interval, TransportPolicy::HEARTBEAT_OFFLINE);
    }

    #[test]
    fn test_low_power_doubles_intervals() {
        let c = controller();
        c.observe_network(NetworkQuality::Good);
        let baseline = c.tuning().heartbeat_interval;

        c.observe_power(PowerState::Battery(10));
        assert_eq!(c.tuning().heartbeat_interval, baseline * 2);

        // Doubling applies regardless of quality bucket.
        c.observe_network(NetworkQuality::Poor);
        assert_eq!(
            c.tuning().heartbeat_interval,
            TransportPolicy::HEARTBEAT_POOR * 2
        );
    }

    #[test]
    fn test_backgrounding_relaxes_intervals() {
        let c = controller();
        c.observe_network(NetworkQuality::Good);
        let baseline = c.tuning().heartbeat_interval;

        c.observe_visibility(VisibilityState::Background);
        let relaxed = c.tuning().heartbeat_interval;
        assert!(relaxed > baseline);

        c.observe_visibility(VisibilityState::Foreground);
        assert_eq!(c.tuning().heartbeat_interval, baseline);
    }

    #[test]
    fn test_online_watch_tracks_quality() {
        let c = controller();
        let rx = c.online_watch();
        assert!(*rx.borrow());

        c.observe_network(NetworkQuality::Offline);
        assert!(!*rx.borrow());
        assert!(c.is_offline());

        c.observe_network(NetworkQuality::Fair);
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_check_connectivity_without_probes_is_noop() {
        let c = controller();
        c.observe_network(NetworkQuality::Poor);
        assert_eq!(c.check_connectivity().await, NetworkQuality::Poor);
    }
}
