//! Delivery endpoint seam for the error queue.

use crate::error::{CoreError, Result};
use crate::telemetry::event::QueuedErrorEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Accepts batches of failure events.
///
/// Implementations must be idempotent on event id: the queue may redeliver a
/// batch whose acknowledgment was lost.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver a batch. `Ok(())` acknowledges every event in it.
    async fn deliver(&self, events: &[QueuedErrorEvent]) -> Result<()>;
}

/// Shared trait object, the form the queue stores.
pub type DynTelemetrySink = Arc<dyn TelemetrySink>;

/// HTTP sink posting JSON arrays to a collector endpoint.
pub struct HttpTelemetrySink {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpTelemetrySink {
    pub fn new(endpoint: url::Url, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    async fn deliver(&self, events: &[QueuedErrorEvent]) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(events)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Telemetry {
                message: format!("collector answered {}", status),
            });
        }
        debug!("Delivered {} telemetry events", events.len());
        Ok(())
    }
}
