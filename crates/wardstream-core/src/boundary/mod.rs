//! Fault isolation boundaries.
//!
//! A boundary wraps one UI subtree (a view, a panel, a widget) and keeps its
//! faults from propagating to siblings or ancestors. It owns the retry
//! budget and backoff for its subtree, reports every captured fault to the
//! error queue, and exposes its status on a watch channel for the embedder
//! to render: fallback content while faulted, normal content again once a
//! retry succeeds, a permanent fallback once the budget is spent.
//!
//! The boundary never re-runs the subtree itself. A transition to
//! [`BoundaryStatus::Retrying`] is the signal for the embedder to remount;
//! if the remount faults again the embedder calls
//! [`capture`](FaultBoundary::capture) again, and the budget counts down.

use crate::cancel::{sleep_unless_cancelled, CancellationToken};
use crate::config::BoundaryDefaults;
use crate::error::CoreError;
use crate::telemetry::{BoundaryTier, ErrorQueue, QueuedErrorEvent};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Observable status of one boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryStatus {
    /// Subtree is healthy (initial state, and again after a reset).
    Stable,
    /// A fault was captured; a retry is pending.
    Faulted,
    /// Backoff elapsed; the embedder should remount the subtree now.
    Retrying,
    /// Retry budget spent or the fault was fatal; fallback is permanent
    /// until an explicit reset.
    Exhausted,
    /// The user dismissed the fallback; no further retries.
    Dismissed,
}

impl std::fmt::Display for BoundaryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BoundaryStatus::Stable => "stable",
            BoundaryStatus::Faulted => "faulted",
            BoundaryStatus::Retrying => "retrying",
            BoundaryStatus::Exhausted => "exhausted",
            BoundaryStatus::Dismissed => "dismissed",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for one boundary.
#[derive(Debug, Clone)]
pub struct BoundaryConfig {
    /// Component name, used in telemetry and logs.
    pub name: String,
    /// Severity tier; decides the default retry budget.
    pub tier: BoundaryTier,
    /// Retries allowed before the boundary gives up.
    pub max_retries: u32,
    /// First retry delay; doubles per consumed retry.
    pub retry_base_delay: Duration,
    /// Hard ceiling on the retry delay.
    pub retry_max_delay: Duration,
    /// Identifier of the fallback surface the embedder should show.
    pub fallback_ref: Option<String>,
}

impl BoundaryConfig {
    /// Preset for whole-view features: largest budget, loudest fallback.
    pub fn critical(name: impl Into<String>) -> Self {
        Self::preset(name, BoundaryTier::Critical, BoundaryDefaults::CRITICAL_MAX_RETRIES)
    }

    /// Preset for self-contained features.
    pub fn feature(name: impl Into<String>) -> Self {
        Self::preset(name, BoundaryTier::Feature, BoundaryDefaults::FEATURE_MAX_RETRIES)
    }

    /// Preset for small widgets: smallest budget, easily dismissed.
    pub fn fallback(name: impl Into<String>) -> Self {
        Self::preset(name, BoundaryTier::Fallback, BoundaryDefaults::FALLBACK_MAX_RETRIES)
    }

    fn preset(name: impl Into<String>, tier: BoundaryTier, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            tier,
            max_retries,
            retry_base_delay: BoundaryDefaults::RETRY_BASE_DELAY,
            retry_max_delay: BoundaryDefaults::RETRY_MAX_DELAY,
            fallback_ref: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_fallback_ref(mut self, fallback_ref: impl Into<String>) -> Self {
        self.fallback_ref = Some(fallback_ref.into());
        self
    }

    /// Delay before the retry consuming attempt number `attempt`
    /// (0-indexed): `min(base * 2^attempt, cap)`. Deliberately jitter-free
    /// so the delay sequence is strictly increasing until the cap.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << shift)
            .min(self.retry_max_delay)
    }
}

/// Isolates faults of one subtree and manages its retry lifecycle.
pub struct FaultBoundary {
    config: BoundaryConfig,
    telemetry: Arc<ErrorQueue>,
    status_tx: watch::Sender<BoundaryStatus>,
    /// Retries consumed since the last reset.
    retries_used: AtomicU32,
    /// Total faults captured over the boundary's lifetime.
    captured: AtomicU64,
    /// Token for the currently pending retry timer, if any.
    timer: Mutex<Option<CancellationToken>>,
    closed: AtomicBool,
}

impl FaultBoundary {
    pub fn new(config: BoundaryConfig, telemetry: Arc<ErrorQueue>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(BoundaryStatus::Stable);
        Arc::new(Self {
            config,
            telemetry,
            status_tx,
            retries_used: AtomicU32::new(0),
            captured: AtomicU64::new(0),
            timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> BoundaryStatus {
        *self.status_tx.borrow()
    }

    /// Watch receiver the embedder renders from.
    pub fn status_watch(&self) -> watch::Receiver<BoundaryStatus> {
        self.status_tx.subscribe()
    }

    /// Capture a fault raised inside this boundary's subtree.
    ///
    /// The fault is reported to the error queue and absorbed here: nothing
    /// propagates to sibling boundaries or the embedder beyond the status
    /// change. If retry budget remains, a retry timer starts; a fatal-class
    /// fault spends the whole budget at once.
    pub fn capture(self: &Arc<Self>, fault: &CoreError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let status = self.status();
        if status == BoundaryStatus::Dismissed || status == BoundaryStatus::Exhausted {
            debug!(
                "Boundary {} ignoring fault while {}: {}",
                self.config.name, status, fault
            );
            return;
        }

        self.captured.fetch_add(1, Ordering::SeqCst);
        let used = self.retries_used.load(Ordering::SeqCst);
        self.telemetry.push(
            QueuedErrorEvent::new(&self.config.name, self.config.tier, fault.to_string())
                .with_context("class", fault.class().to_string())
                .with_context("retry", used.to_string()),
        );

        if fault.is_fatal() {
            warn!(
                "Boundary {} captured fatal fault, giving up: {}",
                self.config.name, fault
            );
            self.cancel_timer();
            self.set_status(BoundaryStatus::Exhausted);
            return;
        }

        if used >= self.config.max_retries {
            warn!(
                "Boundary {} exhausted its {} retries",
                self.config.name, self.config.max_retries
            );
            self.cancel_timer();
            self.set_status(BoundaryStatus::Exhausted);
            return;
        }

        let delay = self.config.retry_delay(used);
        info!(
            "Boundary {} captured fault ({}), retry {}/{} in {:?}",
            self.config.name,
            fault.class(),
            used + 1,
            self.config.max_retries,
            delay
        );
        self.set_status(BoundaryStatus::Faulted);
        self.schedule_retry(delay);
    }

    /// Skip the pending backoff and retry immediately (the user pressed
    /// "try again"). No-op unless the boundary is currently faulted.
    pub fn retry_now(self: &Arc<Self>) {
        if self.status() != BoundaryStatus::Faulted {
            return;
        }
        self.cancel_timer();
        self.consume_retry();
    }

    /// Dismiss the fallback; the boundary stops retrying until reset.
    pub fn dismiss(&self) {
        self.cancel_timer();
        self.set_status(BoundaryStatus::Dismissed);
    }

    /// The subtree recovered: zero the budget and return to stable.
    pub fn reset(&self) {
        self.cancel_timer();
        self.retries_used.store(0, Ordering::SeqCst);
        self.status_tx.send_replace(BoundaryStatus::Stable);
        debug!("Boundary {} reset", self.config.name);
    }

    /// Tear the boundary down; pending timers are cancelled. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_timer();
    }

    /// Point-in-time counters for the status surface.
    pub fn stats(&self) -> BoundaryStats {
        BoundaryStats {
            name: self.config.name.clone(),
            tier: self.config.tier,
            status: self.status(),
            captured: self.captured.load(Ordering::SeqCst),
            retries_used: self.retries_used.load(Ordering::SeqCst),
            max_retries: self.config.max_retries,
            fallback_ref: self.config.fallback_ref.clone(),
        }
    }

    // Internal

    fn set_status(&self, next: BoundaryStatus) {
        let current = self.status();
        if current != next {
            debug!("Boundary {}: {} -> {}", self.config.name, current, next);
            self.status_tx.send_replace(next);
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration) {
        let token = CancellationToken::new();
        {
            let mut timer = self.timer.lock().unwrap();
            if let Some(previous) = timer.replace(token.clone()) {
                previous.cancel();
            }
        }

        let boundary = Arc::clone(self);
        tokio::spawn(async move {
            if !sleep_unless_cancelled(delay, &token).await {
                return;
            }
            if boundary.closed.load(Ordering::SeqCst)
                || boundary.status() != BoundaryStatus::Faulted
            {
                return;
            }
            boundary.consume_retry();
        });
    }

    fn consume_retry(&self) {
        self.retries_used.fetch_add(1, Ordering::SeqCst);
        self.set_status(BoundaryStatus::Retrying);
    }

    fn cancel_timer(&self) {
        if let Some(token) = self.timer.lock().unwrap().take() {
            token.cancel();
        }
    }
}

/// Point-in-time view of one boundary.
#[derive(Debug, Clone)]
pub struct BoundaryStats {
    pub name: String,
    pub tier: BoundaryTier,
    pub status: BoundaryStatus,
    pub captured: u64,
    pub retries_used: u32,
    pub max_retries: u32,
    pub fallback_ref: Option<String>,
}
