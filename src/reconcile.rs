//! Reconciliation loop: one fetch per tick, idempotent Discord updates.
//!
//! Strictly sequential: the next tick cannot start while a cycle is in
//! flight (the ticker skips missed ticks and each cycle is awaited inline),
//! so at most one scrape and one browser session ever exist at a time. The
//! loop owns the single piece of mutable state — the last-known value — and
//! nothing else reads or writes it.

use crate::error::UpdateError;
use crate::fetch::PriceSource;
use crate::price::PriceValue;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Where price labels get pushed: a transient status and a durable
/// channel rename. Production is Discord; tests inject fakes.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Whether the upstream connection is established. Ticks are skipped
    /// entirely while this is false.
    fn is_ready(&self) -> bool;
    /// Transient presence/status update.
    async fn set_status(&self, text: &str) -> Result<(), UpdateError>;
    /// Durable channel rename.
    async fn rename_channel(&self, name: &str) -> Result<(), UpdateError>;
}

/// The update loop and its single piece of state.
pub struct UpdateLoop<S, T> {
    source: S,
    sink: T,
    symbol: String,
    interval: Duration,
    last_known: Option<PriceValue>,
}

impl<S: PriceSource, T: StatusSink> UpdateLoop<S, T> {
    pub fn new(source: S, sink: T, symbol: String, interval: Duration) -> Self {
        Self {
            source,
            sink,
            symbol,
            interval,
            last_known: None,
        }
    }

    /// Run until `shutdown` fires. A failed cycle never escapes; the loop
    /// always returns to waiting for the next tick.
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "update loop started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        // A cycle can outlast the interval (retries against a slow page);
        // skipped ticks are dropped rather than queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Keep one waiter registered across iterations so a shutdown that
        // lands mid-cycle is still observed.
        let stop = shutdown.notified();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = &mut stop => {
                    info!("update loop stopping");
                    return;
                }
            }
        }
    }

    /// One reconcile cycle. Public so tests can drive ticks directly.
    pub async fn tick(&mut self) {
        if !self.sink.is_ready() {
            info!("upstream connection not ready, skipping cycle");
            return;
        }

        let price = match self.source.fetch().await {
            Ok(price) => price,
            Err(e) => {
                warn!(kind = e.kind(), "cycle fetch failed: {e}");
                return;
            }
        };

        if self.last_known.as_ref() == Some(&price) {
            debug!(price = %price, "price unchanged, nothing to do");
            return;
        }

        let label = format!("{}: ${}", self.symbol, price);
        info!(
            from = self.last_known.as_ref().map(|p| p.as_str()).unwrap_or("<none>"),
            to = %price,
            "price changed"
        );

        // Status and rename are independent: one failing must not block or
        // roll back the other.
        if let Err(e) = self.sink.set_status(&label).await {
            warn!("status update failed: {e}");
        }

        match self.sink.rename_channel(&label).await {
            Ok(()) => {
                info!(name = %label, "channel renamed");
                self.last_known = Some(price);
            }
            Err(UpdateError::PermissionDenied) => {
                // Terminal for this value: record it so we don't hammer a
                // rename we're not allowed to make.
                error!("no permission to rename the channel");
                self.last_known = Some(price);
            }
            Err(UpdateError::RateLimited { retry_after_secs }) => {
                // Leave last-known stale; the next tick re-diffs against it
                // and re-attempts the rename.
                warn!(?retry_after_secs, "rename rate limited, deferring to next cycle");
            }
            Err(e) => {
                warn!("rename failed: {e}");
            }
        }
    }

    /// Most recently propagated value.
    pub fn last_known(&self) -> Option<&PriceValue> {
        self.last_known.as_ref()
    }
}
