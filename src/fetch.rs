//! Retry orchestration for one fetch cycle.
//!
//! Runs up to `max_attempts` independent {provision → extract → normalize}
//! attempts. Every attempt gets a fresh browser session and releases it on
//! all exit paths; nothing survives between attempts. Failed attempts sleep
//! for an exponentially growing delay with jitter so a fleet of these bots
//! never retries in lockstep against the target site.

use crate::config::Config;
use crate::error::FetchError;
use crate::extract::{self, ExtractOptions};
use crate::price::{self, PriceValue};
use crate::provision;
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on the random jitter added to each backoff delay.
const JITTER_MAX: Duration = Duration::from_millis(250);

/// Delay before the attempt after `attempt` (1-based) fails:
/// `base * 2^(attempt-1)` plus up to [`JITTER_MAX`] of jitter.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=JITTER_MAX);
    exp + jitter
}

/// Something the reconcile loop can pull a price from.
///
/// The production implementation scrapes; tests inject fakes.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch(&self) -> Result<PriceValue, FetchError>;
}

/// Scrapes the configured page with bounded retries.
pub struct ScrapeSource {
    cfg: Config,
}

impl ScrapeSource {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl PriceSource for ScrapeSource {
    async fn fetch(&self) -> Result<PriceValue, FetchError> {
        fetch_price(&self.cfg).await
    }
}

/// Run one full fetch cycle: at most `max_attempts` attempts, first success
/// wins, definitive failure after exhaustion. The caller must not retry
/// further within the same cycle.
pub async fn fetch_price(cfg: &Config) -> Result<PriceValue, FetchError> {
    let opts = ExtractOptions {
        page_load_timeout: cfg.page_load_timeout,
        element_wait: cfg.element_wait,
        settle_delay: cfg.settle_delay,
        marker: cfg.marker.clone(),
    };

    retry_attempts(cfg.max_attempts, cfg.base_delay, |_attempt| {
        run_attempt(cfg, &opts)
    })
    .await
}

/// Drive `attempt_fn` up to `max_attempts` times, backing off between
/// failures. Each invocation is fully independent; the first success
/// short-circuits. Separated from the real attempt so the retry policy is
/// testable without a browser on the machine.
async fn retry_attempts<F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    mut attempt_fn: F,
) -> Result<PriceValue, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PriceValue, FetchError>>,
{
    let mut last_err = FetchError::Provisioning("no attempts made".into());
    for attempt in 1..=max_attempts {
        match attempt_fn(attempt).await {
            Ok(price) => {
                info!(attempt, price = %price, "fetch succeeded");
                return Ok(price);
            }
            Err(e) => {
                warn!(attempt, kind = e.kind(), "fetch attempt failed: {e}");
                last_err = e;
            }
        }
        if attempt < max_attempts {
            let delay = backoff_delay(attempt, base_delay);
            info!(attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
            tokio::time::sleep(delay).await;
        }
    }

    warn!(
        attempts = max_attempts,
        kind = last_err.kind(),
        "fetch cycle exhausted all attempts"
    );
    Err(last_err)
}

/// One independent attempt. The session is closed on every path out.
async fn run_attempt(cfg: &Config, opts: &ExtractOptions) -> Result<PriceValue, FetchError> {
    let provisioned = provision::provision(cfg).await?;

    let result = extract_raw(&provisioned, cfg, opts).await;
    provisioned.close().await;

    let raw = result?;
    let price = price::normalize(&raw)?;
    info!(raw = %raw, cleaned = %price, "normalized extracted text");
    Ok(price)
}

async fn extract_raw(
    provisioned: &provision::ProvisionedSession,
    cfg: &Config,
    opts: &ExtractOptions,
) -> Result<String, FetchError> {
    extract::extract_raw(&provisioned.session, &cfg.price_url, &cfg.locators, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::normalize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_exhausts_exactly_max_attempts_on_persistent_failure() {
        let calls = AtomicUsize::new(0);
        let result = retry_attempts(3, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchError::NoElementFound) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(FetchError::NoElementFound)));
    }

    #[tokio::test]
    async fn test_retry_first_success_makes_single_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry_attempts(3, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { normalize("12.34") }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap().as_str(), "12.34");
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success_mid_cycle() {
        let calls = AtomicUsize::new(0);
        let result = retry_attempts(5, Duration::from_millis(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(FetchError::Timeout("page load".into()))
                } else {
                    normalize("9.87")
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap().as_str(), "9.87");
    }

    #[test]
    fn test_backoff_is_exponential_with_bounded_jitter() {
        let base = Duration::from_millis(500);
        for attempt in 1..=5u32 {
            let d = backoff_delay(attempt, base);
            let floor = base * (1 << (attempt - 1));
            assert!(d >= floor, "attempt {attempt}: {d:?} < {floor:?}");
            assert!(
                d <= floor + JITTER_MAX,
                "attempt {attempt}: {d:?} exceeds jitter bound"
            );
        }
    }

    #[test]
    fn test_backoff_non_decreasing_and_positive() {
        let base = Duration::from_secs(1);
        let mut prev = Duration::ZERO;
        for attempt in 1..=6u32 {
            let d = backoff_delay(attempt, base);
            assert!(d > Duration::ZERO);
            // Jitter is capped well below one doubling step, so successive
            // delays cannot shrink.
            assert!(d >= prev, "delay shrank at attempt {attempt}");
            prev = d;
        }
    }

    #[test]
    fn test_backoff_shift_saturates_on_huge_attempt() {
        // Must not panic or overflow for absurd attempt numbers.
        let d = backoff_delay(40, Duration::from_millis(1));
        assert!(d > Duration::ZERO);
    }
}
