//! Page value extraction.
//!
//! Drives one provisioned session to the target URL, waits for the document
//! to finish loading plus a fixed settling delay for the client-side
//! framework to render, then walks an ordered list of [`Locator`] strategies
//! until one yields non-empty text. The class names on the target page have
//! changed across deployments, which is why there is a strategy list instead
//! of a single selector.

use crate::error::FetchError;
use crate::webdriver::{WdError, WebDriver};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll step for ready-state and element waits.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One way of finding the target element.
///
/// Ordered lists of these are evaluated uniformly; adding a new strategy is
/// one more variant value, not another branch in the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// CSS selector, e.g. `.DataPoint_dataPointValue__Bzf_E`.
    Css(String),
    /// XPath expression, e.g. `//*[contains(@class,'dataPointValue')]`.
    XPath(String),
}

impl Locator {
    /// WebDriver location strategy name and selector value.
    pub fn using(&self) -> (&'static str, &str) {
        match self {
            Locator::Css(sel) => ("css selector", sel),
            Locator::XPath(expr) => ("xpath", expr),
        }
    }

    /// Parse `css:<selector>` or `xpath:<expression>`.
    pub fn parse(s: &str) -> Option<Locator> {
        let s = s.trim();
        if let Some(sel) = s.strip_prefix("css:") {
            (!sel.is_empty()).then(|| Locator::Css(sel.to_string()))
        } else if let Some(expr) = s.strip_prefix("xpath:") {
            (!expr.is_empty()).then(|| Locator::XPath(expr.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(sel) => write!(f, "css:{sel}"),
            Locator::XPath(expr) => write!(f, "xpath:{expr}"),
        }
    }
}

/// Timing knobs and diagnostics context for one extraction.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Driver-side page load deadline.
    pub page_load_timeout: Duration,
    /// Per-strategy element wait.
    pub element_wait: Duration,
    /// Fixed delay after load for client-side rendering to populate.
    pub settle_delay: Duration,
    /// Substring expected somewhere in the page source when the page shape
    /// is still what we think it is. Checked only on failure, for triage.
    pub marker: String,
}

/// Map a driver error into the fetch taxonomy.
fn map_wd(e: WdError) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else {
        FetchError::Session(e.to_string())
    }
}

/// Navigate and pull the raw value text out of the page.
///
/// Returns the first non-whitespace text any strategy produces. When every
/// strategy is exhausted, logs diagnostic context gathered from the session
/// it already holds (no further navigation) and fails with
/// [`FetchError::NoElementFound`].
pub async fn extract_raw(
    session: &WebDriver,
    url: &str,
    locators: &[Locator],
    opts: &ExtractOptions,
) -> Result<String, FetchError> {
    session
        .set_timeouts(opts.page_load_timeout, Duration::from_secs(10))
        .await
        .map_err(map_wd)?;

    session.navigate(url).await.map_err(map_wd)?;
    wait_for_ready(session, opts.page_load_timeout).await?;

    // Client-rendered page: the document is "complete" well before the
    // framework has painted the value.
    tokio::time::sleep(opts.settle_delay).await;

    for locator in locators {
        debug!("trying locator {locator}");
        match wait_for_text(session, locator, opts.element_wait).await? {
            Some(text) => {
                debug!("locator {locator} produced text {text:?}");
                return Ok(text);
            }
            None => debug!("locator {locator} produced nothing"),
        }
    }

    log_failure_context(session, opts).await;
    Err(FetchError::NoElementFound)
}

/// Block until `document.readyState` is `complete`, bounded by `timeout`.
async fn wait_for_ready(session: &WebDriver, timeout: Duration) -> Result<(), FetchError> {
    let deadline = Instant::now() + timeout;
    loop {
        let state = session
            .execute("return document.readyState")
            .await
            .map_err(map_wd)?;
        if state.as_str() == Some("complete") {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(FetchError::Timeout(
                "document never reached readyState=complete".into(),
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll one locator until it yields a displayed element with non-empty text,
/// or the per-strategy wait runs out (which is not an error — the next
/// strategy gets its turn).
async fn wait_for_text(
    session: &WebDriver,
    locator: &Locator,
    wait: Duration,
) -> Result<Option<String>, FetchError> {
    let (using, value) = locator.using();
    let deadline = Instant::now() + wait;
    loop {
        if let Some(el) = session.find_element(using, value).await.map_err(map_wd)? {
            let displayed = session.element_displayed(&el).await.unwrap_or(false);
            if displayed {
                let text = session.element_text(&el).await.map_err(map_wd)?;
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Ok(Some(trimmed.to_string()));
                }
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Record enough context to triage a page-shape change from logs alone.
/// Uses only calls against the already-open session.
async fn log_failure_context(session: &WebDriver, opts: &ExtractOptions) {
    let current_url = session
        .current_url()
        .await
        .unwrap_or_else(|e| format!("<unavailable: {e}>"));
    match session.page_source().await {
        Ok(source) => warn!(
            url = %current_url,
            page_len = source.len(),
            marker_present = source.contains(&opts.marker),
            "all locator strategies exhausted"
        ),
        Err(e) => warn!(
            url = %current_url,
            "all locator strategies exhausted; page source unavailable: {e}"
        ),
    }
}
