//! Error taxonomy for fetch attempts and Discord updates.
//!
//! Every failure inside one fetch attempt is converted into a [`FetchError`]
//! before it leaves the attempt; only the retry orchestrator decides whether
//! to retry or give up. Discord-side failures map to [`UpdateError`] and are
//! handled per-kind by the reconcile loop.

use thiserror::Error;

/// Why a single fetch attempt failed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Browser binary or chromedriver unavailable, incompatible, or failed to launch.
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Page load or element wait exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The driver or its protocol misbehaved mid-attempt.
    #[error("driver session error: {0}")]
    Session(String),

    /// Every locator strategy was exhausted without yielding text.
    #[error("no element matched any locator")]
    NoElementFound,

    /// Extracted text did not clean up into a finite non-negative number.
    #[error("extracted text is not a price: {raw:?}")]
    InvalidFormat { raw: String },
}

impl FetchError {
    /// Short stable label for log records.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Provisioning(_) => "provisioning",
            FetchError::Timeout(_) => "timeout",
            FetchError::Session(_) => "session",
            FetchError::NoElementFound => "no_element",
            FetchError::InvalidFormat { .. } => "invalid_format",
        }
    }
}

/// Why a Discord update call failed.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The bot lacks Manage Channels on the target. Terminal for the value.
    #[error("missing permission to edit the channel")]
    PermissionDenied,

    /// Discord asked us to back off. Deferred to the next cycle.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<f64> },

    /// Anything else: DNS, TLS, 5xx, closed gateway. Logged and carried on.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Startup configuration problems. These abort the process before any
/// network activity.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}
