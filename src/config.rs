//! Environment-driven configuration.
//!
//! Required values are validated at startup; the process must exit non-zero
//! before touching the network when they are missing or malformed. Timing
//! knobs all have defaults tuned for the target page's render cost and
//! Discord's rate limits.

use crate::error::ConfigError;
use crate::extract::Locator;
use std::path::PathBuf;
use std::time::Duration;

/// Default page whose rendered value we track.
const DEFAULT_PRICE_URL: &str = "https://mainnet.nirvana.finance/mint";

/// Default asset symbol used in the presence/channel label.
const DEFAULT_SYMBOL: &str = "ANA";

/// Substring expected in the page source while the page shape is unchanged.
const DEFAULT_MARKER: &str = "DataPoint";

#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token.
    pub bot_token: String,
    /// Voice channel whose name mirrors the price.
    pub channel_id: u64,
    /// Page to scrape.
    pub price_url: String,
    /// Asset symbol for the `"<SYMBOL>: $<price>"` label.
    pub symbol: String,
    /// Ordered element-location strategies. Selector values are a
    /// deployment concern; these are just the currently-known defaults.
    pub locators: Vec<Locator>,
    /// Page-shape marker for failure diagnostics.
    pub marker: String,
    /// Chrome binary override.
    pub chrome_bin: Option<PathBuf>,
    /// chromedriver override.
    pub driver_path: Option<PathBuf>,
    /// Reconcile tick interval.
    pub update_interval: Duration,
    /// Fetch attempts per cycle.
    pub max_attempts: u32,
    /// Base backoff delay between attempts.
    pub base_delay: Duration,
    /// Driver-side page load deadline.
    pub page_load_timeout: Duration,
    /// Per-strategy element wait.
    pub element_wait: Duration,
    /// Settling delay after load for client-side rendering.
    pub settle_delay: Duration,
}

impl Config {
    /// Load and validate configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = require_env("DISCORD_BOT_TOKEN")?;

        let channel_raw = require_env("VOICE_CHANNEL_ID")?;
        let channel_id = channel_raw
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid {
                name: "VOICE_CHANNEL_ID",
                reason: format!("{channel_raw:?} is not a channel id"),
            })?;

        let locators = match read_env_string("PRICE_LOCATORS") {
            Some(raw) => parse_locators(&raw)?,
            None => default_locators(),
        };

        Ok(Self {
            bot_token,
            channel_id,
            price_url: read_env_string("PRICE_URL")
                .unwrap_or_else(|| DEFAULT_PRICE_URL.to_string()),
            symbol: read_env_string("PRICE_SYMBOL").unwrap_or_else(|| DEFAULT_SYMBOL.to_string()),
            locators,
            marker: read_env_string("PRICE_MARKER").unwrap_or_else(|| DEFAULT_MARKER.to_string()),
            chrome_bin: read_env_string("CHROME_BIN")
                .or_else(|| read_env_string("GOOGLE_CHROME_BIN"))
                .map(PathBuf::from),
            driver_path: read_env_string("CHROMEDRIVER_PATH").map(PathBuf::from),
            update_interval: Duration::from_secs(read_env_u64("UPDATE_INTERVAL_SECS", 120)),
            max_attempts: read_env_u32("FETCH_MAX_ATTEMPTS", 3).max(1),
            base_delay: Duration::from_millis(read_env_u64("FETCH_BASE_DELAY_MS", 2000)),
            page_load_timeout: Duration::from_secs(read_env_u64("PAGE_LOAD_TIMEOUT_SECS", 30)),
            element_wait: Duration::from_secs(read_env_u64("ELEMENT_WAIT_SECS", 10)),
            settle_delay: Duration::from_secs(read_env_u64("SETTLE_DELAY_SECS", 5)),
        })
    }
}

/// Locator list matching the page as currently deployed: exact class, then
/// attribute-contains (survives hash-suffix churn), then XPath.
pub fn default_locators() -> Vec<Locator> {
    vec![
        Locator::Css(".DataPoint_dataPointValue__Bzf_E".to_string()),
        Locator::Css("[class*='dataPointValue']".to_string()),
        Locator::XPath("//*[contains(@class,'dataPointValue')]".to_string()),
    ]
}

/// Parse a comma-separated `css:<sel>`/`xpath:<expr>` list.
pub fn parse_locators(raw: &str) -> Result<Vec<Locator>, ConfigError> {
    let mut locators = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match Locator::parse(part) {
            Some(l) => locators.push(l),
            None => {
                return Err(ConfigError::Invalid {
                    name: "PRICE_LOCATORS",
                    reason: format!("{part:?} is not css:<selector> or xpath:<expression>"),
                })
            }
        }
    }
    if locators.is_empty() {
        return Err(ConfigError::Invalid {
            name: "PRICE_LOCATORS",
            reason: "no locators given".to_string(),
        });
    }
    Ok(locators)
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match read_env_string(name) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locators_mixed() {
        let locators = parse_locators("css:.price, xpath://*[@id='v'] ,css:[class*='val']")
            .unwrap();
        assert_eq!(locators.len(), 3);
        assert_eq!(locators[0], Locator::Css(".price".into()));
        assert_eq!(locators[1], Locator::XPath("//*[@id='v']".into()));
    }

    #[test]
    fn test_parse_locators_rejects_bad_kind() {
        assert!(parse_locators("id:price").is_err());
        assert!(parse_locators("").is_err());
    }

    #[test]
    fn test_default_locators_order() {
        let locators = default_locators();
        // Exact class first, fuzzier fallbacks after.
        assert!(matches!(locators[0], Locator::Css(_)));
        assert!(matches!(locators.last(), Some(Locator::XPath(_))));
        assert_eq!(locators.len(), 3);
    }
}
