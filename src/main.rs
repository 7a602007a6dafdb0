use anyhow::Result;
use clap::Parser;
use pricebeacon::config::Config;
use pricebeacon::discord::{self, DiscordRest, DiscordUpdater, Gateway};
use pricebeacon::fetch::ScrapeSource;
use pricebeacon::provision;
use pricebeacon::reconcile::UpdateLoop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "pricebeacon",
    about = "Mirror a scraped asset price into a Discord presence and voice-channel name",
    version
)]
struct Cli {
    /// Seconds between reconcile cycles (overrides UPDATE_INTERVAL_SECS)
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Fetch attempts per cycle (overrides FETCH_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Enable verbose/debug logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "pricebeacon=debug"
    } else {
        "pricebeacon=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_directive.parse().unwrap()),
        )
        .init();

    info!("starting pricebeacon v{}", env!("CARGO_PKG_VERSION"));

    // Configuration must be valid before we touch the network.
    let mut cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(secs) = cli.interval_secs {
        cfg.update_interval = Duration::from_secs(secs);
    }
    if let Some(attempts) = cli.max_attempts {
        cfg.max_attempts = attempts.max(1);
    }

    // Startup environment report, so a broken deploy is visible in the
    // first lines of the log instead of as cryptic cycle failures.
    match provision::find_chrome(cfg.chrome_bin.as_deref()) {
        Some(path) => info!("chrome binary: {}", path.display()),
        None => warn!("no Chrome binary found; it will be searched again each cycle"),
    }
    info!(channel_id = cfg.channel_id, url = %cfg.price_url, symbol = %cfg.symbol, "tracking configured");

    // Verify the target channel before the loop starts.
    let rest = DiscordRest::new(&cfg.bot_token);
    match rest.get_channel(cfg.channel_id).await {
        Ok(Some(channel)) if channel.kind == discord::CHANNEL_KIND_VOICE => {
            info!(
                name = channel.name.as_deref().unwrap_or("<unnamed>"),
                "target voice channel found"
            );
        }
        Ok(Some(channel)) => warn!(
            kind = channel.kind,
            "target channel is not a voice channel; renames may behave oddly"
        ),
        Ok(None) => warn!(
            channel_id = cfg.channel_id,
            "target channel not found; check VOICE_CHANNEL_ID"
        ),
        Err(e) => warn!("could not verify target channel: {e}"),
    }

    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.notify_waiters();
            }
        });
    }

    let gateway = Gateway::spawn(cfg.bot_token.clone(), Arc::clone(&shutdown));
    let sink = DiscordUpdater::new(gateway, rest, cfg.channel_id);
    let source = ScrapeSource::new(cfg.clone());

    UpdateLoop::new(source, sink, cfg.symbol.clone(), cfg.update_interval)
        .run(shutdown)
        .await;

    info!("pricebeacon stopped");
    Ok(())
}
