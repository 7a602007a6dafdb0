//! Discord client: Gateway WebSocket for liveness and presence, REST API
//! for channel lookup and rename.
//!
//! The gateway task owns the connection, identify/heartbeat handshake, and
//! a readiness flag the reconcile loop checks before each cycle. It
//! reconnects with a fixed cool-down when the connection drops. Scraping
//! runs in a separate task, so heartbeats are never delayed by a scrape.

use crate::error::UpdateError;
use crate::reconcile::StatusSink;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Gateway opcodes.
const GATEWAY_DISPATCH: u8 = 0;
const GATEWAY_HEARTBEAT: u8 = 1;
const GATEWAY_IDENTIFY: u8 = 2;
const GATEWAY_PRESENCE_UPDATE: u8 = 3;
const GATEWAY_HELLO: u8 = 10;
const GATEWAY_HEARTBEAT_ACK: u8 = 11;

/// GUILDS | GUILD_VOICE_STATES — all this bot ever watches.
const INTENTS: u64 = (1 << 0) | (1 << 7);

/// Cool-down between gateway reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Channel type for guild voice channels.
pub const CHANNEL_KIND_VOICE: u8 = 2;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Option<serde_json::Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// A renameable channel as the REST API reports it.
#[derive(Debug, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
}

/// REST-side Discord client.
pub struct DiscordRest {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl DiscordRest {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(token, DISCORD_API_BASE)
    }

    /// Override the API base. Used by tests to point at a mock server.
    pub fn with_api_base(token: &str, api_base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// Look a channel up by ID. `Ok(None)` when Discord doesn't know it.
    pub async fn get_channel(&self, channel_id: u64) -> Result<Option<Channel>, UpdateError> {
        let resp = self
            .http
            .get(format!("{}/channels/{}", self.api_base, channel_id))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| UpdateError::Transport(e.to_string()))?;

        match resp.status().as_u16() {
            200 => resp
                .json::<Channel>()
                .await
                .map(Some)
                .map_err(|e| UpdateError::Transport(format!("bad channel payload: {e}"))),
            404 => Ok(None),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(map_api_error(status, &body))
            }
        }
    }

    /// Rename a channel. Distinguishes permission failures (terminal for
    /// the value) from rate limits (retried next cycle) per status code.
    pub async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<(), UpdateError> {
        let resp = self
            .http
            .patch(format!("{}/channels/{}", self.api_base, channel_id))
            .header("Authorization", self.auth())
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| UpdateError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_api_error(status, &body))
    }

    /// Fetch the Gateway WebSocket URL.
    async fn gateway_url(&self) -> Result<String, UpdateError> {
        let resp = self
            .http
            .get(format!("{}/gateway/bot", self.api_base))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| UpdateError::Transport(e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| UpdateError::Transport(format!("bad gateway payload: {e}")))?;

        body.get("url")
            .and_then(|v| v.as_str())
            .map(|s| format!("{s}/?v=10&encoding=json"))
            .ok_or_else(|| UpdateError::Transport("no gateway URL in response".to_string()))
    }
}

/// Map a non-success REST status to the update taxonomy.
fn map_api_error(status: u16, body: &str) -> UpdateError {
    match status {
        403 => UpdateError::PermissionDenied,
        429 => {
            let retry_after_secs = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("retry_after").and_then(|r| r.as_f64()));
            UpdateError::RateLimited { retry_after_secs }
        }
        _ => UpdateError::Transport(format!("discord API error {status}: {body}")),
    }
}

/// Handle to the running gateway task.
pub struct Gateway {
    ready: Arc<AtomicBool>,
    presence_tx: mpsc::Sender<String>,
}

impl Gateway {
    /// Spawn the gateway task: connect, identify, heartbeat, reconnect on
    /// drop, until `shutdown` fires.
    pub fn spawn(token: String, shutdown: Arc<Notify>) -> Self {
        let ready = Arc::new(AtomicBool::new(false));
        let (presence_tx, presence_rx) = mpsc::channel::<String>(8);

        let task_ready = Arc::clone(&ready);
        tokio::spawn(run_gateway(token, task_ready, presence_rx, shutdown));

        Self { ready, presence_tx }
    }

    /// Whether the gateway has completed its handshake and is live.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Queue a presence (status) update onto the gateway connection.
    pub fn set_presence(&self, activity: &str) -> Result<(), UpdateError> {
        self.presence_tx
            .try_send(activity.to_string())
            .map_err(|_| UpdateError::Transport("gateway not connected".to_string()))
    }
}

async fn run_gateway(
    token: String,
    ready: Arc<AtomicBool>,
    mut presence_rx: mpsc::Receiver<String>,
    shutdown: Arc<Notify>,
) {
    let rest = DiscordRest::new(&token);
    loop {
        tokio::select! {
            result = connect_and_run(&rest, &token, &ready, &mut presence_rx) => {
                ready.store(false, Ordering::Relaxed);
                match result {
                    Ok(()) => info!("gateway connection closed, reconnecting"),
                    Err(e) => error!("gateway error, reconnecting in {}s: {e}", RECONNECT_DELAY.as_secs()),
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.notified() => {
                        info!("gateway task shutting down");
                        return;
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("gateway task shutting down");
                return;
            }
        }
    }
}

async fn connect_and_run(
    rest: &DiscordRest,
    token: &str,
    ready: &Arc<AtomicBool>,
    presence_rx: &mut mpsc::Receiver<String>,
) -> Result<(), UpdateError> {
    let url = rest.gateway_url().await?;
    let url = url::Url::parse(&url)
        .map_err(|e| UpdateError::Transport(format!("invalid gateway URL: {e}")))?;
    info!("connecting to Discord gateway");

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|e| UpdateError::Transport(format!("websocket connect failed: {e}")))?;
    let (mut write, mut read) = ws_stream.split();

    // First frame is Hello with the heartbeat interval.
    let mut heartbeat_interval_ms: u64 = 41_250;
    if let Some(Ok(WsMessage::Text(text))) = read.next().await {
        if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
            if payload.op == GATEWAY_HELLO {
                if let Some(interval) = payload
                    .d
                    .as_ref()
                    .and_then(|d| d.get("heartbeat_interval"))
                    .and_then(|v| v.as_u64())
                {
                    heartbeat_interval_ms = interval;
                    debug!(interval_ms = interval, "gateway hello");
                }
            }
        }
    }

    let identify = json!({
        "op": GATEWAY_IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": { "os": std::env::consts::OS, "browser": "pricebeacon", "device": "pricebeacon" },
        }
    });
    write
        .send(WsMessage::Text(identify.to_string()))
        .await
        .map_err(|e| UpdateError::Transport(format!("identify send failed: {e}")))?;

    // Heartbeat ticker feeds frames back through a channel so a single
    // writer owns the sink.
    let sequence: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<String>(4);
    let heartbeat_handle = tokio::spawn({
        let sequence = Arc::clone(&sequence);
        let interval = Duration::from_millis(heartbeat_interval_ms);
        async move {
            loop {
                tokio::time::sleep(interval).await;
                let seq = *sequence.lock().await;
                let frame = json!({ "op": GATEWAY_HEARTBEAT, "d": seq }).to_string();
                if heartbeat_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    });

    let result = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(payload) = serde_json::from_str::<GatewayPayload>(&text) {
                            if let Some(s) = payload.s {
                                *sequence.lock().await = Some(s);
                            }
                            match payload.op {
                                op if op == GATEWAY_DISPATCH => {
                                    if payload.t.as_deref() == Some("READY") {
                                        info!("gateway READY");
                                        ready.store(true, Ordering::Relaxed);
                                    }
                                }
                                op if op == GATEWAY_HEARTBEAT_ACK => {
                                    debug!("heartbeat ack");
                                }
                                _ => {}
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        warn!("gateway closed the connection: {frame:?}");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(UpdateError::Transport(format!("websocket error: {e}"))),
                    None => break Ok(()),
                    _ => {}
                }
            }
            Some(frame) = heartbeat_rx.recv() => {
                if let Err(e) = write.send(WsMessage::Text(frame)).await {
                    break Err(UpdateError::Transport(format!("heartbeat send failed: {e}")));
                }
            }
            Some(activity) = presence_rx.recv() => {
                let frame = json!({
                    "op": GATEWAY_PRESENCE_UPDATE,
                    "d": {
                        "since": null,
                        "activities": [{ "name": activity, "type": 0 }],
                        "status": "online",
                        "afk": false,
                    }
                }).to_string();
                if let Err(e) = write.send(WsMessage::Text(frame)).await {
                    break Err(UpdateError::Transport(format!("presence send failed: {e}")));
                }
                debug!("presence update sent");
            }
        }
    };

    heartbeat_handle.abort();
    result
}

/// Production [`StatusSink`]: presence over the gateway, rename over REST.
pub struct DiscordUpdater {
    gateway: Gateway,
    rest: DiscordRest,
    channel_id: u64,
}

impl DiscordUpdater {
    pub fn new(gateway: Gateway, rest: DiscordRest, channel_id: u64) -> Self {
        Self {
            gateway,
            rest,
            channel_id,
        }
    }
}

#[async_trait]
impl StatusSink for DiscordUpdater {
    fn is_ready(&self) -> bool {
        self.gateway.is_ready()
    }

    async fn set_status(&self, text: &str) -> Result<(), UpdateError> {
        self.gateway.set_presence(text)
    }

    async fn rename_channel(&self, name: &str) -> Result<(), UpdateError> {
        self.rest.rename_channel(self.channel_id, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_rename_channel_sends_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/42"))
            .and(header("Authorization", "Bot tok"))
            .and(body_partial_json(json!({ "name": "ANA: $12.34" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "42", "name": "ANA: $12.34", "type": 2
            })))
            .mount(&server)
            .await;

        let rest = DiscordRest::with_api_base("tok", &server.uri());
        rest.rename_channel(42, "ANA: $12.34").await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_channel_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/42"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "message": "Missing Permissions", "code": 50013
            })))
            .mount(&server)
            .await;

        let rest = DiscordRest::with_api_base("tok", &server.uri());
        let err = rest.rename_channel(42, "x").await.unwrap_err();
        assert!(matches!(err, UpdateError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_rename_channel_rate_limited_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/42"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "message": "You are being rate limited.", "retry_after": 64.57, "global": false
            })))
            .mount(&server)
            .await;

        let rest = DiscordRest::with_api_base("tok", &server.uri());
        match rest.rename_channel(42, "x").await.unwrap_err() {
            UpdateError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(64.57));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_channel_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "42", "name": "ticker", "type": 2
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/43"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "message": "Unknown Channel", "code": 10003
            })))
            .mount(&server)
            .await;

        let rest = DiscordRest::with_api_base("tok", &server.uri());
        let ch = rest.get_channel(42).await.unwrap().unwrap();
        assert_eq!(ch.kind, CHANNEL_KIND_VOICE);
        assert_eq!(ch.name.as_deref(), Some("ticker"));
        assert!(rest.get_channel(43).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_maps_to_transport() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/42"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let rest = DiscordRest::with_api_base("tok", &server.uri());
        assert!(matches!(
            rest.rename_channel(42, "x").await.unwrap_err(),
            UpdateError::Transport(_)
        ));
    }
}
