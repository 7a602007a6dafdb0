//! Minimal W3C WebDriver client over HTTP.
//!
//! Speaks just enough of the protocol for one job: open a page, poll its
//! ready state, locate one element, read its text, and tear the session
//! down. Nothing else in the crate talks to the driver directly.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// W3C element identifier key inside element responses.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Per-request HTTP timeout. Generous: the driver itself enforces the page
/// load deadline and can legitimately block for most of it.
const HTTP_TIMEOUT: Duration = Duration::from_secs(90);

/// Low-level driver failure, before mapping into the fetch taxonomy.
#[derive(Debug, Error)]
pub enum WdError {
    /// The HTTP request to the driver timed out.
    #[error("webdriver request timed out")]
    Timeout,

    /// The driver answered with a protocol-level error payload.
    #[error("webdriver {error}: {message}")]
    Driver { error: String, message: String },

    /// Could not reach the driver at all.
    #[error("webdriver transport: {0}")]
    Transport(String),
}

impl WdError {
    /// Whether the driver-reported error is one of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        match self {
            WdError::Timeout => true,
            WdError::Driver { error, .. } => {
                error == "timeout" || error == "script timeout"
            }
            WdError::Transport(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WdResponse {
    value: Value,
}

/// Opaque handle to a located element.
#[derive(Debug, Clone)]
pub struct ElementRef(String);

/// One live WebDriver session against a running chromedriver.
pub struct WebDriver {
    http: reqwest::Client,
    base: String,
    session_id: String,
}

/// Ask a driver endpoint whether it is ready to accept sessions.
///
/// Takes the client so readiness polling reuses one connection pool.
pub async fn status_ready(http: &reqwest::Client, base: &str) -> bool {
    let resp = match http
        .get(format!("{base}/status"))
        .timeout(Duration::from_secs(2))
        .send()
        .await
    {
        Ok(r) => r,
        Err(_) => return false,
    };
    match resp.json::<WdResponse>().await {
        Ok(body) => body.value.get("ready").and_then(Value::as_bool) == Some(true),
        Err(_) => false,
    }
}

impl WebDriver {
    /// Create a new session with the given W3C capabilities.
    pub async fn new_session(base: &str, capabilities: Value) -> Result<Self, WdError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| WdError::Transport(e.to_string()))?;

        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let value = request(&http, reqwest::Method::POST, &format!("{base}/session"), Some(body)).await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| WdError::Transport("no sessionId in new-session response".into()))?
            .to_string();

        Ok(Self {
            http,
            base: base.to_string(),
            session_id,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/session/{}{}", self.base, self.session_id, suffix)
    }

    /// Configure the driver-side page load and script deadlines.
    pub async fn set_timeouts(&self, page_load: Duration, script: Duration) -> Result<(), WdError> {
        let body = json!({
            "pageLoad": page_load.as_millis() as u64,
            "script": script.as_millis() as u64,
        });
        request(&self.http, reqwest::Method::POST, &self.url("/timeouts"), Some(body)).await?;
        Ok(())
    }

    /// Navigate to a URL. Blocks until the driver's page load strategy is
    /// satisfied or its pageLoad deadline expires.
    pub async fn navigate(&self, url: &str) -> Result<(), WdError> {
        let body = json!({ "url": url });
        request(&self.http, reqwest::Method::POST, &self.url("/url"), Some(body)).await?;
        Ok(())
    }

    /// Execute synchronous JavaScript in the page and return its value.
    pub async fn execute(&self, script: &str) -> Result<Value, WdError> {
        let body = json!({ "script": script, "args": [] });
        request(&self.http, reqwest::Method::POST, &self.url("/execute/sync"), Some(body)).await
    }

    /// Locate a single element. `no such element` maps to `Ok(None)` so
    /// callers can poll without treating absence as a hard failure.
    pub async fn find_element(
        &self,
        using: &str,
        selector: &str,
    ) -> Result<Option<ElementRef>, WdError> {
        let body = json!({ "using": using, "value": selector });
        match request(&self.http, reqwest::Method::POST, &self.url("/element"), Some(body)).await {
            Ok(value) => {
                let id = value
                    .get(ELEMENT_KEY)
                    .and_then(Value::as_str)
                    .ok_or_else(|| WdError::Transport("no element id in response".into()))?
                    .to_string();
                Ok(Some(ElementRef(id)))
            }
            Err(WdError::Driver { ref error, .. }) if error == "no such element" => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Visible text of an element.
    pub async fn element_text(&self, el: &ElementRef) -> Result<String, WdError> {
        let value = request(
            &self.http,
            reqwest::Method::GET,
            &self.url(&format!("/element/{}/text", el.0)),
            None,
        )
        .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Whether an element is currently displayed.
    pub async fn element_displayed(&self, el: &ElementRef) -> Result<bool, WdError> {
        let value = request(
            &self.http,
            reqwest::Method::GET,
            &self.url(&format!("/element/{}/displayed", el.0)),
            None,
        )
        .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Full page source, for failure diagnostics.
    pub async fn page_source(&self) -> Result<String, WdError> {
        let value = request(&self.http, reqwest::Method::GET, &self.url("/source"), None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Current URL, for failure diagnostics.
    pub async fn current_url(&self) -> Result<String, WdError> {
        let value = request(&self.http, reqwest::Method::GET, &self.url("/url"), None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// End the session, closing the browser it drives.
    pub async fn quit(self) -> Result<(), WdError> {
        request(&self.http, reqwest::Method::DELETE, &self.url(""), None).await?;
        Ok(())
    }
}

/// Issue one driver request and unwrap the W3C `value` envelope.
async fn request(
    http: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, WdError> {
    let mut req = http.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }

    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            WdError::Timeout
        } else {
            WdError::Transport(e.to_string())
        }
    })?;

    let status = resp.status();
    let parsed: WdResponse = resp
        .json()
        .await
        .map_err(|e| WdError::Transport(format!("bad driver response: {e}")))?;

    if status.is_success() {
        return Ok(parsed.value);
    }

    // Error payloads put {error, message} inside value.
    let error = parsed
        .value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = parsed
        .value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(WdError::Driver { error, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_status_ready_reads_ready_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "ready": true, "message": "ChromeDriver ready for new sessions." }
            })))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        assert!(status_ready(&http, &server.uri()).await);
        // Same client against a dead endpoint: unreachable means not ready.
        assert!(!status_ready(&http, "http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_new_session_and_navigate() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "sessionId": "abc123", "capabilities": {} }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/session/abc123/url"))
            .and(body_partial_json(serde_json::json!({ "url": "https://example.com/" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": null
            })))
            .mount(&server)
            .await;

        let wd = WebDriver::new_session(&server.uri(), serde_json::json!({}))
            .await
            .unwrap();
        wd.navigate("https://example.com/").await.unwrap();
    }

    #[tokio::test]
    async fn test_find_element_absent_is_none() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "sessionId": "s1" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "value": { "error": "no such element", "message": "not found" }
            })))
            .mount(&server)
            .await;

        let wd = WebDriver::new_session(&server.uri(), serde_json::json!({}))
            .await
            .unwrap();
        let found = wd.find_element("css selector", ".missing").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_driver_timeout_error_detected() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "sessionId": "s2" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/session/s2/url"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "value": { "error": "timeout", "message": "page load timed out" }
            })))
            .mount(&server)
            .await;

        let wd = WebDriver::new_session(&server.uri(), serde_json::json!({}))
            .await
            .unwrap();
        let err = wd.navigate("https://slow.example/").await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_element_text_unwraps_value() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "sessionId": "s3" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/session/s3/element"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": { "element-6066-11e4-a52e-4f735466cecf": "el-9" }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/session/s3/element/el-9/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": "$12.34 USDC"
            })))
            .mount(&server)
            .await;

        let wd = WebDriver::new_session(&server.uri(), serde_json::json!({}))
            .await
            .unwrap();
        let el = wd
            .find_element("css selector", ".price")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wd.element_text(&el).await.unwrap(), "$12.34 USDC");
    }
}
