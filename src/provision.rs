//! Browser session provisioning.
//!
//! Locates a Chrome binary, resolves a chromedriver whose major version
//! matches it (verifying an existing one or downloading a matching build
//! into the scratch directory), launches the driver, and opens one headless
//! session. The version-matching decision itself is a pure function
//! ([`plan_driver`]) so it can be tested without a browser on the machine.

use crate::config::Config;
use crate::error::FetchError;
use crate::webdriver::{self, WebDriver};
use regex::Regex;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Spoofed client identification, to look like an ordinary desktop Chrome.
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Chrome for Testing milestone feed with chromedriver download URLs.
const MILESTONE_FEED: &str =
    "https://googlechromelabs.github.io/chrome-for-testing/latest-versions-per-milestone-with-downloads.json";

/// How long to wait for a freshly launched chromedriver to report ready.
const DRIVER_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// One live headless browser bound to its driver process.
///
/// Owned exclusively by a single fetch attempt; [`close`](Self::close) must
/// run on every exit path. The driver child is `kill_on_drop`, so even a
/// panicking attempt cannot leak a browser process.
pub struct ProvisionedSession {
    pub session: WebDriver,
    child: tokio::process::Child,
}

impl ProvisionedSession {
    /// Tear down the session and the driver process behind it.
    pub async fn close(self) {
        if let Err(e) = self.session.quit().await {
            debug!("session quit failed (killing driver anyway): {e}");
        }
        let mut child = self.child;
        if let Err(e) = child.start_kill() {
            debug!("driver process already gone: {e}");
        }
        let _ = child.wait().await;
    }
}

/// What to do about the driver binary, given what is already installed.
#[derive(Debug, PartialEq, Eq)]
pub enum DriverPlan {
    /// An existing driver responded with a compatible major version.
    UseExisting(PathBuf),
    /// No usable driver; fetch one for this browser major.
    Fetch { major: u32 },
}

/// Decide which driver to use for a browser of the given major version.
///
/// `candidates` holds (path, reported major) for every driver that responded
/// to a version probe, in preference order. Pure: no filesystem access.
pub fn plan_driver(browser_major: u32, candidates: &[(PathBuf, u32)]) -> DriverPlan {
    for (path, major) in candidates {
        if *major == browser_major {
            return DriverPlan::UseExisting(path.clone());
        }
    }
    DriverPlan::Fetch {
        major: browser_major,
    }
}

/// Extract the major version from a `--version` banner like
/// `Google Chrome 120.0.6099.109` or `ChromeDriver 120.0.6099.71 (...)`.
pub fn parse_major(banner: &str) -> Option<u32> {
    let re = Regex::new(r"(\d+)\.\d+\.\d+").ok()?;
    re.captures(banner)?.get(1)?.as_str().parse().ok()
}

/// Locate the Chrome binary: explicit override first, then `$PATH`, then
/// well-known install locations.
pub fn find_chrome(override_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = override_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
        warn!("configured chrome binary {} does not exist", p.display());
    }

    for name in ["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    let mut candidates = vec![
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
    ];
    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ));
    }
    candidates.into_iter().find(|c| c.exists())
}

/// Scratch directory for downloaded drivers.
pub fn driver_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pricebeacon")
        .join("driver")
}

/// Run `<binary> --version` and parse the major version out of the banner.
fn probe_version(binary: &Path) -> Option<u32> {
    let output = Command::new(binary).arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_major(&String::from_utf8_lossy(&output.stdout))
}

/// Chrome-for-Testing platform label for the current machine.
fn current_platform() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", _) => "linux64",
        ("macos", "aarch64") => "mac-arm64",
        ("macos", _) => "mac-x64",
        ("windows", _) => "win64",
        _ => "linux64",
    }
}

/// Download a chromedriver matching `major` into `dest_dir`.
///
/// Pulls the milestone feed, picks the download for this platform, unzips
/// the single driver binary, and marks it executable.
async fn download_driver(major: u32, dest_dir: &Path) -> Result<PathBuf, FetchError> {
    let provision_err = |msg: String| FetchError::Provisioning(msg);

    info!("downloading chromedriver for Chrome {major}");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| provision_err(e.to_string()))?;

    let feed: serde_json::Value = client
        .get(MILESTONE_FEED)
        .send()
        .await
        .map_err(|e| provision_err(format!("milestone feed fetch failed: {e}")))?
        .json()
        .await
        .map_err(|e| provision_err(format!("milestone feed parse failed: {e}")))?;

    let platform = current_platform();
    let downloads = feed
        .pointer(&format!("/milestones/{major}/downloads/chromedriver"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| provision_err(format!("no chromedriver build for milestone {major}")))?;

    let url = downloads
        .iter()
        .find(|d| d.get("platform").and_then(|p| p.as_str()) == Some(platform))
        .and_then(|d| d.get("url").and_then(|u| u.as_str()))
        .ok_or_else(|| provision_err(format!("no chromedriver build for platform {platform}")))?;

    debug!("fetching {url}");
    let archive = client
        .get(url)
        .send()
        .await
        .map_err(|e| provision_err(format!("driver download failed: {e}")))?
        .bytes()
        .await
        .map_err(|e| provision_err(format!("driver download failed: {e}")))?;

    std::fs::create_dir_all(dest_dir)
        .map_err(|e| provision_err(format!("cannot create {}: {e}", dest_dir.display())))?;

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive.as_ref()))
        .map_err(|e| provision_err(format!("bad driver archive: {e}")))?;

    let driver_name = if cfg!(windows) { "chromedriver.exe" } else { "chromedriver" };
    let dest = dest_dir.join(driver_name);

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| provision_err(format!("bad driver archive: {e}")))?;
        if entry.is_dir() || !entry.name().ends_with(driver_name) {
            continue;
        }
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| provision_err(format!("bad driver archive: {e}")))?;
        std::fs::write(&dest, bytes)
            .map_err(|e| provision_err(format!("cannot write {}: {e}", dest.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| provision_err(format!("cannot chmod driver: {e}")))?;
        }

        info!("installed chromedriver {} at {}", major, dest.display());
        return Ok(dest);
    }

    Err(provision_err("archive contained no chromedriver binary".into()))
}

/// Resolve a driver binary compatible with the given browser major.
async fn ensure_driver(cfg: &Config, browser_major: u32) -> Result<PathBuf, FetchError> {
    let mut candidates: Vec<(PathBuf, u32)> = Vec::new();

    let mut paths: Vec<PathBuf> = Vec::new();
    if let Some(p) = &cfg.driver_path {
        paths.push(p.clone());
    }
    let installed = driver_dir().join(if cfg!(windows) { "chromedriver.exe" } else { "chromedriver" });
    paths.push(installed);
    if let Ok(p) = which::which("chromedriver") {
        paths.push(p);
    }

    for path in paths {
        if !path.exists() {
            continue;
        }
        match probe_version(&path) {
            Some(major) => candidates.push((path, major)),
            None => warn!("driver at {} did not answer a version probe", path.display()),
        }
    }

    match plan_driver(browser_major, &candidates) {
        DriverPlan::UseExisting(path) => {
            debug!("using existing chromedriver at {}", path.display());
            Ok(path)
        }
        DriverPlan::Fetch { major } => download_driver(major, &driver_dir()).await,
    }
}

/// W3C capabilities for a locked-down headless scrape session.
fn session_capabilities(chrome_bin: &Path) -> serde_json::Value {
    json!({
        "browserName": "chrome",
        "goog:chromeOptions": {
            "binary": chrome_bin.to_string_lossy(),
            "args": [
                "--headless=new",
                "--no-sandbox",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--disable-extensions",
                "--disable-background-timer-throttling",
                "--window-size=1280,720",
                format!("--user-agent={USER_AGENT}"),
                "--disable-blink-features=AutomationControlled",
            ],
            "excludeSwitches": ["enable-automation"],
        }
    })
}

/// Pick a free local port for the driver to listen on.
fn free_port() -> Result<u16, FetchError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .map_err(|e| FetchError::Provisioning(format!("no free port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| FetchError::Provisioning(format!("no free port: {e}")))?
        .port();
    Ok(port)
}

/// Provision one ready-to-drive headless browser session.
///
/// Fails with [`FetchError::Provisioning`] when the browser or a compatible
/// driver cannot be produced.
pub async fn provision(cfg: &Config) -> Result<ProvisionedSession, FetchError> {
    let chrome = find_chrome(cfg.chrome_bin.as_deref())
        .ok_or_else(|| FetchError::Provisioning("no Chrome binary found".into()))?;

    let browser_major = probe_version(&chrome).ok_or_else(|| {
        FetchError::Provisioning(format!(
            "could not read version of {}",
            chrome.display()
        ))
    })?;
    debug!("chrome {} major version {browser_major}", chrome.display());

    let driver = ensure_driver(cfg, browser_major).await?;

    let port = free_port()?;
    let child = tokio::process::Command::new(&driver)
        .arg(format!("--port={port}"))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            FetchError::Provisioning(format!("chromedriver launch failed: {e}"))
        })?;

    let base = format!("http://127.0.0.1:{port}");
    let status_http = reqwest::Client::new();
    let deadline = Instant::now() + DRIVER_READY_TIMEOUT;
    loop {
        if webdriver::status_ready(&status_http, &base).await {
            break;
        }
        if Instant::now() >= deadline {
            let mut child = child;
            let _ = child.start_kill();
            return Err(FetchError::Provisioning(
                "chromedriver never became ready".into(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let session = WebDriver::new_session(&base, session_capabilities(&chrome))
        .await
        .map_err(|e| FetchError::Provisioning(format!("session create failed: {e}")))?;

    info!(
        "provisioned session: chrome {} / driver {}",
        chrome.display(),
        driver.display()
    );
    Ok(ProvisionedSession { session, child })
}
