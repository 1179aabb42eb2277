//! Launching a Chromium-family browser with remote debugging enabled.

use replydesk_core::config::BrowserConfig;
use replydesk_core::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chrome,
    Edge,
}

impl BrowserEngine {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "edge" | "msedge" => Self::Edge,
            _ => Self::Chrome,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Edge => "edge",
        }
    }
}

/// A running browser process and its throwaway profile directory.
pub struct BrowserProcess {
    child: Option<Child>,
    pub debug_port: u16,
    pub user_data_dir: PathBuf,
}

impl BrowserProcess {
    /// Spawn the browser and return it with the WebSocket URL of its first page.
    pub async fn launch(config: &BrowserConfig, user_data_dir: PathBuf) -> Result<(Self, String)> {
        let engine = BrowserEngine::parse(&config.engine);
        let binary = match &config.executable {
            Some(path) if !path.trim().is_empty() => path.clone(),
            _ => find_browser_binary(engine).ok_or_else(|| {
                Error::Automation(format!("{} not found. Please install it.", engine.name()))
            })?,
        };

        std::fs::create_dir_all(&user_data_dir)?;
        let debug_port = find_free_port().await?;
        let args = build_browser_args(debug_port, &user_data_dir, config.headless, &config.extra_args);

        info!(
            port = debug_port,
            headless = config.headless,
            browser = engine.name(),
            "Launching browser"
        );

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Automation(format!("Failed to launch {}: {}", engine.name(), e)))?;

        let mut process = Self {
            child: Some(child),
            debug_port,
            user_data_dir,
        };

        let ready = async {
            wait_for_cdp_ready(debug_port, Duration::from_secs(config.launch_timeout_secs)).await?;
            get_page_ws_url(debug_port).await
        };
        match ready.await {
            Ok(ws_url) => Ok((process, ws_url)),
            Err(e) => {
                process.shutdown().await;
                Err(e)
            }
        }
    }

    /// Kill the process and remove the profile directory. Safe to repeat.
    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Browser process already gone");
            }
        }
        if self.user_data_dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
                debug!(error = %e, dir = %self.user_data_dir.display(), "Failed to remove profile dir");
            }
        }
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

pub fn build_browser_args(
    debug_port: u16,
    user_data_dir: &Path,
    headless: bool,
    extra: &[String],
) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--password-store=basic".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1366,900".to_string());
    for arg in extra {
        if !args.contains(arg) {
            args.push(arg.clone());
        }
    }
    args.push("about:blank".to_string());
    args
}

pub fn find_browser_binary(engine: BrowserEngine) -> Option<String> {
    let candidates = match engine {
        BrowserEngine::Chrome => {
            if cfg!(target_os = "macos") {
                vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                    "/Applications/Chromium.app/Contents/MacOS/Chromium",
                ]
            } else if cfg!(target_os = "linux") {
                vec![
                    "google-chrome", "google-chrome-stable",
                    "chromium", "chromium-browser",
                    "/usr/bin/google-chrome", "/usr/bin/chromium",
                ]
            } else {
                vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ]
            }
        }
        BrowserEngine::Edge => {
            if cfg!(target_os = "macos") {
                vec!["/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"]
            } else if cfg!(target_os = "linux") {
                vec!["microsoft-edge", "microsoft-edge-stable", "/usr/bin/microsoft-edge"]
            } else {
                vec![
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
                ]
            }
        }
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Poll `/json/version` until the DevTools endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if start.elapsed() > timeout {
            return Err(Error::Automation(format!(
                "Browser DevTools not ready after {}s on port {}",
                timeout.as_secs(),
                port
            )));
        }
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").is_some() {
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first page target listed by `/json/list`.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(targets) = resp.json::<Vec<Value>>().await else {
            continue;
        };
        if let Some(ws) = first_page_ws_url(&targets) {
            return Ok(ws);
        }
    }

    Err(Error::Automation("No page target found after retries".to_string()))
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
