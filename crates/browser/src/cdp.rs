//! Minimal Chrome DevTools Protocol client over WebSocket.
//!
//! A writer task owns the socket sink, a reader task routes responses back to
//! the waiting caller by command id.

use futures::{SinkExt, StreamExt};
use replydesk_core::{Error, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    command_timeout: Duration,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str, command_timeout: Duration) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| cdp_err(format!("connect {}: {}", ws_url, e)))?;

        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pending_reader = pending.clone();

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        // Events carry no id and are not used here.
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_reader.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Wake everyone still waiting; their senders drop here.
            pending_reader.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            command_timeout,
            reader_handle,
            writer_handle,
        })
    }

    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(cdp_err(format!("{}: connection closed", method)));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.get("error") {
                    Err(cdp_err(format!("{}: {}", method, error)))
                } else {
                    Ok(response.get("result").cloned().unwrap_or(Value::Null))
                }
            }
            Ok(Err(_)) => Err(cdp_err(format!("{}: connection closed", method))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(cdp_err(format!(
                    "{} timed out after {}s",
                    method,
                    self.command_timeout.as_secs()
                )))
            }
        }
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.send_command("Page.navigate", json!({"url": url})).await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(cdp_err(format!("navigation to {} failed: {}", url, err)));
        }
        Ok(())
    }

    /// Evaluate `expression` and return its JSON value. A thrown exception
    /// becomes an error.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(|d| d.as_str())
                .or_else(|| details.get("text").and_then(|t| t.as_str()))
                .unwrap_or("script exception");
            return Err(cdp_err(format!("script failed: {}", text)));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn evaluate_bool(&self, expression: &str) -> Result<bool> {
        Ok(self.evaluate(expression).await?.as_bool().unwrap_or(false))
    }

    /// Insert text at the focused element (bypasses key events).
    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.send_command("Input.insertText", json!({"text": text})).await?;
        Ok(())
    }

    pub async fn press_enter(&self) -> Result<()> {
        self.send_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyDown",
                "key": "Enter",
                "code": "Enter",
                "windowsVirtualKeyCode": 13,
                "text": "\r",
            }),
        )
        .await?;
        self.send_command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": "Enter",
                "code": "Enter",
                "windowsVirtualKeyCode": 13,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_all_cookies(&self) -> Result<Vec<Value>> {
        let result = self.send_command("Network.getAllCookies", json!({})).await?;
        Ok(result
            .get("cookies")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn set_cookies(&self, cookies: Vec<Value>) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        self.send_command("Network.setCookies", json!({"cookies": cookies}))
            .await?;
        Ok(())
    }

    /// Run `source` in every new document before page scripts.
    pub async fn add_script_on_new_document(&self, source: &str) -> Result<()> {
        self.send_command(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({"source": source}),
        )
        .await?;
        Ok(())
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

fn cdp_err(msg: String) -> Error {
    Error::Automation(format!("CDP: {}", msg))
}
