//! `AutomationDriver` backed by a locally launched Chromium over CDP.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use replydesk_core::config::{BrowserConfig, SelectorConfig};
use replydesk_core::{ConversationMessage, Error, OrderInfo, Result, Role};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cdp::CdpClient;
use crate::driver::{AutomationDriver, AutomationSession};
use crate::launcher::BrowserProcess;
use crate::scripts;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const PANEL_TIMEOUT: Duration = Duration::from_secs(15);
const INPUT_TIMEOUT: Duration = Duration::from_secs(8);
const MESSAGE_BOX_PLACEHOLDER: &str = "Type a message here|press Enter to send|Enter to send";

static TRACKING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{2}\d{8,}[A-Z0-9]+)\b").expect("valid tracking regex"));

/// Exported authenticated state: cookies plus localStorage per origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserState {
    #[serde(default)]
    pub cookies: Vec<Value>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStorage {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Map<String, Value>,
}

pub struct CdpDriver {
    config: BrowserConfig,
    selectors: SelectorConfig,
    profile_root: PathBuf,
}

impl CdpDriver {
    pub fn new(config: BrowserConfig, selectors: SelectorConfig, profile_root: PathBuf) -> Self {
        Self {
            config,
            selectors,
            profile_root,
        }
    }
}

#[async_trait]
impl AutomationDriver for CdpDriver {
    async fn launch(&self, restore: Option<Vec<u8>>) -> Result<Box<dyn AutomationSession>> {
        let profile = self
            .profile_root
            .join(format!("run-{}", uuid::Uuid::new_v4().simple()));
        let (mut process, ws_url) = BrowserProcess::launch(&self.config, profile).await?;

        let connected = async {
            let cdp = CdpClient::connect(&ws_url, COMMAND_TIMEOUT).await?;
            cdp.enable_domain("Page").await?;
            cdp.enable_domain("Runtime").await?;
            cdp.enable_domain("Network").await?;
            if let Some(bytes) = restore {
                restore_state(&cdp, &bytes).await?;
            }
            Ok::<_, Error>(cdp)
        };

        match connected.await {
            Ok(cdp) => {
                info!(port = process.debug_port, "Automation session ready");
                Ok(Box::new(CdpSession {
                    process,
                    cdp: Some(cdp),
                    selectors: self.selectors.clone(),
                }))
            }
            Err(e) => {
                process.shutdown().await;
                Err(e)
            }
        }
    }
}

async fn restore_state(cdp: &CdpClient, bytes: &[u8]) -> Result<()> {
    let state: BrowserState = serde_json::from_slice(bytes)
        .map_err(|e| {
            warn!(error = %e, "Stored browser state did not parse");
            Error::Automation("Stored browser state is malformed".to_string())
        })?;
    let cookies: Vec<Value> = state.cookies.iter().filter_map(cookie_param).collect();
    debug!(cookies = cookies.len(), origins = state.origins.len(), "Restoring browser state");
    cdp.set_cookies(cookies).await?;
    for origin in &state.origins {
        if origin.local_storage.is_empty() {
            continue;
        }
        cdp.add_script_on_new_document(&scripts::restore_local_storage(
            &origin.origin,
            &origin.local_storage,
        ))
        .await?;
    }
    Ok(())
}

/// Reduce a `Network.getAllCookies` entry to a `Network.setCookies` parameter.
pub fn cookie_param(cookie: &Value) -> Option<Value> {
    let name = cookie.get("name")?.as_str()?;
    let value = cookie.get("value")?.as_str()?;
    let domain = cookie.get("domain")?.as_str()?;

    let mut param = json!({
        "name": name,
        "value": value,
        "domain": domain,
        "path": cookie.get("path").and_then(|v| v.as_str()).unwrap_or("/"),
    });
    for key in ["secure", "httpOnly", "sameSite"] {
        if let Some(v) = cookie.get(key) {
            param[key] = v.clone();
        }
    }
    let session = cookie.get("session").and_then(|v| v.as_bool()).unwrap_or(false);
    if let Some(expires) = cookie.get("expires").and_then(|v| v.as_f64()) {
        if !session && expires > 0.0 {
            param["expires"] = json!(expires);
        }
    }
    Some(param)
}

pub fn find_tracking_code(text: &str) -> Option<String> {
    TRACKING_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn parse_messages(value: Value) -> Vec<ConversationMessage> {
    let Value::Array(rows) = value else {
        return Vec::new();
    };
    rows.into_iter()
        .filter_map(|row| {
            let pair = row.as_array()?;
            let role = match pair.first()?.as_str()? {
                "buyer" => Role::Buyer,
                "seller" => Role::Seller,
                _ => Role::System,
            };
            let text = pair.get(1)?.as_str()?.trim();
            (!text.is_empty()).then(|| ConversationMessage::new(role, text))
        })
        .collect()
}

fn parse_order_info(value: Value) -> OrderInfo {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let fields: BTreeMap<String, String> = value
        .get("fields")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default();
    OrderInfo {
        status: text("status"),
        order_id: text("orderId"),
        title: text("title"),
        variation: text("variation"),
        sku: text("sku"),
        fields,
    }
}

pub struct CdpSession {
    process: BrowserProcess,
    cdp: Option<CdpClient>,
    selectors: SelectorConfig,
}

impl CdpSession {
    fn cdp(&self) -> Result<&CdpClient> {
        self.cdp
            .as_ref()
            .ok_or_else(|| Error::Automation("automation session is closed".to_string()))
    }

    async fn wait_until_loaded(&self) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < NAVIGATION_TIMEOUT {
            let state = self.cdp()?.evaluate(&scripts::ready_state()).await?;
            if state.as_str().map(|s| s != "loading").unwrap_or(false) {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!("Document still loading after navigation timeout");
        Ok(())
    }

    async fn focus_message_box(&self) -> Result<()> {
        let cdp = self.cdp()?;
        if !self.selectors.input_textarea.trim().is_empty()
            && cdp
                .evaluate_bool(&scripts::focus_and_clear(&self.selectors.input_textarea))
                .await?
        {
            return Ok(());
        }
        if cdp
            .evaluate_bool(&scripts::focus_by_placeholder(MESSAGE_BOX_PLACEHOLDER))
            .await?
        {
            return Ok(());
        }
        Err(Error::Automation("Message box not found".to_string()))
    }
}

#[async_trait]
impl AutomationSession for CdpSession {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        url::Url::parse(url).map_err(|e| Error::Automation(format!("Invalid URL {}: {}", url, e)))?;
        self.cdp()?.navigate(url).await?;
        self.wait_until_loaded().await
    }

    async fn current_url(&mut self) -> Result<String> {
        let href = self.cdp()?.evaluate(&scripts::location_href()).await?;
        Ok(href.as_str().unwrap_or_default().to_string())
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<()> {
        let cdp = self.cdp()?;
        if !cdp.evaluate_bool(&scripts::focus_and_clear(selector)).await? {
            return Err(Error::Automation(format!("Element not found: {}", selector)));
        }
        cdp.insert_text(text).await?;
        cdp.evaluate(&scripts::dispatch_input_event()).await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        if !self.cdp()?.evaluate_bool(&scripts::click(selector)).await? {
            return Err(Error::Automation(format!("Element not found: {}", selector)));
        }
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        let js = scripts::exists(selector);
        loop {
            if self.cdp()?.evaluate_bool(&js).await? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn control_labels(&mut self) -> Result<Vec<String>> {
        let value = self
            .cdp()?
            .evaluate(&scripts::control_labels(&self.selectors.buttons))
            .await?;
        Ok(value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn click_control(&mut self, index: usize) -> Result<()> {
        let js = scripts::click_control(&self.selectors.buttons, index);
        if !self.cdp()?.evaluate_bool(&js).await? {
            return Err(Error::Automation(format!("No control at index {}", index)));
        }
        Ok(())
    }

    async fn export_state(&mut self) -> Result<Vec<u8>> {
        let cdp = self.cdp()?;
        let cookies = cdp.get_all_cookies().await?;
        let dump = cdp.evaluate(&scripts::dump_local_storage()).await?;

        let mut origins = Vec::new();
        if let Some(origin) = dump.get("origin").and_then(|v| v.as_str()) {
            let local_storage = dump
                .get("entries")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            if origin.starts_with("http") {
                origins.push(OriginStorage {
                    origin: origin.to_string(),
                    local_storage,
                });
            }
        }
        let state = BrowserState { cookies, origins };
        Ok(serde_json::to_vec(&state)?)
    }

    async fn list_conversations(&mut self) -> Result<usize> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let value = self
            .cdp()?
            .evaluate(&scripts::count(&self.selectors.chat_list_item))
            .await?;
        Ok(value.as_u64().unwrap_or(0) as usize)
    }

    async fn open_conversation(&mut self, index: usize) -> Result<bool> {
        let js = scripts::click_nth(&self.selectors.chat_list_item, index);
        if !self.cdp()?.evaluate_bool(&js).await? {
            return Ok(false);
        }
        let container = self.selectors.message_container.clone();
        if !container.is_empty() && !self.wait_for_selector(&container, PANEL_TIMEOUT).await? {
            debug!(index, "Message panel did not render in time");
        }
        let input = self.selectors.input_textarea.clone();
        if !input.is_empty() {
            self.wait_for_selector(&input, INPUT_TIMEOUT).await?;
        }
        Ok(true)
    }

    async fn read_messages(&mut self, depth: usize) -> Result<Vec<ConversationMessage>> {
        let cdp = self.cdp()?;
        // Pull older history into view.
        for _ in 0..3 {
            cdp.evaluate(&scripts::scroll_to_top(&self.selectors.message_container))
                .await?;
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        let value = cdp
            .evaluate(&scripts::read_messages(
                &self.selectors.message_item,
                &self.selectors.message_text,
                &self.selectors.buyer_class,
                &self.selectors.seller_class,
            ))
            .await?;
        let mut messages = parse_messages(value);
        if depth > 0 && messages.len() > depth {
            messages.drain(..messages.len() - depth);
        }
        Ok(messages)
    }

    async fn read_order_info(&mut self) -> Result<OrderInfo> {
        let value = self.cdp()?.evaluate(&scripts::read_order_info()).await?;
        Ok(parse_order_info(value))
    }

    async fn read_tracking_code(&mut self) -> Result<Option<String>> {
        let text = self.cdp()?.evaluate(&scripts::page_text()).await?;
        Ok(text.as_str().and_then(find_tracking_code))
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        self.focus_message_box().await?;
        let cdp = self.cdp()?;
        cdp.insert_text(text).await?;
        cdp.evaluate(&scripts::dispatch_input_event()).await?;
        cdp.press_enter().await?;

        if !self.selectors.send_button.trim().is_empty() {
            let clicked = cdp
                .evaluate_bool(&scripts::click(&self.selectors.send_button))
                .await
                .unwrap_or(false);
            debug!(clicked, "Send button");
        }
        Ok(())
    }

    async fn skip_conversation(&mut self) -> Result<bool> {
        if self.selectors.skip_button.trim().is_empty() {
            return Ok(false);
        }
        let js = scripts::click(&self.selectors.skip_button);
        self.cdp()?.evaluate_bool(&js).await
    }

    async fn apply_needs_reply_filter(&mut self) -> Result<()> {
        if self.selectors.filter_needs_reply.trim().is_empty() {
            return Ok(());
        }
        let js = scripts::click(&self.selectors.filter_needs_reply);
        if self.cdp()?.evaluate_bool(&js).await? {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(cdp) = self.cdp.take() {
            if let Err(e) = cdp.send_command("Browser.close", json!({})).await {
                debug!(error = %e, "Browser.close failed (may already be closed)");
            }
        }
        self.process.shutdown().await;
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        if self.cdp.is_some() {
            warn!("Automation session dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_param_drops_read_only_fields() {
        let cookie = json!({
            "name": "sid", "value": "abc", "domain": ".example.com", "path": "/",
            "expires": 1900000000.0, "size": 6, "httpOnly": true, "secure": true,
            "session": false, "sameSite": "Lax", "priority": "Medium"
        });
        let param = cookie_param(&cookie).unwrap();
        assert_eq!(param["name"], "sid");
        assert_eq!(param["expires"], 1900000000.0);
        assert!(param.get("size").is_none());
        assert!(param.get("session").is_none());
    }

    #[test]
    fn test_cookie_param_session_cookie_has_no_expiry() {
        let cookie = json!({"name": "a", "value": "b", "domain": "x", "expires": -1, "session": true});
        let param = cookie_param(&cookie).unwrap();
        assert!(param.get("expires").is_none());
        assert_eq!(param["path"], "/");
        assert!(cookie_param(&json!({"name": "a"})).is_none());
    }

    #[test]
    fn test_find_tracking_code() {
        assert_eq!(
            find_tracking_code("Your parcel BR12345678901X is on its way").as_deref(),
            Some("BR12345678901X")
        );
        assert_eq!(find_tracking_code("order 12345678"), None);
    }

    #[test]
    fn test_parse_messages_roles_and_blanks() {
        let raw = json!([["buyer", " hi "], ["seller", "hello"], ["other", "notice"], ["buyer", "  "]]);
        let msgs = parse_messages(raw);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0], ConversationMessage::buyer("hi"));
        assert_eq!(msgs[1].role, Role::Seller);
        assert_eq!(msgs[2].role, Role::System);
    }

    #[test]
    fn test_parse_order_info_empty_strings_are_none() {
        let info = parse_order_info(json!({
            "status": "Shipped", "orderId": "", "title": "Mug",
            "fields": {"SKU": "M-1", "Qty": 2}
        }));
        assert_eq!(info.status.as_deref(), Some("Shipped"));
        assert_eq!(info.order_id, None);
        assert_eq!(info.fields.get("SKU").map(String::as_str), Some("M-1"));
        assert!(!info.fields.contains_key("Qty"));
    }

    #[test]
    fn test_browser_state_round_trips_through_json() {
        let raw = br#"{"cookies":[{"name":"sid","value":"1","domain":"d"}],"origins":[{"origin":"https://x","localStorage":{"k":"v"}}]}"#;
        let state: BrowserState = serde_json::from_slice(raw).unwrap();
        assert_eq!(state.cookies.len(), 1);
        assert_eq!(state.origins[0].local_storage["k"], "v");
    }
}
