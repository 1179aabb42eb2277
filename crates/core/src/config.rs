use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

/// Portal endpoints and the URL fragments that identify its states.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Page the monitoring loop lands on after restoring a session.
    #[serde(default = "default_home_url")]
    pub home_url: String,
    /// Identity whose session the supervisor runs with.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_dashboard_marker")]
    pub dashboard_marker: String,
    #[serde(default = "default_verify_marker")]
    pub verify_marker: String,
}

fn default_login_url() -> String {
    "https://web.duoke.com/?lang=en#/dk/login".to_string()
}

fn default_home_url() -> String {
    "https://web.duoke.com/?lang=en#/dk/main/chat".to_string()
}

fn default_identity() -> String {
    "default".to_string()
}

fn default_dashboard_marker() -> String {
    "dashboard".to_string()
}

fn default_verify_marker() -> String {
    "verify".to_string()
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            home_url: default_home_url(),
            identity: default_identity(),
            dashboard_marker: default_dashboard_marker(),
            verify_marker: default_verify_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginConfig {
    /// How long `start` waits for either the dashboard or the code prompt.
    #[serde(default = "default_outcome_wait_secs")]
    pub outcome_wait_secs: u64,
    /// How long `verify` waits for the portal to settle after the code is submitted.
    #[serde(default = "default_code_timeout_secs")]
    pub code_timeout_secs: u64,
    #[serde(default = "default_attempt_ttl_secs")]
    pub attempt_ttl_secs: u64,
    /// Case-insensitive label fragments used to pick the confirmation control.
    #[serde(default = "default_confirm_tokens")]
    pub confirm_tokens: Vec<String>,
}

fn default_outcome_wait_secs() -> u64 {
    60
}

fn default_code_timeout_secs() -> u64 {
    180
}

fn default_attempt_ttl_secs() -> u64 {
    600
}

fn default_confirm_tokens() -> Vec<String> {
    ["verify", "confirm", "submit", "login"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            outcome_wait_secs: default_outcome_wait_secs(),
            code_timeout_secs: default_code_timeout_secs(),
            attempt_ttl_secs: default_attempt_ttl_secs(),
            confirm_tokens: default_confirm_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default = "default_cycle_delay_ms")]
    pub cycle_delay_ms: u64,
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,
    /// 0 means no cap.
    #[serde(default)]
    pub max_conversations: usize,
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    #[serde(default)]
    pub apply_needs_reply_filter: bool,
    /// Appended to replies; `{status}` is replaced with the order status.
    #[serde(default = "default_status_line")]
    pub status_line: String,
    /// Upper bound for the chat list to show up after a session is restored.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_cycle_delay_ms() -> u64 {
    5000
}

fn default_action_delay_ms() -> u64 {
    1000
}

fn default_history_depth() -> usize {
    5
}

fn default_status_line() -> String {
    "\n\n_Status atual do pedido:_ **{status}**".to_string()
}

fn default_ready_timeout_secs() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cycle_delay_ms: default_cycle_delay_ms(),
            action_delay_ms: default_action_delay_ms(),
            max_conversations: 0,
            history_depth: default_history_depth(),
            apply_needs_reply_filter: false,
            status_line: default_status_line(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// "chrome" or "edge".
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Explicit browser binary; discovered on PATH when unset.
    #[serde(default)]
    pub executable: Option<String>,
    /// Profile root. Defaults to `<base>/profiles`.
    #[serde(default)]
    pub profile_dir: Option<String>,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
}

fn default_engine() -> String {
    "chrome".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_extra_args() -> Vec<String> {
    vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
    ]
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            headless: default_headless(),
            executable: None,
            profile_dir: None,
            launch_timeout_secs: default_launch_timeout_secs(),
            extra_args: default_extra_args(),
        }
    }
}

/// CSS selectors for the portal's markup. Comma-separated lists are tried in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorConfig {
    #[serde(default = "default_email_input")]
    pub email_input: String,
    #[serde(default = "default_password_input")]
    pub password_input: String,
    #[serde(default = "default_phone_input")]
    pub phone_input: String,
    #[serde(default = "default_code_input")]
    pub code_input: String,
    /// Controls whose labels are offered to the confirm-control heuristic.
    #[serde(default = "default_buttons")]
    pub buttons: String,
    #[serde(default = "default_chat_list_item")]
    pub chat_list_item: String,
    #[serde(default = "default_message_container")]
    pub message_container: String,
    #[serde(default = "default_message_item")]
    pub message_item: String,
    #[serde(default = "default_message_text")]
    pub message_text: String,
    #[serde(default = "default_buyer_class")]
    pub buyer_class: String,
    #[serde(default = "default_seller_class")]
    pub seller_class: String,
    #[serde(default = "default_input_textarea")]
    pub input_textarea: String,
    #[serde(default)]
    pub send_button: String,
    #[serde(default)]
    pub skip_button: String,
    #[serde(default)]
    pub filter_needs_reply: String,
}

fn default_email_input() -> String {
    "input[name='email']".to_string()
}

fn default_password_input() -> String {
    "input[name='password']".to_string()
}

fn default_phone_input() -> String {
    "input[placeholder='Telefone']".to_string()
}

fn default_code_input() -> String {
    "input[placeholder*='verification' i], input[type='tel']".to_string()
}

fn default_buttons() -> String {
    "button, [role='button'], input[type='submit']".to_string()
}

fn default_chat_list_item() -> String {
    "ul.chat_list li".to_string()
}

fn default_message_container() -> String {
    "ul.message_main".to_string()
}

fn default_message_item() -> String {
    "ul.message_main > li".to_string()
}

fn default_message_text() -> String {
    "div.text_cont, .bubble .text, .record_item .content".to_string()
}

fn default_buyer_class() -> String {
    "lt".to_string()
}

fn default_seller_class() -> String {
    "rt".to_string()
}

fn default_input_textarea() -> String {
    "textarea, div[contenteditable='true']".to_string()
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            email_input: default_email_input(),
            password_input: default_password_input(),
            phone_input: default_phone_input(),
            code_input: default_code_input(),
            buttons: default_buttons(),
            chat_list_item: default_chat_list_item(),
            message_container: default_message_container(),
            message_item: default_message_item(),
            message_text: default_message_text(),
            buyer_class: default_buyer_class(),
            seller_class: default_seller_class(),
            input_textarea: default_input_textarea(),
            send_button: String::new(),
            skip_button: String::new(),
            filter_needs_reply: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    18800
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            api_token: None,
            allowed_origins: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Bearer token for the gateway, with `REPLYDESK_API_TOKEN` taking precedence.
    pub fn api_token(&self) -> Option<String> {
        std::env::var("REPLYDESK_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                self.gateway
                    .api_token
                    .clone()
                    .filter(|t| !t.trim().is_empty())
            })
    }

    /// Directory under which the automation driver keeps browser profiles.
    pub fn profile_root(&self, paths: &Paths) -> std::path::PathBuf {
        match &self.browser.profile_dir {
            Some(dir) if !dir.trim().is_empty() => std::path::PathBuf::from(dir),
            _ => paths.profiles_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let raw = r#"{
  "portal": { "identity": "shop-a" },
  "monitor": { "maxConversations": 3, "applyNeedsReplyFilter": true }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.portal.identity, "shop-a");
        assert_eq!(cfg.portal.dashboard_marker, "dashboard");
        assert_eq!(cfg.monitor.max_conversations, 3);
        assert!(cfg.monitor.apply_needs_reply_filter);
        assert_eq!(cfg.monitor.cycle_delay_ms, 5000);
        assert_eq!(cfg.login.code_timeout_secs, 180);
        assert_eq!(cfg.login.attempt_ttl_secs, 600);
        assert_eq!(cfg.selectors.chat_list_item, "ul.chat_list li");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.gateway.port = 9999;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.gateway.port, 9999);
    }

    #[test]
    fn test_profile_root_defaults_under_base() {
        let paths = Paths::with_base(std::path::PathBuf::from("/srv/rd"));
        let cfg = Config::default();
        assert_eq!(cfg.profile_root(&paths), paths.profiles_dir());
    }
}
