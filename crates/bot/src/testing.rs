//! Scripted in-memory automation driver for unit tests.

use async_trait::async_trait;
use replydesk_browser::{AutomationDriver, AutomationSession};
use replydesk_core::config::SelectorConfig;
use replydesk_core::{ConversationMessage, Error, OrderInfo, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginScript {
    Immediate,
    CodeRequired,
    NoOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct FakeConversation {
    pub messages: Vec<ConversationMessage>,
    pub order: OrderInfo,
    pub open_fails: bool,
    pub read_fails: bool,
}

impl FakeConversation {
    pub fn with_messages(messages: Vec<ConversationMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

pub struct WorldState {
    pub login: LoginScript,
    pub accepted_code: String,
    pub code_labels: Vec<String>,
    pub launches: usize,
    /// Launches beyond this count fail.
    pub launch_limit: Option<usize>,
    /// Launch fails with an I/O error instead of starting a session.
    pub launch_io_error: bool,
    pub open_sessions: usize,
    pub restored: Vec<Option<Vec<u8>>>,
    pub clicked_labels: Vec<String>,
    pub filled: Vec<(String, String)>,
    pub conversations: Vec<FakeConversation>,
    /// Number of upcoming `list_conversations` calls that fail.
    pub fail_list: usize,
    pub list_calls: usize,
    pub list_delay: Duration,
    /// How long waiting for a non-code selector takes.
    pub ready_delay: Duration,
    pub sent: Vec<(Option<usize>, String)>,
    pub skipped: Vec<Option<usize>>,
    pub has_skip_control: bool,
    pub fail_send: bool,
    pub tracking: Option<String>,
    pub filter_applied: usize,
}

impl Default for WorldState {
    fn default() -> Self {
        Self {
            login: LoginScript::Immediate,
            accepted_code: "123456".to_string(),
            code_labels: vec!["Resend code".to_string(), "Confirm".to_string()],
            launches: 0,
            launch_limit: None,
            launch_io_error: false,
            open_sessions: 0,
            restored: Vec::new(),
            clicked_labels: Vec::new(),
            filled: Vec::new(),
            conversations: Vec::new(),
            fail_list: 0,
            list_calls: 0,
            list_delay: Duration::ZERO,
            ready_delay: Duration::ZERO,
            sent: Vec::new(),
            skipped: Vec::new(),
            has_skip_control: true,
            fail_send: false,
            tracking: None,
            filter_applied: 0,
        }
    }
}

/// Shared handle to the scripted world; clones observe the same state.
#[derive(Clone, Default)]
pub struct FakeWorld(Arc<Mutex<WorldState>>);

impl FakeWorld {
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, WorldState> {
        self.0.lock().unwrap()
    }

    pub fn driver(&self) -> Arc<dyn AutomationDriver> {
        Arc::new(FakeDriver { world: self.clone() })
    }

    /// A session created outside the driver, counted as open.
    pub fn new_session(&self) -> Box<dyn AutomationSession> {
        let mut state = self.state();
        state.open_sessions += 1;
        Box::new(FakeSession::new(self.clone()))
    }

    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    pub fn launches(&self) -> usize {
        self.state().launches
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.state().sent.iter().map(|(_, t)| t.clone()).collect()
    }
}

pub struct FakeDriver {
    world: FakeWorld,
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn launch(&self, restore: Option<Vec<u8>>) -> Result<Box<dyn AutomationSession>> {
        {
            let mut state = self.world.state();
            state.launches += 1;
            if state.launch_io_error {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "/srv/replydesk/profiles: permission denied",
                )
                .into());
            }
            if let Some(limit) = state.launch_limit {
                if state.launches > limit {
                    return Err(Error::Automation("browser failed to start".to_string()));
                }
            }
            state.restored.push(restore);
            state.open_sessions += 1;
        }
        Ok(Box::new(FakeSession::new(self.world.clone())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    LoginForm,
    CodePrompt,
    Dashboard,
}

pub struct FakeSession {
    world: FakeWorld,
    stage: Stage,
    code: Option<String>,
    open: Option<usize>,
    closed: bool,
    code_selector: String,
}

impl FakeSession {
    fn new(world: FakeWorld) -> Self {
        Self {
            world,
            stage: Stage::LoginForm,
            code: None,
            open: None,
            closed: false,
            code_selector: SelectorConfig::default().code_input,
        }
    }

    fn labels(&self) -> Vec<String> {
        match self.stage {
            Stage::LoginForm => vec![
                "Forgot password".to_string(),
                "Send SMS".to_string(),
                "Login".to_string(),
            ],
            Stage::CodePrompt => self.world.state().code_labels.clone(),
            Stage::Dashboard => vec!["Logout".to_string()],
        }
    }
}

#[async_trait]
impl AutomationSession for FakeSession {
    async fn navigate(&mut self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String> {
        let path = match self.stage {
            Stage::LoginForm => "login",
            Stage::CodePrompt => "verify",
            Stage::Dashboard => "dashboard",
        };
        Ok(format!("https://portal.test/#/{}", path))
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<()> {
        if selector == self.code_selector {
            if self.stage != Stage::CodePrompt {
                return Err(Error::Automation("code field not present".to_string()));
            }
            self.code = Some(text.to_string());
        }
        self.world
            .state()
            .filled
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn click(&mut self, _selector: &str) -> Result<()> {
        Ok(())
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<bool> {
        if selector == self.code_selector {
            return Ok(self.stage == Stage::CodePrompt);
        }
        let delay = self.world.state().ready_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(true)
    }

    async fn control_labels(&mut self) -> Result<Vec<String>> {
        Ok(self.labels())
    }

    async fn click_control(&mut self, index: usize) -> Result<()> {
        let labels = self.labels();
        let label = labels
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Automation(format!("No control at index {}", index)))?;
        let (script, accepted) = {
            let mut state = self.world.state();
            state.clicked_labels.push(label.clone());
            (state.login, state.accepted_code.clone())
        };
        match self.stage {
            Stage::LoginForm if label == "Login" || label == "Send SMS" => {
                self.stage = match script {
                    LoginScript::Immediate => Stage::Dashboard,
                    LoginScript::CodeRequired => Stage::CodePrompt,
                    LoginScript::NoOutcome => Stage::LoginForm,
                };
            }
            Stage::CodePrompt if self.code.as_deref() == Some(accepted.as_str()) => {
                self.stage = Stage::Dashboard;
            }
            _ => {}
        }
        Ok(())
    }

    async fn export_state(&mut self) -> Result<Vec<u8>> {
        Ok(br#"{"cookies":[{"name":"sid","value":"fake"}]}"#.to_vec())
    }

    async fn list_conversations(&mut self) -> Result<usize> {
        let delay = {
            let mut state = self.world.state();
            state.list_calls += 1;
            if state.fail_list > 0 {
                state.fail_list -= 1;
                return Err(Error::Automation("page crashed".to_string()));
            }
            state.list_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.world.state().conversations.len())
    }

    async fn open_conversation(&mut self, index: usize) -> Result<bool> {
        let open_fails = self
            .world
            .state()
            .conversations
            .get(index)
            .map(|c| c.open_fails);
        match open_fails {
            None => Ok(false),
            Some(true) => Err(Error::Automation("click intercepted".to_string())),
            Some(false) => {
                self.open = Some(index);
                Ok(true)
            }
        }
    }

    async fn read_messages(&mut self, depth: usize) -> Result<Vec<ConversationMessage>> {
        let state = self.world.state();
        let Some(conv) = self.open.and_then(|i| state.conversations.get(i)) else {
            return Ok(Vec::new());
        };
        if conv.read_fails {
            return Err(Error::Automation("message panel detached".to_string()));
        }
        let skip = conv.messages.len().saturating_sub(depth);
        Ok(conv.messages[skip..].to_vec())
    }

    async fn read_order_info(&mut self) -> Result<OrderInfo> {
        let state = self.world.state();
        Ok(self
            .open
            .and_then(|i| state.conversations.get(i))
            .map(|c| c.order.clone())
            .unwrap_or_default())
    }

    async fn read_tracking_code(&mut self) -> Result<Option<String>> {
        Ok(self.world.state().tracking.clone())
    }

    async fn send_message(&mut self, text: &str) -> Result<()> {
        let mut state = self.world.state();
        if state.fail_send {
            return Err(Error::Automation("message box not found".to_string()));
        }
        state.sent.push((self.open, text.to_string()));
        Ok(())
    }

    async fn skip_conversation(&mut self) -> Result<bool> {
        let mut state = self.world.state();
        if !state.has_skip_control {
            return Ok(false);
        }
        state.skipped.push(self.open);
        Ok(true)
    }

    async fn apply_needs_reply_filter(&mut self) -> Result<()> {
        self.world.state().filter_applied += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.world.state().open_sessions -= 1;
        }
    }
}
