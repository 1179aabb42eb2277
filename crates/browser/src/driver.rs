//! Interface to the browser-automation capability.
//!
//! The login flow, the scanner and the supervisor only ever talk to these two
//! traits. `CdpDriver` is the production implementation; tests script their
//! own.

use async_trait::async_trait;
use replydesk_core::{ConversationMessage, OrderInfo, Result};
use std::time::Duration;

/// Factory for automation sessions.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Start a fresh browser session, optionally restoring exported state.
    async fn launch(&self, restore: Option<Vec<u8>>) -> Result<Box<dyn AutomationSession>>;
}

/// One live browser page plus whatever process backs it.
///
/// Every method is a suspension point. `close` must be safe to call more
/// than once and must never fail.
#[async_trait]
pub trait AutomationSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    async fn current_url(&mut self) -> Result<String>;

    /// Replace the content of the first visible element matching `selector`.
    async fn fill(&mut self, selector: &str, text: &str) -> Result<()>;

    async fn click(&mut self, selector: &str) -> Result<()>;

    /// `Ok(false)` on timeout.
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<bool>;

    async fn has_selector(&mut self, selector: &str) -> Result<bool> {
        self.wait_for_selector(selector, Duration::ZERO).await
    }

    /// Labels of the clickable controls on the page, in document order.
    async fn control_labels(&mut self) -> Result<Vec<String>>;

    /// Click the control at `index` in the order returned by `control_labels`.
    async fn click_control(&mut self, index: usize) -> Result<()>;

    /// Serialize the authenticated state (cookies, storage) of the session.
    async fn export_state(&mut self) -> Result<Vec<u8>>;

    /// Number of conversation entries currently visible.
    async fn list_conversations(&mut self) -> Result<usize>;

    /// `Ok(false)` when the entry is gone.
    async fn open_conversation(&mut self, index: usize) -> Result<bool>;

    /// Newest `depth` messages of the open conversation, oldest first.
    async fn read_messages(&mut self, depth: usize) -> Result<Vec<ConversationMessage>>;

    async fn read_order_info(&mut self) -> Result<OrderInfo>;

    async fn read_tracking_code(&mut self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn send_message(&mut self, text: &str) -> Result<()>;

    /// Dismiss the open conversation. `Ok(false)` if the portal has no such control.
    async fn skip_conversation(&mut self) -> Result<bool> {
        Ok(false)
    }

    async fn apply_needs_reply_filter(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self);
}
