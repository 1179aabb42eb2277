//! Owner of the single monitoring loop and the live automation session.

use replydesk_browser::{AutomationDriver, AutomationSession};
use replydesk_core::config::{MonitorConfig, PortalConfig};
use replydesk_core::{Error, Result};
use replydesk_storage::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scanner::ConversationScanner;
use crate::status::{BotPhase, StatusHub, StatusSnapshot};

/// The live session, shared between the loop and manual actions.
pub type SessionSlot = Arc<Mutex<Option<Box<dyn AutomationSession>>>>;

pub(crate) fn no_session() -> Error {
    Error::NotConnected("no active automation session".to_string())
}

fn cancelled() -> Error {
    Error::Other("session start cancelled".to_string())
}

const MANUAL_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Control {
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

pub struct Supervisor {
    driver: Arc<dyn AutomationDriver>,
    store: Arc<SessionStore>,
    scanner: ConversationScanner,
    hub: Arc<StatusHub>,
    portal: PortalConfig,
    monitor: MonitorConfig,
    ready_selector: String,
    slot: SessionSlot,
    control: Mutex<Control>,
}

impl Supervisor {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        store: Arc<SessionStore>,
        scanner: ConversationScanner,
        hub: Arc<StatusHub>,
        portal: PortalConfig,
        monitor: MonitorConfig,
        ready_selector: String,
    ) -> Self {
        Self {
            driver,
            store,
            scanner,
            hub,
            portal,
            monitor,
            ready_selector,
            slot: Arc::new(Mutex::new(None)),
            control: Mutex::new(Control::default()),
        }
    }

    pub async fn is_running(&self) -> bool {
        let control = self.control.lock().await;
        control.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start the loop. A no-op returning the current state when it is
    /// already alive.
    pub async fn start(self: &Arc<Self>) -> Result<StatusSnapshot> {
        let mut control = self.control.lock().await;
        if control.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Supervisor already running");
            return Ok(self.hub.snapshot());
        }
        control.task = None;
        control.cancel = None;

        if !self.store.exists(&self.portal.identity) {
            return Err(Error::NotConnected("no stored session, log in first".to_string()));
        }

        self.hub.set_phase(BotPhase::Starting);
        self.hub.info("Starting bot");
        let cancel = CancellationToken::new();
        let session = match self.acquire_session(&cancel).await {
            Ok(session) => session,
            Err(e) => {
                self.hub.set_last_error(Some(e.user_message()));
                self.hub.set_phase(BotPhase::Stopped);
                self.hub.error(format!("Could not start: {}", e.user_message()));
                return Err(e);
            }
        };
        *self.slot.lock().await = Some(session);

        self.hub.set_last_error(None);
        self.hub.set_phase(BotPhase::Running);
        let this = Arc::clone(self);
        let token = cancel.clone();
        control.task = Some(tokio::spawn(async move { this.run_loop(token).await }));
        control.cancel = Some(cancel);
        info!(identity = %self.portal.identity, "Monitoring loop started");
        Ok(self.hub.snapshot())
    }

    /// Cancel the loop and wait for it to release the session. Idempotent.
    pub async fn stop(&self) -> StatusSnapshot {
        let mut control = self.control.lock().await;
        let Some(task) = control.task.take() else {
            return self.hub.snapshot();
        };
        self.hub.set_phase(BotPhase::Stopping);
        if let Some(cancel) = control.cancel.take() {
            cancel.cancel();
        }
        if let Err(e) = task.await {
            warn!(error = %e, "Monitoring task ended abnormally");
        }
        self.release_session().await;
        self.hub.set_phase(BotPhase::Stopped);
        self.hub.info("Bot stopped");
        self.hub.snapshot()
    }

    pub async fn manual_send(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation("text must not be empty".to_string()));
        }
        {
            let mut guard = self.live_session().await?;
            let session = guard.as_mut().ok_or_else(no_session)?;
            session.send_message(text).await?;
        }
        self.hub.set_last_action("sent");
        self.hub.info("Manual message sent");
        Ok(())
    }

    /// Returns whether the portal offered a dismiss control.
    pub async fn manual_skip(&self) -> Result<bool> {
        let dismissed = {
            let mut guard = self.live_session().await?;
            let session = guard.as_mut().ok_or_else(no_session)?;
            session.skip_conversation().await?
        };
        self.hub.set_last_action("skipped");
        self.hub.info(if dismissed {
            "Conversation skipped"
        } else {
            "Skip requested, portal has no skip control"
        });
        Ok(dismissed)
    }

    /// Lock the slot for a manual action. Never waits for a future session.
    async fn live_session(
        &self,
    ) -> Result<MutexGuard<'_, Option<Box<dyn AutomationSession>>>> {
        match self.hub.snapshot().phase {
            BotPhase::Running => {}
            BotPhase::Restarting => {
                return Err(Error::NotConnected("automation session is restarting".to_string()))
            }
            _ => return Err(Error::NotConnected("bot is not running".to_string())),
        }
        tokio::time::timeout(MANUAL_LOCK_TIMEOUT, self.slot.lock())
            .await
            .map_err(|_| Error::Timeout("automation session busy".to_string()))
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let delay = Duration::from_millis(self.monitor.cycle_delay_ms);
        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.scanner.run_cycle(&self.slot) => r,
            };

            match result {
                Ok(report) => {
                    debug!(cycle, ?report, "Cycle complete");
                }
                Err(e) => {
                    warn!(cycle, error = %e, "Cycle failed, restarting session");
                    self.hub.set_last_error(Some(e.user_message()));
                    self.hub
                        .warn(format!("Cycle {} failed: {}", cycle, e.user_message()));
                    self.hub.set_phase(BotPhase::Restarting);

                    let mut slot = self.slot.lock().await;
                    if let Some(mut old) = slot.take() {
                        old.close().await;
                    }
                    match self.acquire_session(&cancel).await {
                        Ok(session) => {
                            *slot = Some(session);
                            drop(slot);
                            if cancel.is_cancelled() {
                                break;
                            }
                            self.hub.set_phase(BotPhase::Running);
                            self.hub.info("Session restarted");
                        }
                        Err(_) if cancel.is_cancelled() => {
                            debug!("Restart abandoned, stop requested");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Session restart failed, loop terminating");
                            self.hub.set_last_error(Some(e.user_message()));
                            self.hub.set_phase(BotPhase::Stopped);
                            self.hub
                                .error(format!("Restart failed: {}", e.user_message()));
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.release_session().await;
        debug!("Monitoring loop exited");
    }

    /// Launch with the stored state and wait for the inbox to render.
    /// Cancellation is observed once launch returns and interrupts the
    /// navigation and readiness wait; a half-built session is closed.
    async fn acquire_session(&self, cancel: &CancellationToken) -> Result<Box<dyn AutomationSession>> {
        let state = self
            .store
            .load(&self.portal.identity)?
            .ok_or_else(|| Error::NotConnected("no stored session, log in first".to_string()))?;
        let mut session = self.driver.launch(Some(state)).await?;

        let ready = if cancel.is_cancelled() {
            Err(cancelled())
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(cancelled()),
                r = Self::wait_ready(
                    session.as_mut(),
                    &self.portal.home_url,
                    &self.ready_selector,
                    Duration::from_secs(self.monitor.ready_timeout_secs),
                ) => r,
            }
        };

        match ready {
            Ok(()) => Ok(session),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn wait_ready(
        session: &mut dyn AutomationSession,
        home_url: &str,
        ready_selector: &str,
        timeout: Duration,
    ) -> Result<()> {
        session.navigate(home_url).await?;
        if !session.wait_for_selector(ready_selector, timeout).await? {
            warn!(selector = %ready_selector, "Inbox not visible yet, continuing");
        }
        Ok(())
    }

    async fn release_session(&self) {
        if let Some(mut session) = self.slot.lock().await.take() {
            session.close().await;
        }
    }
}
