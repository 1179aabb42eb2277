//! Wiring of the bot components into one shared object.

use replydesk_browser::AutomationDriver;
use replydesk_core::{Config, Paths};
use replydesk_storage::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::classifier::{Classifier, RuleStore};
use crate::login::LoginFlow;
use crate::pending::PendingRegistry;
use crate::scanner::ConversationScanner;
use crate::status::{StatusHub, StatusSnapshot};
use crate::supervisor::Supervisor;

/// Everything the control surface needs, built once per process.
pub struct BotRuntime {
    pub config: Config,
    pub hub: Arc<StatusHub>,
    pub store: Arc<SessionStore>,
    pub pending: Arc<PendingRegistry>,
    pub login: LoginFlow,
    pub supervisor: Arc<Supervisor>,
    pub rules: Arc<RuleStore>,
}

impl BotRuntime {
    pub fn new(
        config: Config,
        paths: &Paths,
        store: Arc<SessionStore>,
        driver: Arc<dyn AutomationDriver>,
        classifier: Arc<dyn Classifier>,
        rules: Arc<RuleStore>,
    ) -> Self {
        let hub = Arc::new(StatusHub::new());
        let pending = Arc::new(PendingRegistry::new(Duration::from_secs(
            config.login.attempt_ttl_secs,
        )));

        let login = LoginFlow::new(
            driver.clone(),
            store.clone(),
            pending.clone(),
            hub.clone(),
            config.portal.clone(),
            config.login.clone(),
            config.selectors.clone(),
        );
        let scanner = ConversationScanner::new(classifier, hub.clone(), config.monitor.clone());
        let supervisor = Arc::new(Supervisor::new(
            driver,
            store.clone(),
            scanner,
            hub.clone(),
            config.portal.clone(),
            config.monitor.clone(),
            config.selectors.chat_list_item.clone(),
        ));

        hub.set_secret_misconfigured(store.cipher().secret().is_weak());
        hub.set_connected(store.exists(&config.portal.identity));
        info!(base = %paths.base.display(), identity = %config.portal.identity, "Bot runtime ready");

        Self {
            config,
            hub,
            store,
            pending,
            login,
            supervisor,
            rules,
        }
    }

    /// Current snapshot with `connected` refreshed from disk.
    pub fn status(&self) -> StatusSnapshot {
        self.login.refresh_connected();
        self.hub.snapshot()
    }

    /// Stop the loop and release every held automation session.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
        let released = self.pending.drain().await;
        info!(released, "Bot runtime shut down");
    }
}
