//! Two-phase portal login: credentials, then an optional one-time code.
//!
//! ```text
//! START ──► IMMEDIATE_LOGIN ──► LOGGED
//!   │
//!   └────► CODE_REQUIRED ──verify──► LOGGED
//!
//! FAILED is reachable from every state and always releases the session.
//! ```

use replydesk_browser::{AutomationDriver, AutomationSession};
use replydesk_core::config::{LoginConfig, PortalConfig, SelectorConfig};
use replydesk_core::{Credentials, Error, Result};
use replydesk_storage::SessionStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pending::PendingRegistry;
use crate::status::StatusHub;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const FORM_TIMEOUT: Duration = Duration::from_secs(30);

const LOGIN_TOKENS: &[&str] = &["login", "log in", "sign in", "entrar"];
const SMS_TOKENS: &[&str] = &["sms"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginOutcome {
    Logged,
    CodeRequired {
        #[serde(rename = "attemptId")]
        attempt_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortalState {
    Dashboard,
    CodePrompt,
}

/// Index of the first label containing any token, case-insensitively.
pub fn find_control(labels: &[String], tokens: &[&str]) -> Option<usize> {
    labels.iter().position(|label| {
        let label = label.to_lowercase();
        tokens.iter().any(|t| !t.is_empty() && label.contains(&t.to_lowercase()))
    })
}

/// Confirmation control for the code step: first label matching a token,
/// otherwise the first control on the page. `None` only when there are no
/// controls at all.
pub fn pick_confirm_control(labels: &[String], tokens: &[String]) -> Option<usize> {
    let tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();
    find_control(labels, &tokens).or(if labels.is_empty() { None } else { Some(0) })
}

pub struct LoginFlow {
    driver: Arc<dyn AutomationDriver>,
    store: Arc<SessionStore>,
    pending: Arc<PendingRegistry>,
    hub: Arc<StatusHub>,
    portal: PortalConfig,
    login: LoginConfig,
    selectors: SelectorConfig,
}

impl LoginFlow {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        store: Arc<SessionStore>,
        pending: Arc<PendingRegistry>,
        hub: Arc<StatusHub>,
        portal: PortalConfig,
        login: LoginConfig,
        selectors: SelectorConfig,
    ) -> Self {
        Self {
            driver,
            store,
            pending,
            hub,
            portal,
            login,
            selectors,
        }
    }

    pub async fn start(&self, identity: &str, credentials: &Credentials) -> Result<LoginOutcome> {
        self.pending.reap_expired().await;

        if identity.trim().is_empty() {
            return Err(Error::Validation("identity must not be empty".to_string()));
        }
        if credentials.email.trim().is_empty() || credentials.password.is_empty() {
            return Err(Error::Validation("email and password are required".to_string()));
        }

        self.hub.info(format!("Login started for {}", identity));
        let mut session = self.driver.launch(None).await.map_err(|e| {
            warn!(identity, error = %e, "Could not launch login session");
            self.hub.error(format!("Login for {}: browser unavailable", identity));
            Error::Authentication(format!(
                "could not start automation session: {}",
                e.user_message()
            ))
        })?;

        let outcome = async {
            self.submit_credentials(session.as_mut(), credentials).await?;
            let wait = Duration::from_secs(self.login.outcome_wait_secs);
            match tokio::time::timeout(wait, self.await_outcome(session.as_mut())).await {
                Ok(result) => result,
                Err(_) => Err(Error::Authentication(
                    "could not locate code field / login failed".to_string(),
                )),
            }
        }
        .await;

        match outcome {
            Ok(PortalState::Dashboard) => {
                self.persist(identity, session, Error::Authentication).await?;
                self.hub.info(format!("Login complete for {}", identity));
                Ok(LoginOutcome::Logged)
            }
            Ok(PortalState::CodePrompt) => {
                let attempt_id = self.pending.insert(identity, session);
                info!(%attempt_id, identity, "Portal requested a verification code");
                self.hub
                    .info(format!("Verification code requested for {}", identity));
                Ok(LoginOutcome::CodeRequired { attempt_id })
            }
            Err(e) => {
                session.close().await;
                warn!(identity, error = %e, "Login failed");
                self.hub.error(format!("Login failed for {}: {}", identity, e.user_message()));
                Err(match e {
                    Error::Authentication(_) | Error::Validation(_) => e,
                    other => Error::Authentication(other.user_message()),
                })
            }
        }
    }

    pub async fn verify(&self, attempt_id: &str, code: &str) -> Result<LoginOutcome> {
        self.pending.reap_expired().await;

        let id = Uuid::parse_str(attempt_id.trim())
            .map_err(|_| Error::AttemptExpired(attempt_id.to_string()))?;
        let Some(attempt) = self.pending.take(id).await else {
            return Err(Error::AttemptExpired(attempt_id.to_string()));
        };
        let identity = attempt.identity.clone();
        let mut session = attempt.session;

        let code = code.trim();
        let submitted = if code.is_empty() {
            Err(Error::CodeVerification("verification code is empty".to_string()))
        } else {
            self.submit_code(session.as_mut(), code).await
        };

        match submitted {
            Ok(()) => {
                self.persist(&identity, session, Error::CodeVerification).await?;
                self.hub.info(format!("Login verified for {}", identity));
                Ok(LoginOutcome::Logged)
            }
            Err(e) => {
                session.close().await;
                warn!(%id, identity, error = %e, "Code verification failed");
                self.hub.error(format!(
                    "Code verification failed for {}: {}",
                    identity,
                    e.user_message()
                ));
                Err(match e {
                    Error::CodeVerification(_) => e,
                    other => Error::CodeVerification(other.user_message()),
                })
            }
        }
    }

    /// Remove the identity's stored session. Returns whether one existed.
    pub async fn logout(&self, identity: &str) -> Result<bool> {
        self.pending.reap_expired().await;
        let removed = self.store.delete(identity)?;
        self.refresh_connected();
        if removed {
            self.hub.info(format!("Logged out {}", identity));
        }
        Ok(removed)
    }

    pub fn refresh_connected(&self) {
        self.hub
            .set_connected(self.store.exists(&self.portal.identity));
    }

    async fn submit_credentials(
        &self,
        session: &mut dyn AutomationSession,
        credentials: &Credentials,
    ) -> Result<()> {
        session.navigate(&self.portal.login_url).await?;
        if !session
            .wait_for_selector(&self.selectors.email_input, FORM_TIMEOUT)
            .await?
        {
            return Err(Error::Authentication("login form not found".to_string()));
        }
        session
            .fill(&self.selectors.email_input, credentials.email.trim())
            .await?;
        session
            .fill(&self.selectors.password_input, &credentials.password)
            .await?;

        let labels = session.control_labels().await?;
        let phone = credentials
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let target = match phone {
            Some(phone) => {
                session.fill(&self.selectors.phone_input, phone).await?;
                find_control(&labels, SMS_TOKENS).ok_or_else(|| {
                    Error::Authentication("send-SMS control not found".to_string())
                })?
            }
            None => find_control(&labels, LOGIN_TOKENS)
                .or(if labels.is_empty() { None } else { Some(0) })
                .ok_or_else(|| Error::Authentication("login control not found".to_string()))?,
        };
        debug!(label = %labels[target], "Submitting credentials");
        session.click_control(target).await
    }

    /// Poll until the portal shows the dashboard or asks for a code.
    async fn await_outcome(&self, session: &mut dyn AutomationSession) -> Result<PortalState> {
        loop {
            let url = session.current_url().await?;
            if url.contains(&self.portal.dashboard_marker) {
                return Ok(PortalState::Dashboard);
            }
            if url.contains(&self.portal.verify_marker)
                || session.has_selector(&self.selectors.code_input).await?
            {
                return Ok(PortalState::CodePrompt);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn submit_code(&self, session: &mut dyn AutomationSession, code: &str) -> Result<()> {
        session
            .fill(&self.selectors.code_input, code)
            .await
            .map_err(|_| Error::CodeVerification("code field not found".to_string()))?;

        let labels = session.control_labels().await?;
        let index = pick_confirm_control(&labels, &self.login.confirm_tokens)
            .ok_or_else(|| Error::CodeVerification("no confirmation control found".to_string()))?;
        debug!(label = %labels[index], "Confirming verification code");
        session.click_control(index).await?;

        let wait = Duration::from_secs(self.login.code_timeout_secs);
        tokio::time::timeout(wait, self.await_settled(session))
            .await
            .map_err(|_| {
                Error::CodeVerification(format!(
                    "portal did not accept the code within {}s",
                    wait.as_secs()
                ))
            })?
    }

    /// Settled: the dashboard is reached, or the code prompt is gone.
    async fn await_settled(&self, session: &mut dyn AutomationSession) -> Result<()> {
        loop {
            let url = session.current_url().await?;
            if url.contains(&self.portal.dashboard_marker) {
                return Ok(());
            }
            if !url.contains(&self.portal.verify_marker)
                && !session.has_selector(&self.selectors.code_input).await?
            {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Export, encrypt and store the session state, then release the session.
    async fn persist(
        &self,
        identity: &str,
        mut session: Box<dyn AutomationSession>,
        wrap: fn(String) -> Error,
    ) -> Result<()> {
        let saved = match session.export_state().await {
            Ok(state) => self.store.save(identity, &state),
            Err(e) => Err(e),
        };
        session.close().await;
        match saved {
            Ok(()) => {
                self.refresh_connected();
                Ok(())
            }
            Err(e) => {
                warn!(identity, error = %e, "Failed to persist session");
                self.hub.error(format!("Could not store session for {}", identity));
                Err(wrap(format!("could not store session: {}", e.user_message())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWorld, LoginScript};
    use replydesk_core::Paths;
    use replydesk_storage::{SessionCipher, SessionSecret};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        world: FakeWorld,
        store: Arc<SessionStore>,
        pending: Arc<PendingRegistry>,
        hub: Arc<StatusHub>,
        flow: LoginFlow,
    }

    fn harness(script: LoginScript, ttl: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let cipher = SessionCipher::with_rounds(SessionSecret::new(b"login-test-secret".to_vec()), 4);
        let store = Arc::new(SessionStore::new(paths, cipher));
        let world = FakeWorld::shared();
        world.state().login = script;
        let pending = Arc::new(PendingRegistry::new(ttl));
        let hub = Arc::new(StatusHub::new());
        let login = LoginConfig {
            outcome_wait_secs: 1,
            code_timeout_secs: 1,
            ..LoginConfig::default()
        };
        let portal = PortalConfig {
            identity: "shop".to_string(),
            ..PortalConfig::default()
        };
        let flow = LoginFlow::new(
            world.driver(),
            store.clone(),
            pending.clone(),
            hub.clone(),
            portal,
            login,
            SelectorConfig::default(),
        );
        Harness {
            _dir: dir,
            world,
            store,
            pending,
            hub,
            flow,
        }
    }

    fn creds() -> Credentials {
        Credentials {
            email: "owner@shop.test".to_string(),
            password: "pw".to_string(),
            phone: None,
        }
    }

    fn attempt_of(outcome: LoginOutcome) -> Uuid {
        match outcome {
            LoginOutcome::CodeRequired { attempt_id } => attempt_id,
            other => panic!("expected CODE_REQUIRED, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_immediate_login_persists_and_releases() {
        let h = harness(LoginScript::Immediate, Duration::from_secs(600));
        let outcome = h.flow.start("shop", &creds()).await.unwrap();

        assert_eq!(outcome, LoginOutcome::Logged);
        assert!(h.store.exists("shop"));
        assert!(h.store.load("shop").unwrap().is_some());
        assert_eq!(h.world.open_sessions(), 0);
        assert!(h.hub.snapshot().connected);
        assert_eq!(h.world.state().clicked_labels, vec!["Login".to_string()]);
    }

    #[tokio::test]
    async fn test_code_flow_then_second_verify_fails() {
        let h = harness(LoginScript::CodeRequired, Duration::from_secs(600));
        let attempt = attempt_of(h.flow.start("shop", &creds()).await.unwrap());

        assert!(!h.store.exists("shop"));
        assert_eq!(h.pending.len(), 1);
        assert_eq!(h.world.open_sessions(), 1);

        let verified = h.flow.verify(&attempt.to_string(), "123456").await.unwrap();
        assert_eq!(verified, LoginOutcome::Logged);
        assert!(h.store.exists("shop"));
        assert!(h.pending.is_empty());
        assert_eq!(h.world.open_sessions(), 0);
        assert!(h.world.state().clicked_labels.contains(&"Confirm".to_string()));

        let again = h.flow.verify(&attempt.to_string(), "123456").await;
        assert!(matches!(again, Err(Error::AttemptExpired(_))));
    }

    #[tokio::test]
    async fn test_attempt_ids_are_unique() {
        let h = harness(LoginScript::CodeRequired, Duration::from_secs(600));
        let a = attempt_of(h.flow.start("shop", &creds()).await.unwrap());
        let b = attempt_of(h.flow.start("shop", &creds()).await.unwrap());
        assert_ne!(a, b);
        assert_eq!(h.pending.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_attempt_is_unreachable() {
        let h = harness(LoginScript::CodeRequired, Duration::from_millis(50));
        let attempt = attempt_of(h.flow.start("shop", &creds()).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let result = h.flow.verify(&attempt.to_string(), "123456").await;

        assert!(matches!(result, Err(Error::AttemptExpired(_))));
        assert!(!h.store.exists("shop"));
        assert_eq!(h.world.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_wrong_code_fails_without_retry() {
        let h = harness(LoginScript::CodeRequired, Duration::from_secs(600));
        let attempt = attempt_of(h.flow.start("shop", &creds()).await.unwrap());

        let result = h.flow.verify(&attempt.to_string(), "000000").await;
        assert!(matches!(result, Err(Error::CodeVerification(_))));
        assert_eq!(h.world.open_sessions(), 0);
        assert!(h.pending.is_empty());

        let retry = h.flow.verify(&attempt.to_string(), "123456").await;
        assert!(matches!(retry, Err(Error::AttemptExpired(_))));
    }

    #[tokio::test]
    async fn test_no_outcome_fails_and_releases() {
        let h = harness(LoginScript::NoOutcome, Duration::from_secs(600));
        let result = h.flow.start("shop", &creds()).await;

        match result {
            Err(Error::Authentication(msg)) => assert!(msg.contains("could not locate code field")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.world.open_sessions(), 0);
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_falls_back_to_first_control() {
        let h = harness(LoginScript::CodeRequired, Duration::from_secs(600));
        h.world.state().code_labels = vec!["OK".to_string(), "Resend".to_string()];
        let attempt = attempt_of(h.flow.start("shop", &creds()).await.unwrap());

        h.flow.verify(&attempt.to_string(), "123456").await.unwrap();
        assert_eq!(h.world.state().clicked_labels.last().map(String::as_str), Some("OK"));
    }

    #[tokio::test]
    async fn test_phone_login_uses_sms_control() {
        let h = harness(LoginScript::CodeRequired, Duration::from_secs(600));
        let mut c = creds();
        c.phone = Some("+55 11 99999-0000".to_string());
        attempt_of(h.flow.start("shop", &c).await.unwrap());

        let state = h.world.state();
        assert_eq!(state.clicked_labels, vec!["Send SMS".to_string()]);
        assert!(state.filled.iter().any(|(sel, v)| sel == &SelectorConfig::default().phone_input && v.starts_with("+55")));
    }

    #[tokio::test]
    async fn test_garbage_attempt_id_is_expired() {
        let h = harness(LoginScript::CodeRequired, Duration::from_secs(600));
        let result = h.flow.verify("not-a-uuid", "123456").await;
        assert!(matches!(result, Err(Error::AttemptExpired(_))));
    }

    #[tokio::test]
    async fn test_launch_failure_is_authentication_error() {
        let h = harness(LoginScript::Immediate, Duration::from_secs(600));
        h.world.state().launch_limit = Some(0);
        let result = h.flow.start("shop", &creds()).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(h.world.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_launch_io_failure_hides_detail() {
        let h = harness(LoginScript::Immediate, Duration::from_secs(600));
        h.world.state().launch_io_error = true;
        let err = h.flow.start("shop", &creds()).await.unwrap_err();

        assert_eq!(err.kind(), "authentication_failure");
        let message = err.user_message();
        assert!(message.contains("could not start automation session"));
        assert!(!message.contains("/srv/replydesk"));
        assert!(!message.contains("IO error"));
    }

    #[tokio::test]
    async fn test_logout_deletes_blob() {
        let h = harness(LoginScript::Immediate, Duration::from_secs(600));
        h.flow.start("shop", &creds()).await.unwrap();
        assert!(h.flow.logout("shop").await.unwrap());
        assert!(!h.store.exists("shop"));
        assert!(!h.hub.snapshot().connected);
        assert!(!h.flow.logout("shop").await.unwrap());
    }

    #[test]
    fn test_pick_confirm_control_rules() {
        let tokens = LoginConfig::default().confirm_tokens;
        let labels = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(pick_confirm_control(&labels(&["Resend", "VERIFY now"]), &tokens), Some(1));
        assert_eq!(pick_confirm_control(&labels(&["Submit", "Confirm"]), &tokens), Some(0));
        assert_eq!(pick_confirm_control(&labels(&["Next", "Back"]), &tokens), Some(0));
        assert_eq!(pick_confirm_control(&[], &tokens), None);
    }

    #[test]
    fn test_outcome_wire_format() {
        let id = Uuid::nil();
        let v = serde_json::to_value(LoginOutcome::CodeRequired { attempt_id: id }).unwrap();
        assert_eq!(v["status"], "CODE_REQUIRED");
        assert_eq!(v["attemptId"], id.to_string());
        assert_eq!(serde_json::to_value(LoginOutcome::Logged).unwrap()["status"], "LOGGED");
    }
}
