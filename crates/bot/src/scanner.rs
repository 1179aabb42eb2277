//! One pass over the visible conversations of the portal inbox.

use replydesk_browser::AutomationSession;
use replydesk_core::config::MonitorConfig;
use replydesk_core::{Error, OrderInfo, ReplyAction, Result, Role};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::status::StatusHub;
use crate::supervisor::{no_session, SessionSlot};

const ORDER_ID_PLACEHOLDER: &str = "{ORDER_ID}";
const TRACKING_PLACEHOLDER: &str = "{TRACKING}";

/// Fill the reply template with order data.
///
/// Placeholders without a value are replaced by an empty string so the buyer
/// never sees a raw token. The status line is appended only when a status is
/// known and the reply does not already mention it.
pub fn enrich_reply(
    text: &str,
    order: &OrderInfo,
    tracking: Option<&str>,
    status_line: &str,
) -> String {
    let mut reply = text
        .replace(ORDER_ID_PLACEHOLDER, order.order_id().unwrap_or(""))
        .replace(TRACKING_PLACEHOLDER, tracking.unwrap_or(""));

    if let Some(status) = order.status() {
        let lower = reply.to_lowercase();
        let mentioned = lower.contains("status:") || lower.contains(&status.to_lowercase());
        if !mentioned && !status_line.is_empty() {
            reply.push_str(&status_line.replace("{status}", status));
        }
    }
    reply
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationOutcome {
    Unavailable,
    NoMessages,
    NotBuyerLast,
    ExtractFailed,
    ClassifierFailed,
    Replied,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub visible: usize,
    pub replied: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ConversationScanner {
    classifier: Arc<dyn Classifier>,
    hub: Arc<StatusHub>,
    monitor: MonitorConfig,
}

impl ConversationScanner {
    pub fn new(classifier: Arc<dyn Classifier>, hub: Arc<StatusHub>, monitor: MonitorConfig) -> Self {
        Self {
            classifier,
            hub,
            monitor,
        }
    }

    /// Process every visible conversation once, in list order.
    ///
    /// The slot is locked per conversation so manual actions can interleave
    /// between entries. Driver errors while listing, sending or skipping end
    /// the cycle; everything scoped to one conversation does not.
    pub async fn run_cycle(&self, slot: &SessionSlot) -> Result<CycleReport> {
        let mut total = {
            let mut guard = slot.lock().await;
            let session = guard.as_mut().ok_or_else(no_session)?;
            if self.monitor.apply_needs_reply_filter {
                if let Err(e) = session.apply_needs_reply_filter().await {
                    debug!(error = %e, "Needs-reply filter not applied");
                }
            }
            session.list_conversations().await?
        };
        let mut report = CycleReport {
            visible: total,
            ..CycleReport::default()
        };
        debug!(visible = total, "Scanning conversations");

        if self.monitor.max_conversations > 0 {
            total = total.min(self.monitor.max_conversations);
        }

        for index in 0..total {
            let outcome = {
                let mut guard = slot.lock().await;
                let session = guard.as_mut().ok_or_else(no_session)?;
                self.process_conversation(session.as_mut(), index).await?
            };
            match outcome {
                ConversationOutcome::Replied => {
                    report.replied += 1;
                    tokio::time::sleep(Duration::from_millis(self.monitor.action_delay_ms)).await;
                }
                ConversationOutcome::Skipped => report.skipped += 1,
                ConversationOutcome::ExtractFailed | ConversationOutcome::ClassifierFailed => {
                    report.failed += 1
                }
                _ => {}
            }
        }
        Ok(report)
    }

    pub async fn process_conversation(
        &self,
        session: &mut dyn AutomationSession,
        index: usize,
    ) -> Result<ConversationOutcome> {
        match session.open_conversation(index).await {
            Ok(true) => {}
            Ok(false) => return Ok(ConversationOutcome::Unavailable),
            Err(e) => {
                debug!(index, error = %e, "Could not open conversation");
                return Ok(ConversationOutcome::Unavailable);
            }
        }

        let order = session.read_order_info().await.unwrap_or_else(|e| {
            debug!(index, error = %e, "Order info unavailable");
            OrderInfo::default()
        });

        let history = match session.read_messages(self.monitor.history_depth.max(1)).await {
            Ok(history) => history,
            Err(e) => {
                warn!(index, error = %e, "Failed to read messages");
                self.hub
                    .warn(format!("Conversation {}: could not read messages", index + 1));
                return Ok(ConversationOutcome::ExtractFailed);
            }
        };

        let Some(last) = history.last() else {
            return Ok(ConversationOutcome::NoMessages);
        };
        if last.role != Role::Buyer {
            debug!(index, role = %last.role, "Last message is not from the buyer");
            return Ok(ConversationOutcome::NotBuyerLast);
        }

        let decision = match self.classifier.classify(&history, &order).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(index, error = %e, "Classifier failed");
                self.hub
                    .warn(format!("Conversation {}: classifier error, skipped", index + 1));
                return Ok(ConversationOutcome::ClassifierFailed);
            }
        };

        match decision.action {
            ReplyAction::Reply if !decision.text.trim().is_empty() => {
                let tracking = if decision.text.contains(TRACKING_PLACEHOLDER) {
                    session.read_tracking_code().await.unwrap_or(None)
                } else {
                    None
                };
                let reply = enrich_reply(
                    &decision.text,
                    &order,
                    tracking.as_deref(),
                    &self.monitor.status_line,
                );
                session.send_message(&reply).await?;
                self.hub.set_last_action("replied");
                self.hub.info(format!(
                    "Replied to conversation {}{}",
                    index + 1,
                    decision
                        .rule_id
                        .as_deref()
                        .map(|id| format!(" (rule {})", id))
                        .unwrap_or_default()
                ));
                Ok(ConversationOutcome::Replied)
            }
            _ => {
                if session.skip_conversation().await? {
                    debug!(index, "Conversation dismissed");
                }
                Ok(ConversationOutcome::Skipped)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Rule, RuleClassifier, RuleSet, RuleStore};
    use crate::testing::{FakeConversation, FakeWorld};
    use async_trait::async_trait;
    use replydesk_core::{ConversationMessage, ReplyDecision};
    use tokio::sync::Mutex;

    struct Failing;

    #[async_trait]
    impl Classifier for Failing {
        async fn classify(&self, _: &[ConversationMessage], _: &OrderInfo) -> Result<ReplyDecision> {
            Err(Error::Classifier("boom".to_string()))
        }
    }

    struct Always(ReplyDecision);

    #[async_trait]
    impl Classifier for Always {
        async fn classify(&self, _: &[ConversationMessage], _: &OrderInfo) -> Result<ReplyDecision> {
            Ok(self.0.clone())
        }
    }

    fn monitor() -> MonitorConfig {
        MonitorConfig {
            action_delay_ms: 0,
            ..MonitorConfig::default()
        }
    }

    fn order(status: &str, id: &str) -> OrderInfo {
        OrderInfo {
            status: Some(status.to_string()),
            order_id: Some(id.to_string()),
            ..OrderInfo::default()
        }
    }

    async fn slot_for(world: &FakeWorld) -> SessionSlot {
        let session = world.driver().launch(None).await.unwrap();
        Arc::new(Mutex::new(Some(session)))
    }

    fn scanner(classifier: Arc<dyn Classifier>) -> ConversationScanner {
        ConversationScanner::new(classifier, Arc::new(StatusHub::new()), monitor())
    }

    #[test]
    fn test_order_id_is_substituted() {
        let out = enrich_reply("Pedido {ORDER_ID} enviado", &order("", "ABC123"), None, "\n{status}");
        assert_eq!(out, "Pedido ABC123 enviado");
    }

    #[test]
    fn test_missing_order_id_leaves_no_placeholder() {
        let out = enrich_reply("Pedido {ORDER_ID}", &OrderInfo::default(), None, "\n{status}");
        assert!(!out.contains("{ORDER_ID}"));
    }

    #[test]
    fn test_status_line_appended_once() {
        let line = MonitorConfig::default().status_line;
        let out = enrich_reply("Your parcel is on the way", &order("Shipped", ""), None, &line);
        assert!(out.starts_with("Your parcel is on the way"));
        assert!(out.contains("**Shipped**"));

        let mentioned = enrich_reply("Status: shipped already", &order("Shipped", ""), None, &line);
        assert_eq!(mentioned, "Status: shipped already");
    }

    #[test]
    fn test_tracking_placeholder() {
        let out = enrich_reply("Code {TRACKING}", &OrderInfo::default(), Some("BR123456789XX"), "");
        assert_eq!(out, "Code BR123456789XX");
        let empty = enrich_reply("Code {TRACKING}", &OrderInfo::default(), None, "");
        assert_eq!(empty, "Code ");
    }

    #[tokio::test]
    async fn test_reply_dispatched_with_enrichment() {
        let world = FakeWorld::shared();
        world.state().conversations = vec![FakeConversation {
            messages: vec![ConversationMessage::buyer("where is my order?")],
            order: order("Shipped", "ABC123"),
            ..FakeConversation::default()
        }];
        let slot = slot_for(&world).await;
        let s = scanner(Arc::new(Always(ReplyDecision::reply("where", "Order {ORDER_ID} left"))));

        let report = s.run_cycle(&slot).await.unwrap();
        assert_eq!(report.replied, 1);
        let sent = world.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("Order ABC123 left"));
        assert!(sent[0].contains("Shipped"));
    }

    #[tokio::test]
    async fn test_non_buyer_last_message_gets_no_dispatch() {
        let world = FakeWorld::shared();
        world.state().conversations = vec![
            FakeConversation::with_messages(vec![
                ConversationMessage::buyer("hi"),
                ConversationMessage::seller("hello!"),
            ]),
            FakeConversation::with_messages(vec![ConversationMessage::new(Role::System, "order paid")]),
        ];
        let slot = slot_for(&world).await;
        let s = scanner(Arc::new(Always(ReplyDecision::reply("r", "text"))));

        s.run_cycle(&slot).await.unwrap();
        let state = world.state();
        assert!(state.sent.is_empty());
        assert!(state.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_per_conversation_failures_do_not_abort_cycle() {
        let world = FakeWorld::shared();
        world.state().conversations = vec![
            FakeConversation {
                open_fails: true,
                ..FakeConversation::with_messages(vec![ConversationMessage::buyer("a")])
            },
            FakeConversation {
                read_fails: true,
                ..FakeConversation::with_messages(vec![ConversationMessage::buyer("b")])
            },
            FakeConversation::with_messages(vec![ConversationMessage::buyer("c")]),
        ];
        let slot = slot_for(&world).await;
        let s = scanner(Arc::new(Always(ReplyDecision::reply("r", "ok"))));

        let report = s.run_cycle(&slot).await.unwrap();
        assert_eq!(report.visible, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.replied, 1);
        assert_eq!(world.state().sent, vec![(Some(2), "ok".to_string())]);
    }

    #[tokio::test]
    async fn test_classifier_error_skips_conversation_only() {
        let world = FakeWorld::shared();
        world.state().conversations = vec![
            FakeConversation::with_messages(vec![ConversationMessage::buyer("a")]),
            FakeConversation::with_messages(vec![ConversationMessage::buyer("b")]),
        ];
        let slot = slot_for(&world).await;
        let report = scanner(Arc::new(Failing)).run_cycle(&slot).await.unwrap();
        assert_eq!(report.failed, 2);
        assert!(world.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn test_skip_decision_dismisses() {
        let world = FakeWorld::shared();
        world.state().conversations =
            vec![FakeConversation::with_messages(vec![ConversationMessage::buyer("thanks")])];
        let slot = slot_for(&world).await;
        let report = scanner(Arc::new(Always(ReplyDecision::skip())))
            .run_cycle(&slot)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(world.state().skipped, vec![Some(0)]);
    }

    #[tokio::test]
    async fn test_cap_and_filter_honored() {
        let world = FakeWorld::shared();
        world.state().conversations = (0..4)
            .map(|i| FakeConversation::with_messages(vec![ConversationMessage::buyer(format!("m{}", i))]))
            .collect();
        let slot = slot_for(&world).await;
        let s = ConversationScanner::new(
            Arc::new(Always(ReplyDecision::reply("r", "ok"))),
            Arc::new(StatusHub::new()),
            MonitorConfig {
                action_delay_ms: 0,
                max_conversations: 2,
                apply_needs_reply_filter: true,
                ..MonitorConfig::default()
            },
        );
        let report = s.run_cycle(&slot).await.unwrap();
        assert_eq!(report.visible, 4);
        assert_eq!(report.replied, 2);
        assert_eq!(world.state().filter_applied, 1);
    }

    #[tokio::test]
    async fn test_send_failure_is_cycle_fatal() {
        let world = FakeWorld::shared();
        {
            let mut state = world.state();
            state.fail_send = true;
            state.conversations =
                vec![FakeConversation::with_messages(vec![ConversationMessage::buyer("hi")])];
        }
        let slot = slot_for(&world).await;
        let result = scanner(Arc::new(Always(ReplyDecision::reply("r", "ok"))))
            .run_cycle(&slot)
            .await;
        assert!(matches!(result, Err(Error::Automation(_))));
    }

    #[tokio::test]
    async fn test_rule_classifier_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RuleStore::new(dir.path().join("rules.json")));
        store
            .save(&RuleSet {
                rules: vec![Rule {
                    id: "track".to_string(),
                    keywords: vec!["rastreio".to_string()],
                    action: ReplyAction::Reply,
                    reply: "Seu código: {TRACKING}".to_string(),
                    enabled: true,
                }],
            })
            .unwrap();
        let world = FakeWorld::shared();
        {
            let mut state = world.state();
            state.tracking = Some("BR123456789XX".to_string());
            state.conversations = vec![FakeConversation::with_messages(vec![
                ConversationMessage::buyer("qual o rastreio?"),
            ])];
        }
        let slot = slot_for(&world).await;
        scanner(Arc::new(RuleClassifier::new(store)))
            .run_cycle(&slot)
            .await
            .unwrap();
        assert_eq!(world.sent_texts(), vec!["Seu código: BR123456789XX".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_slot_is_not_connected() {
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        let result = scanner(Arc::new(Failing)).run_cycle(&slot).await;
        assert!(matches!(result, Err(Error::NotConnected(_))));
    }
}
