//! Turning a conversation into a reply decision.
//!
//! `Classifier` is the seam the scanner calls through. `RuleClassifier` is the
//! built-in implementation over the keyword rules in `rules.json`.

use async_trait::async_trait;
use replydesk_core::{
    ConversationMessage, Error, OrderInfo, ReplyAction, ReplyDecision, Result, Role,
};
use replydesk_storage::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        history: &[ConversationMessage],
        order: &OrderInfo,
    ) -> Result<ReplyDecision>;
}

fn default_true() -> bool {
    true
}

fn default_action() -> ReplyAction {
    ReplyAction::Reply
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    /// Case-insensitive fragments; any one of them matching selects the rule.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_action")]
    pub action: ReplyAction,
    /// Reply template. `{ORDER_ID}` and `{TRACKING}` are filled in before sending.
    #[serde(default)]
    pub reply: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                return Err(Error::Validation("rule id must not be empty".to_string()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(Error::Validation(format!("duplicate rule id '{}'", rule.id)));
            }
            if rule.action == ReplyAction::Reply && rule.reply.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "rule '{}' replies but has no reply text",
                    rule.id
                )));
            }
        }
        Ok(())
    }

    /// First enabled rule with a keyword contained in `text`.
    pub fn find_match(&self, text: &str) -> Option<&Rule> {
        let haystack = text.to_lowercase();
        self.rules.iter().filter(|r| r.enabled).find(|r| {
            r.keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .any(|k| !k.is_empty() && haystack.contains(&k))
        })
    }
}

/// JSON file holding the rule set.
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<RuleSet> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RuleSet::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, rules: &RuleSet) -> Result<()> {
        rules.validate()?;
        let content = serde_json::to_vec_pretty(rules)?;
        write_atomic(&self.path, &content)?;
        info!(count = rules.rules.len(), "Rules saved");
        Ok(())
    }
}

/// Keyword matcher over the most recent buyer message.
pub struct RuleClassifier {
    store: Arc<RuleStore>,
}

impl RuleClassifier {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Classifier for RuleClassifier {
    async fn classify(
        &self,
        history: &[ConversationMessage],
        _order: &OrderInfo,
    ) -> Result<ReplyDecision> {
        let rules = self
            .store
            .load()
            .map_err(|e| {
                warn!(error = %e, "Could not load rules");
                Error::Classifier(format!("rules unavailable: {}", e.user_message()))
            })?;

        let Some(latest) = history.iter().rev().find(|m| m.role == Role::Buyer) else {
            return Ok(ReplyDecision::skip());
        };

        Ok(match rules.find_match(&latest.text) {
            Some(rule) => ReplyDecision {
                action: rule.action,
                rule_id: Some(rule.id.clone()),
                text: rule.reply.clone(),
            },
            None => ReplyDecision::skip(),
        })
    }
}
