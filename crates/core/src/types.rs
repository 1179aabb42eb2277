use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Who wrote a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Buyer => "buyer",
            Role::Seller => "seller",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
}

impl ConversationMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn buyer(text: impl Into<String>) -> Self {
        Self::new(Role::Buyer, text)
    }

    pub fn seller(text: impl Into<String>) -> Self {
        Self::new(Role::Seller, text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyAction {
    Reply,
    Skip,
}

/// Outcome of classifying one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyDecision {
    pub action: ReplyAction,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub text: String,
}

impl ReplyDecision {
    pub fn reply(rule_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            action: ReplyAction::Reply,
            rule_id: Some(rule_id.into()),
            text: text.into(),
        }
    }

    pub fn skip() -> Self {
        Self {
            action: ReplyAction::Skip,
            rule_id: None,
            text: String::new(),
        }
    }
}

/// Order metadata scraped from the side panel. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub variation: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl OrderInfo {
    pub fn status(&self) -> Option<&str> {
        non_blank(&self.status)
    }

    pub fn order_id(&self) -> Option<&str> {
        non_blank(&self.order_id)
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Portal login credentials. Never persisted.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .field("phone", &self.phone)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_info_blank_fields_are_absent() {
        let info: OrderInfo =
            serde_json::from_str(r#"{"status":"  ","orderId":"ABC123"}"#).unwrap();
        assert_eq!(info.status(), None);
        assert_eq!(info.order_id(), Some("ABC123"));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            email: "a@b.c".into(),
            password: "hunter2".into(),
            phone: None,
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_decision_serializes_lowercase_action() {
        let v = serde_json::to_value(ReplyDecision::reply("greet", "hi")).unwrap();
        assert_eq!(v["action"], "reply");
        assert_eq!(v["ruleId"], "greet");
    }
}
