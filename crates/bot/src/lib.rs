pub mod classifier;
pub mod login;
pub mod pending;
pub mod runtime;
pub mod scanner;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use classifier::{Classifier, Rule, RuleClassifier, RuleSet, RuleStore};
pub use login::{LoginFlow, LoginOutcome};
pub use pending::PendingRegistry;
pub use runtime::BotRuntime;
pub use scanner::{enrich_reply, ConversationScanner, CycleReport};
pub use status::{BotEvent, BotPhase, LogLevel, LogLine, StatusHub, StatusSnapshot};
pub use supervisor::{SessionSlot, Supervisor};
