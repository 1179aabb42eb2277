use replydesk_core::{Config, Paths};
use replydesk_storage::{SessionCipher, SessionSecret, SessionStore};

pub async fn run(identity: Option<String>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let identity = identity.unwrap_or_else(|| config.portal.identity.clone());

    let store = SessionStore::new(paths, SessionCipher::new(SessionSecret::from_env()));
    if store.delete(&identity)? {
        println!("✓ Removed stored session for {}", identity);
    } else {
        println!("No stored session for {}", identity);
    }
    Ok(())
}
