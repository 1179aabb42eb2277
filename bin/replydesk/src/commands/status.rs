use replydesk_browser::{find_browser_binary, BrowserEngine};
use replydesk_core::{Config, Paths};
use replydesk_storage::{SessionCipher, SessionSecret, SessionStore};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("replydesk status");
    println!("================");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (using defaults)" }
    );

    let rules_path = paths.rules_file();
    println!(
        "Rules:     {} {}",
        rules_path.display(),
        if rules_path.exists() { "✓" } else { "✗ (not found)" }
    );

    let config = Config::load_or_default(&paths)?;
    println!("Portal:    {}", config.portal.login_url);
    println!("Identity:  {}", config.portal.identity);

    let secret = SessionSecret::from_env();
    let weak = secret.is_weak();
    let store = SessionStore::new(paths.clone(), SessionCipher::new(secret));
    println!(
        "Session:   {}",
        if store.exists(&config.portal.identity) {
            "✓ stored"
        } else {
            "✗ not logged in"
        }
    );
    println!(
        "Secret:    {}",
        if weak {
            "⚠ REPLYDESK_SESSION_SECRET missing or too short"
        } else {
            "✓ configured"
        }
    );

    let engine = BrowserEngine::parse(&config.browser.engine);
    let binary = config
        .browser
        .executable
        .clone()
        .filter(|p| !p.trim().is_empty())
        .or_else(|| find_browser_binary(engine));
    println!(
        "Browser:   {}",
        match binary {
            Some(path) => format!("✓ {}", path),
            None => format!("✗ {} not found", engine.name()),
        }
    );

    println!(
        "Gateway:   {}:{} (token {})",
        config.gateway.host,
        config.gateway.port,
        if config.api_token().is_some() { "set" } else { "not set" }
    );

    if !config_exists {
        println!();
        println!("Run `replydesk onboard` to initialize.");
    }
    Ok(())
}
