use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use replydesk_bot::{Rule, RuleSet, RuleStore};
use replydesk_core::{Config, Paths, ReplyAction};
use std::io::{self, Write};

fn generate_api_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("rd_{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn starter_rules() -> RuleSet {
    RuleSet {
        rules: vec![
            Rule {
                id: "where-is-my-order".to_string(),
                keywords: vec![
                    "where is my order".to_string(),
                    "onde está meu pedido".to_string(),
                    "rastreio".to_string(),
                ],
                action: ReplyAction::Reply,
                reply: "Olá! Seu pedido {ORDER_ID} já está a caminho. Código de rastreio: {TRACKING}"
                    .to_string(),
                enabled: true,
            },
            Rule {
                id: "thanks".to_string(),
                keywords: vec!["obrigad".to_string(), "thank".to_string()],
                action: ReplyAction::Skip,
                reply: String::new(),
                enabled: true,
            },
        ],
    }
}

pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();

    if paths.config_file().exists() && !force {
        print!("Config already exists. Overwrite? [y/N] ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    paths.ensure_dirs()?;

    let mut config = Config::default();
    let token = generate_api_token();
    config.gateway.api_token = Some(token.clone());
    config.save(&paths.config_file())?;
    println!("✓ Created config: {}", paths.config_file().display());

    if !paths.rules_file().exists() {
        RuleStore::new(paths.rules_file()).save(&starter_rules())?;
        println!("✓ Created rules: {}", paths.rules_file().display());
    }

    println!();
    println!("Gateway token: {}", token);
    println!();
    println!("Next steps:");
    println!("  1. Export REPLYDESK_SESSION_SECRET (at least 12 characters)");
    println!("  2. Edit {} to match your portal", paths.config_file().display());
    println!("  3. Run `replydesk gateway` and log in through POST /v1/login/start");

    Ok(())
}
