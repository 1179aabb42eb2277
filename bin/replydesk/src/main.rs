mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "replydesk")]
#[command(about = "Customer-chat auto-responder for seller portals", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration and data directories
    Onboard {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration and stored-session status
    Status,

    /// Start the control gateway (long-running daemon)
    Gateway {
        /// Port to listen on (overrides config gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config gateway.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Delete the stored session of an identity
    Logout {
        /// Identity to log out (defaults to portal.identity)
        #[arg(long)]
        identity: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Onboard { force } => {
            commands::onboard::run(force).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Gateway { port, host } => {
            commands::gateway::run(host, port).await?;
        }
        Commands::Logout { identity } => {
            commands::logout::run(identity).await?;
        }
    }

    Ok(())
}
