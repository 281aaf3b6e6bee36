use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "propdesk-cli")]
#[command(about = "PropDesk intake back office")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the intake HTTP API.
    Serve,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            propdesk_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = propdesk_intake::IntakeConfig::from_env();
            let Some(url) = config.database_url else {
                anyhow::bail!("DATABASE_URL is not set; nothing to migrate");
            };
            let store = propdesk_intake::PgIntakeStore::connect(&url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
