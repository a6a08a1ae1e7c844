use clap::Parser;
use tracing_subscriber::EnvFilter;

use inoculate_rs::cli::{self, Cli};

#[tokio::main]
async fn main() {
    // .env is optional; real deployments set the variables directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(2);
        }
    }
}
