//! Binary entry point: loads `.env`, initializes tracing, parses the CLI,
//! and dispatches into `cli::run`.

mod cli;

use clap::Parser;

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = cli::Cli::parse();
    cli::run(cli).await
}
