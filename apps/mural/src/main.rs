use clap::Parser;
use mural_client_core::app;
use mural_client_core::cli::Cli;

#[tokio::main]
async fn main() {
    // Load .env before clap resolves env-backed arguments.
    let _ = dotenvy::dotenv();
    if let Err(err) = app::run(Cli::parse()).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
