// LiveState - Main Server
// Serves every registered actor type over HTTP and sockets
// Run with: cargo run --bin server

//! # LiveState Server Binary
//!
//! Starts the HTTP/socket server with the bundled `session` actor type.
//!
//! ```text
//! main()
//!   ↓ loads .env, configures logging
//! ServerBuilder::from_env()
//!   ↓ builds stores, provider, hub
//! LiveStateServer::run()
//!   ↓ serves until Ctrl-C, then stops every actor
//! ```
//!
//! Required: `LIVESTATE_TOKEN_SECRET`. Optional: `LIVESTATE_PORT`,
//! `LIVESTATE_PERSISTENCE` (`memory`, `nats`, `off`), `NATS_URL`,
//! `OPENAI_API_KEY`, `RUST_LOG`.

use dotenv::dotenv;
use livestate::ServerBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("🚀 Starting LiveState Server...");
    info!("=====================================");

    if std::env::var("OPENAI_API_KEY").is_ok() {
        info!("✅ OpenAI API key configured");
    }

    ServerBuilder::from_env()?.build_and_run().await?;

    Ok(())
}
