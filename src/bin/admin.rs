//! LiveState Admin CLI
//!
//! Maintenance and debugging for a LiveState deployment: mint tokens for
//! manual testing and inspect the NATS-backed snapshot and replay-cache data.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use livestate::engine::storage::snapshot_key;
use livestate::{
    CallerType, ChunkStore, NatsKvStore, NatsStoreConfig, Snapshot, SnapshotStore, TokenService,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "livestate-admin")]
#[command(about = "LiveState Admin CLI - Tokens, snapshots and replay-cache inspection")]
#[command(version = "1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    nats_url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mint an access token for one caller and one actor
    Token {
        /// Signing secret shared with the server
        #[arg(long, env = "LIVESTATE_TOKEN_SECRET", hide_env_values = true)]
        secret: String,

        #[arg(long, default_value = "session")]
        actor_type: String,

        /// Room id
        #[arg(long)]
        actor_id: String,

        #[arg(long)]
        caller_id: String,

        /// guest, user or system
        #[arg(long, default_value = "user")]
        caller_type: String,
    },

    /// Show the status and chunk count of a replay-cache run
    StreamStatus {
        /// Cache key of the run
        key: String,
    },

    /// Print every cached chunk of a run
    StreamDump {
        key: String,

        /// Print chunks one per line instead of concatenated
        #[arg(long)]
        raw: bool,
    },

    /// Print the persisted snapshot of a room
    Snapshot {
        actor_type: String,
        room_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    match cli.command {
        Commands::Token {
            secret,
            actor_type,
            actor_id,
            caller_id,
            caller_type,
        } => mint_token(&secret, &actor_type, &actor_id, &caller_id, &caller_type)?,

        Commands::StreamStatus { key } => {
            let store = connect(&cli.nats_url).await?;
            stream_status(&store, &key).await?;
        }

        Commands::StreamDump { key, raw } => {
            let store = connect(&cli.nats_url).await?;
            stream_dump(&store, &key, raw).await?;
        }

        Commands::Snapshot {
            actor_type,
            room_id,
        } => {
            let store = connect(&cli.nats_url).await?;
            show_snapshot(&store, &actor_type, &room_id).await?;
        }
    }

    Ok(())
}

async fn connect(nats_url: &str) -> Result<NatsKvStore> {
    NatsKvStore::connect(NatsStoreConfig::with_url(nats_url))
        .await
        .with_context(|| format!("connecting to {}", nats_url))
}

fn mint_token(
    secret: &str,
    actor_type: &str,
    actor_id: &str,
    caller_id: &str,
    caller_type: &str,
) -> Result<()> {
    let caller_type = CallerType::parse(caller_type)
        .with_context(|| format!("unknown caller type '{}'", caller_type))?;
    let token = TokenService::new(secret).create_access_token(
        actor_id,
        caller_id,
        caller_type,
        actor_type,
    )?;

    println!(
        "{} {} for {}:{}",
        "🔑 Access token".green().bold(),
        format!("{}/{}", actor_type, actor_id).cyan(),
        caller_type.as_str(),
        caller_id
    );
    println!("{}", token);
    Ok(())
}

async fn stream_status(store: &NatsKvStore, key: &str) -> Result<()> {
    let status = store.status(key).await?;
    let chunks = store.read_from(key, 0).await?;
    let bytes: usize = chunks.iter().map(String::len).sum();

    println!("\n📼 Run {}", key.cyan());
    println!("=====================================");
    println!("Status: {}", colored_status(status.as_str()));
    println!("Chunks: {}", chunks.len());
    println!("Bytes:  {}", bytes);
    Ok(())
}

async fn stream_dump(store: &NatsKvStore, key: &str, raw: bool) -> Result<()> {
    let chunks = store.read_from(key, 0).await?;
    if chunks.is_empty() {
        println!("{}", format!("No chunks cached under {}", key).yellow());
        return Ok(());
    }

    if raw {
        for (index, chunk) in chunks.iter().enumerate() {
            println!("{:>5} {:?}", index.to_string().dimmed(), chunk);
        }
    } else {
        println!("{}", chunks.concat());
    }
    Ok(())
}

async fn show_snapshot(store: &NatsKvStore, actor_type: &str, room_id: &str) -> Result<()> {
    let key = snapshot_key(actor_type, room_id);
    let Some(stored) = store.get(&key).await? else {
        println!("{}", format!("No snapshot persisted for {}", key).yellow());
        return Ok(());
    };

    let persisted: serde_json::Value = serde_json::from_str(&stored)?;
    let snapshot = Snapshot::from_persisted(persisted.clone())?;

    println!("\n📸 Snapshot {}", key.cyan());
    println!("=====================================");
    println!("Status: {}", colored_status(&format!("{:?}", snapshot.status).to_lowercase()));
    println!("State:  {}", serde_json::to_string(&snapshot.value)?);
    if let Some(error) = &snapshot.error {
        println!("Error:  {}", error.red());
    }
    println!("{}", serde_json::to_string_pretty(&persisted)?);
    Ok(())
}

fn colored_status(status: &str) -> colored::ColoredString {
    match status {
        "done" => status.green(),
        "running" | "active" => status.yellow(),
        "error" => status.red(),
        _ => status.dimmed(),
    }
}
