// LiveState server
// Configuration, store selection and the HTTP/socket server for all actor types

//! # Server Module
//!
//! ```text
//! Client (browser, service, ActorClient)
//!        ↓ HTTP GET/POST, socket
//! Server Layer (this module) ← configuration, stores, router
//!        ↓
//! Engine Layer ← hub, hosts, actors
//!        ↓
//! Storage ← in-memory or NATS key-value
//! ```
//!
//! Configuration comes from the environment (after `.env` is loaded):
//! `LIVESTATE_*` variables map onto [`ServerConfig`] fields, `NATS_URL` and
//! the `OPENAI_*` variables are read as-is.

use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{create_router, tokens::TokenService};
use crate::engine::host::HostConfig;
use crate::engine::hub::ActorHub;
use crate::engine::nats_storage::{NatsKvStore, NatsStoreConfig};
use crate::engine::storage::{ChunkStore, InMemoryChunkStore, InMemorySnapshotStore, SnapshotStore};
use crate::llm::providers::{openai, ScriptedClient};
use crate::llm::stream_source::StreamSourceConfig;
use crate::llm::LLMProviderClient;
use crate::machines::{session_machine, SessionServices};
use crate::{LiveStateError, Result};

/// Where snapshots are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceMode {
    #[default]
    Memory,
    Nats,
    Off,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Signing secret for access and connection tokens
    pub token_secret: Option<String>,
    pub persistence: PersistenceMode,
    pub nats_url: String,
    pub ready_timeout_secs: u64,
    pub flush_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Attached readers give up on a running run that stays silent this long
    pub stall_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            token_secret: None,
            persistence: PersistenceMode::Memory,
            nats_url: "nats://localhost:4222".to_string(),
            ready_timeout_secs: 30,
            flush_interval_ms: 100,
            poll_interval_ms: 100,
            stall_timeout_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Defaults, overridden by `LIVESTATE_*` and `NATS_URL`
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let built = config::Config::builder()
            .set_default("host", defaults.host)
            .and_then(|b| b.set_default("port", i64::from(defaults.port)))
            .and_then(|b| b.set_default("persistence", "memory"))
            .and_then(|b| b.set_default("nats_url", defaults.nats_url))
            .and_then(|b| b.set_default("ready_timeout_secs", defaults.ready_timeout_secs as i64))
            .and_then(|b| b.set_default("flush_interval_ms", defaults.flush_interval_ms as i64))
            .and_then(|b| b.set_default("poll_interval_ms", defaults.poll_interval_ms as i64))
            .and_then(|b| b.set_default("stall_timeout_secs", defaults.stall_timeout_secs as i64))
            .and_then(|b| b.set_override_option("nats_url", std::env::var("NATS_URL").ok()))
            .map_err(config_error)?
            .add_source(config::Environment::with_prefix("LIVESTATE").try_parsing(true))
            .build()
            .map_err(config_error)?;

        built.try_deserialize().map_err(config_error)
    }

    pub fn address(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| LiveStateError::InvalidInput(format!("invalid listen address: {}", e)))
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            ..HostConfig::default()
        }
    }

    pub fn stream_config(&self) -> StreamSourceConfig {
        StreamSourceConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
        }
    }
}

fn config_error(e: config::ConfigError) -> LiveStateError {
    LiveStateError::InvalidInput(format!("configuration: {}", e))
}

/// Canned answer used when no completion endpoint is configured
const OFFLINE_ANSWER: [&str; 3] = [
    "```yaml\nsuggestions:\n",
    "  - name: Configure a model\n    description: Set OPENAI_API_KEY to get real suggestions.\n",
    "```",
];

/// Builder for [`LiveStateServer`]
pub struct ServerBuilder {
    config: ServerConfig,
    provider: Option<Arc<dyn LLMProviderClient>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            provider: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ServerConfig::load()?))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_token_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.token_secret = Some(secret.into());
        self
    }

    pub fn with_persistence(mut self, mode: PersistenceMode) -> Self {
        self.config.persistence = mode;
        self
    }

    /// Completion provider for generations; read from `OPENAI_*` otherwise
    pub fn with_provider(mut self, provider: Arc<dyn LLMProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }

    async fn stores(&self) -> Result<(Option<Arc<dyn SnapshotStore>>, Arc<dyn ChunkStore>)> {
        match self.config.persistence {
            PersistenceMode::Memory => Ok((
                Some(Arc::new(InMemorySnapshotStore::new()) as Arc<dyn SnapshotStore>),
                Arc::new(InMemoryChunkStore::new()) as Arc<dyn ChunkStore>,
            )),
            PersistenceMode::Nats => {
                let store = NatsKvStore::connect(NatsStoreConfig::with_url(&self.config.nats_url)).await?;
                Ok((
                    Some(Arc::new(store.clone()) as Arc<dyn SnapshotStore>),
                    Arc::new(store) as Arc<dyn ChunkStore>,
                ))
            }
            PersistenceMode::Off => Ok((None, Arc::new(InMemoryChunkStore::new()) as Arc<dyn ChunkStore>)),
        }
    }

    fn provider(&self) -> Arc<dyn LLMProviderClient> {
        if let Some(provider) = &self.provider {
            return provider.clone();
        }
        match openai::create_client_from_env() {
            Ok(client) => {
                info!("Completion endpoint: {}", client.config().base_url);
                Arc::new(client)
            }
            Err(e) => {
                warn!("{}; session generations will return a canned answer", e);
                Arc::new(ScriptedClient::new(OFFLINE_ANSWER))
            }
        }
    }

    pub async fn build(self) -> Result<LiveStateServer> {
        let secret = self
            .config
            .token_secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LiveStateError::InvalidInput("LIVESTATE_TOKEN_SECRET is not set".to_string()))?;

        let (snapshots, chunks) = self.stores().await?;
        let services = SessionServices {
            provider: self.provider(),
            chunks,
            stream: self.config.stream_config(),
        };

        let hub = ActorHub::new(TokenService::new(&secret), self.config.host_config())
            .register(session_machine(services)?, snapshots);

        Ok(LiveStateServer {
            config: self.config,
            hub: Arc::new(hub),
        })
    }

    pub async fn build_and_run(self) -> Result<()> {
        self.build().await?.run().await
    }
}

pub struct LiveStateServer {
    config: ServerConfig,
    hub: Arc<ActorHub>,
}

impl LiveStateServer {
    pub fn hub(&self) -> Arc<ActorHub> {
        self.hub.clone()
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.hub.clone())
    }

    /// Serve until Ctrl-C, then stop every actor
    pub async fn run(self) -> Result<()> {
        let addr = self.config.address()?;
        let app = self.router();

        info!("🚀 LiveState server running on http://{}", addr);
        info!("   Actor types: {}", self.hub.actor_types().join(", "));
        info!("   Persistence: {:?}", self.config.persistence);

        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
            })
            .await
            .map_err(|e| LiveStateError::Internal(format!("server error: {}", e)))?;

        info!("Shutting down {} rooms", self.hub.room_count());
        self.hub.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_build_requires_secret() {
        let result = ServerBuilder::new(ServerConfig::default()).build().await;
        assert!(matches!(result, Err(LiveStateError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_builder_registers_session_type() {
        let server = ServerBuilder::new(ServerConfig::default())
            .with_token_secret("secret")
            .with_persistence(PersistenceMode::Off)
            .with_provider(Arc::new(ScriptedClient::new(OFFLINE_ANSWER)))
            .with_port(0)
            .build()
            .await
            .unwrap();

        assert_eq!(server.hub().actor_types(), vec!["session".to_string()]);

        let response = server
            .router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.address().unwrap().port(), 4000);
        assert_eq!(config.stream_config().flush_interval, Duration::from_millis(100));
        assert_eq!(config.host_config().ready_timeout, Duration::from_secs(30));
    }
}
