// NATS storage implementation for actor snapshots and the token-stream replay cache
// This provides durable, shared storage using NATS JetStream key-value buckets

//! # NATS Storage Implementation
//!
//! Both durable stores are backed by JetStream key-value buckets:
//!
//! - `snapshots` bucket: one entry per room key (`"{actorType}:{roomId}"`)
//! - `chunks` bucket: per cache key, a length entry, a status entry and one
//!   entry per chunk
//!
//! ## Key Layout
//!
//! KV keys only allow a restricted alphabet, so room and cache keys are
//! base64 (URL-safe, unpadded) encoded before use:
//!
//! ```text
//! {enc(key)}            persisted snapshot JSON       (snapshots bucket)
//! {enc(key)}.n          number of chunks written       (chunks bucket)
//! {enc(key)}.status     uninitialized | running | done (chunks bucket)
//! {enc(key)}.{index}    chunk text                     (chunks bucket)
//! ```
//!
//! A batch is written chunk entries first and length last, so a reader that
//! observes length `n` can always read chunks `0..n`.

use std::time::Duration;

use async_nats::jetstream;
use async_nats::Client;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::engine::storage::{ChunkStore, RunStatus, SnapshotStore};
use crate::{LiveStateError, Result};

/// Configuration for NATS-backed stores
#[derive(Debug, Clone)]
pub struct NatsStoreConfig {
    pub url: String,
    pub snapshots_bucket: String,
    pub chunks_bucket: String,
    pub connection_timeout: Duration,
    pub reconnect_attempts: usize,
    /// Replay runs and snapshots older than this are expired by the server
    pub max_age: Duration,
    pub replicas: usize,
    pub client_name: Option<String>,
}

impl Default for NatsStoreConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            snapshots_bucket: "livestate_snapshots".to_string(),
            chunks_bucket: "livestate_chunks".to_string(),
            connection_timeout: Duration::from_secs(5),
            reconnect_attempts: 3,
            max_age: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            replicas: 1,
            client_name: Some("livestate".to_string()),
        }
    }
}

impl NatsStoreConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// JetStream key-value implementation of [`SnapshotStore`] and [`ChunkStore`]
#[derive(Clone)]
pub struct NatsKvStore {
    #[allow(dead_code)]
    client: Client,
    snapshots: jetstream::kv::Store,
    chunks: jetstream::kv::Store,
}

impl NatsKvStore {
    /// Connect to NATS and make sure both buckets exist
    pub async fn connect(config: NatsStoreConfig) -> Result<Self> {
        info!("Connecting to NATS server at {}", config.url);
        let client = Self::connect_with_retry(&config).await.map_err(|e| {
            error!("Failed to connect to NATS: {}", e);
            LiveStateError::Storage(anyhow::anyhow!("Failed to connect to NATS: {}", e))
        })?;

        let js = jetstream::new(client.clone());
        let snapshots = Self::ensure_kv_bucket(&js, &config.snapshots_bucket, &config).await?;
        let chunks = Self::ensure_kv_bucket(&js, &config.chunks_bucket, &config).await?;

        info!("NATS stores initialized");
        Ok(Self {
            client,
            snapshots,
            chunks,
        })
    }

    async fn connect_with_retry(
        config: &NatsStoreConfig,
    ) -> std::result::Result<Client, async_nats::Error> {
        let attempts = config.reconnect_attempts.max(1);
        let mut last_error: Option<async_nats::Error> = None;

        for attempt in 1..=attempts {
            let mut options =
                async_nats::ConnectOptions::new().connection_timeout(config.connection_timeout);
            if let Some(name) = &config.client_name {
                options = options.name(name);
            }

            match options.connect(&config.url).await {
                Ok(client) => {
                    debug!("Connected to NATS after {} attempt(s)", attempt);
                    return Ok(client);
                }
                Err(e) => {
                    warn!("NATS connection attempt {} failed: {}", attempt, e);
                    last_error = Some(e.into());
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "Failed to connect to NATS server".into()))
    }

    async fn ensure_kv_bucket(
        js: &jetstream::Context,
        bucket: &str,
        config: &NatsStoreConfig,
    ) -> Result<jetstream::kv::Store> {
        if let Ok(kv) = js.get_key_value(bucket).await {
            debug!("Using existing KV bucket: {}", bucket);
            return Ok(kv);
        }

        info!("Creating KV bucket: {}", bucket);
        js.create_key_value(jetstream::kv::Config {
            bucket: bucket.to_string(),
            history: 1,
            max_age: config.max_age,
            storage: jetstream::stream::StorageType::File,
            num_replicas: config.replicas,
            description: format!("LiveState storage - {}", bucket),
            ..Default::default()
        })
        .await
        .map_err(|e| {
            error!("Failed to create KV bucket {}: {}", bucket, e);
            LiveStateError::Storage(anyhow::anyhow!(
                "Failed to create KV bucket {}: {}",
                bucket,
                e
            ))
        })
    }

    fn encode_key(key: &str) -> String {
        URL_SAFE_NO_PAD.encode(key.as_bytes())
    }

    async fn read_string(kv: &jetstream::kv::Store, key: &str) -> Result<Option<String>> {
        let value = kv
            .get(key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", key, e))?;

        match value {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| anyhow::anyhow!("Entry {} is not UTF-8: {}", key, e))?,
            )),
            None => Ok(None),
        }
    }

    async fn write_string(kv: &jetstream::kv::Store, key: &str, value: String) -> Result<()> {
        kv.put(key, Bytes::from(value))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", key, e))?;
        Ok(())
    }

    async fn chunk_count(&self, encoded: &str) -> Result<usize> {
        match Self::read_string(&self.chunks, &format!("{}.n", encoded)).await? {
            Some(raw) => Ok(raw
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Corrupt chunk count {}: {}", raw, e))?),
            None => Ok(0),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for NatsKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Self::read_string(&self.snapshots, &Self::encode_key(key)).await
    }

    async fn put(&self, key: &str, snapshot: String) -> Result<()> {
        Self::write_string(&self.snapshots, &Self::encode_key(key), snapshot).await
    }
}

#[async_trait::async_trait]
impl ChunkStore for NatsKvStore {
    async fn append(&self, key: &str, chunks: Vec<String>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let encoded = Self::encode_key(key);
        if ChunkStore::status(self, key).await? == RunStatus::Done {
            return Err(anyhow::anyhow!("run {} is done; chunk list is immutable", key).into());
        }

        let start = self.chunk_count(&encoded).await?;
        let count = chunks.len();
        for (offset, chunk) in chunks.into_iter().enumerate() {
            Self::write_string(&self.chunks, &format!("{}.{}", encoded, start + offset), chunk)
                .await?;
        }
        Self::write_string(
            &self.chunks,
            &format!("{}.n", encoded),
            (start + count).to_string(),
        )
        .await
    }

    async fn read_from(&self, key: &str, from: usize) -> Result<Vec<String>> {
        let encoded = Self::encode_key(key);
        let count = self.chunk_count(&encoded).await?;

        let mut chunks = Vec::with_capacity(count.saturating_sub(from));
        for index in from..count {
            let chunk = Self::read_string(&self.chunks, &format!("{}.{}", encoded, index))
                .await?
                .ok_or_else(|| anyhow::anyhow!("Chunk {} of run {} is missing", index, key))?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    async fn status(&self, key: &str) -> Result<RunStatus> {
        let status_key = format!("{}.status", Self::encode_key(key));
        match Self::read_string(&self.chunks, &status_key).await? {
            Some(raw) => Ok(raw.parse::<RunStatus>()?),
            None => Ok(RunStatus::Uninitialized),
        }
    }

    async fn start_run(&self, key: &str) -> Result<bool> {
        let status_key = format!("{}.status", Self::encode_key(key));
        // `create` only succeeds when the entry does not exist yet
        match self
            .chunks
            .create(&status_key, Bytes::from(RunStatus::Running.as_str()))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match ChunkStore::status(self, key).await? {
                RunStatus::Uninitialized => {
                    Err(anyhow::anyhow!("Failed to start run {}: {}", key, e).into())
                }
                _ => Ok(false),
            },
        }
    }

    async fn set_status(&self, key: &str, status: RunStatus) -> Result<()> {
        let current = ChunkStore::status(self, key).await?;
        if !current.can_advance_to(status) {
            return Err(anyhow::anyhow!(
                "run {} cannot move from {} to {}",
                key,
                current,
                status
            )
            .into());
        }

        let status_key = format!("{}.status", Self::encode_key(key));
        Self::write_string(&self.chunks, &status_key, status.as_str().to_string()).await
    }
}

#[cfg(test)]
#[path = "nats_storage_tests.rs"]
mod nats_storage_tests;
