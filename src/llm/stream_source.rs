//! Completion calls as chunk streams, with an optional replay cache
//!
//! A [`TokenStreamSource`] bound to a cache key replicates every chunk it hands
//! to its primary consumer into a [`ChunkStore`]. Other consumers attach to
//! the same run with [`get_running_stream`] while it is in flight, or with
//! [`get_completed_stream`] once it is done; [`attach`] picks between them.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::engine::storage::{ChunkStore, RunStatus};
use crate::llm::{ChatMessage, LLMError, LLMProviderClient, LLMRequest, LLMResult};
use crate::{LiveStateError, Result};

/// Stream of raw text chunks
pub type TextStream = BoxStream<'static, LLMResult<String>>;

/// Prompt hooks: how an input becomes a system/user message pair
pub trait StreamPrompt: Send + Sync + 'static {
    type Input: Send + Sync;

    fn system_message(&self, input: &Self::Input) -> String;

    fn user_message(&self, input: &Self::Input) -> String;

    fn temperature(&self) -> f32 {
        0.7
    }

    fn max_tokens(&self) -> u32 {
        2048
    }

    /// Model override; the provider's default is used otherwise
    fn model(&self) -> Option<String> {
        None
    }
}

/// Timing of the replay cache
#[derive(Debug, Clone)]
pub struct StreamSourceConfig {
    /// How often buffered chunks are written to the store
    pub flush_interval: Duration,
    /// How often an attached reader checks the store for new chunks
    pub poll_interval: Duration,
    /// An attached reader gives up on a `running` run that stores nothing new
    /// for this long (its writer is presumed dead)
    pub stall_timeout: Duration,
}

impl Default for StreamSourceConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            stall_timeout: Duration::from_secs(60),
        }
    }
}

/// Attempts at storing the last batch before the run is left unfinished
const FINAL_FLUSH_ATTEMPTS: usize = 3;

struct ReplayCache {
    store: Arc<dyn ChunkStore>,
    key: String,
}

/// A model completion exposed as a stream of text chunks
pub struct TokenStreamSource<P: StreamPrompt> {
    prompt: P,
    provider: Arc<dyn LLMProviderClient>,
    cache: Option<ReplayCache>,
    config: StreamSourceConfig,
}

impl<P: StreamPrompt> TokenStreamSource<P> {
    pub fn new(prompt: P, provider: Arc<dyn LLMProviderClient>) -> Self {
        Self {
            prompt,
            provider,
            cache: None,
            config: StreamSourceConfig::default(),
        }
    }

    /// Replicate the run into `store` under `key`
    pub fn with_cache(mut self, store: Arc<dyn ChunkStore>, key: impl Into<String>) -> Self {
        self.cache = Some(ReplayCache {
            store,
            key: key.into(),
        });
        self
    }

    pub fn with_config(mut self, config: StreamSourceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache.as_ref().map(|c| c.key.as_str())
    }

    /// The completion request `input` turns into
    pub fn request(&self, input: &P::Input) -> LLMRequest {
        LLMRequest {
            model: self.prompt.model().unwrap_or_else(|| self.provider.default_model()),
            messages: vec![
                ChatMessage::system(self.prompt.system_message(input)),
                ChatMessage::user(self.prompt.user_message(input)),
            ],
            temperature: Some(self.prompt.temperature()),
            max_tokens: Some(self.prompt.max_tokens()),
            stream: true,
        }
    }

    /// Start the completion and return its chunks.
    ///
    /// With a cache key the run is marked `running` before this returns and
    /// runs to completion in the background even if the returned stream is
    /// dropped; the status becomes `done` only after every chunk is stored.
    pub async fn get_stream(&self, input: &P::Input) -> Result<TextStream> {
        let request = self.request(input);

        let Some(cache) = &self.cache else {
            let source = self.provider.chat_completion_stream(request).await?;
            return Ok(text_chunks(source).boxed());
        };

        if !cache.store.start_run(&cache.key).await? {
            let status = cache.store.status(&cache.key).await?;
            return Err(LiveStateError::InvalidInput(format!(
                "stream run {} already {}",
                cache.key, status
            )));
        }
        info!(
            "Starting cached stream run {} via {}",
            cache.key,
            self.provider.provider_name()
        );

        let source = match self.provider.chat_completion_stream(request).await {
            Ok(source) => source,
            Err(e) => {
                if let Err(store_err) = cache.store.set_status(&cache.key, RunStatus::Done).await {
                    warn!("Failed to close stream run {}: {}", cache.key, store_err);
                }
                return Err(e.into());
            }
        };

        let (primary_tx, primary_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_batches(
            cache.store.clone(),
            cache.key.clone(),
            writer_rx,
            self.config.flush_interval,
        ));

        let key = cache.key.clone();
        tokio::spawn(async move {
            let mut chunks = Box::pin(text_chunks(source));
            while let Some(item) = chunks.next().await {
                match &item {
                    Ok(text) => {
                        let _ = writer_tx.send(text.clone());
                    }
                    Err(e) => warn!("Stream run {} failed at source: {}", key, e),
                }
                // the primary consumer may have gone away; the run continues regardless
                let _ = primary_tx.send(item);
            }
            debug!("Stream run {} source ended", key);
        });

        Ok(UnboundedReceiverStream::new(primary_rx).boxed())
    }

    /// Attach to this source's run while it is in flight
    pub fn get_running_stream(&self) -> Result<TextStream> {
        let cache = self.require_cache()?;
        Ok(get_running_stream(
            cache.store.clone(),
            cache.key.clone(),
            &self.config,
        ))
    }

    /// Read this source's finished run
    pub async fn get_completed_stream(&self) -> Result<TextStream> {
        let cache = self.require_cache()?;
        get_completed_stream(cache.store.as_ref(), &cache.key).await
    }

    fn require_cache(&self) -> Result<&ReplayCache> {
        self.cache
            .as_ref()
            .ok_or_else(|| LiveStateError::InvalidInput("stream source has no cache key".to_string()))
    }
}

/// Text deltas of a provider stream, skipping chunks without text
fn text_chunks(source: crate::llm::ChunkStream) -> impl futures::Stream<Item = LLMResult<String>> + Send {
    source.filter_map(|chunk| async move {
        match chunk {
            Ok(chunk) if chunk.text().is_empty() => None,
            Ok(chunk) => Some(Ok(chunk.text().to_string())),
            Err(e) => Some(Err(e)),
        }
    })
}

/// Single writer of a run: batches chunks and flushes them on a fixed interval,
/// drains whatever is left once the producer hangs up, then marks the run done.
///
/// A batch that fails to store is kept and retried in order. If the last batch
/// still cannot be stored the run stays `running`; readers then stall out
/// instead of treating an incomplete list as finished.
async fn write_batches(
    store: Arc<dyn ChunkStore>,
    key: String,
    mut chunks: mpsc::UnboundedReceiver<String>,
    flush_interval: Duration,
) {
    let mut batch: Vec<String> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut written = 0usize;

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(chunk) => batch.push(chunk),
                None => break,
            },
            _ = ticker.tick() => {
                written += flush(store.as_ref(), &key, &mut batch).await;
            }
        }
    }

    let mut attempts = 0;
    while !batch.is_empty() {
        attempts += 1;
        written += flush(store.as_ref(), &key, &mut batch).await;
        if batch.is_empty() {
            break;
        }
        if attempts >= FINAL_FLUSH_ATTEMPTS {
            error!(
                "Stream run {} lost {} unstored chunks; leaving it unfinished",
                key,
                batch.len()
            );
            return;
        }
        tokio::time::sleep(flush_interval).await;
    }

    if let Err(e) = store.set_status(&key, RunStatus::Done).await {
        warn!("Failed to mark stream run {} done: {}", key, e);
    }
    info!("Stream run {} done ({} chunks stored)", key, written);
}

/// Store `batch`; it is only cleared once the append succeeded
async fn flush(store: &dyn ChunkStore, key: &str, batch: &mut Vec<String>) -> usize {
    if batch.is_empty() {
        return 0;
    }
    let count = batch.len();
    match store.append(key, batch.clone()).await {
        Ok(()) => {
            batch.clear();
            count
        }
        Err(e) => {
            warn!("Failed to store {} chunks for run {} (will retry): {}", count, key, e);
            0
        }
    }
}

fn store_error(e: LiveStateError) -> LLMError {
    LLMError::Internal(format!("replay cache: {}", e))
}

/// Follow a run from the first chunk, polling until it is done.
///
/// A run still `running` that stores nothing new for `stall_timeout` ends the
/// stream with a timeout error.
pub fn get_running_stream(
    store: Arc<dyn ChunkStore>,
    key: String,
    config: &StreamSourceConfig,
) -> TextStream {
    struct Cursor {
        store: Arc<dyn ChunkStore>,
        key: String,
        next: usize,
        pending: VecDeque<String>,
        finished: bool,
        last_progress: Instant,
    }

    let poll_interval = config.poll_interval;
    let stall_timeout = config.stall_timeout;
    let cursor = Cursor {
        store,
        key,
        next: 0,
        pending: VecDeque::new(),
        finished: false,
        last_progress: Instant::now(),
    };

    futures::stream::unfold(cursor, move |mut cursor| async move {
        loop {
            if let Some(chunk) = cursor.pending.pop_front() {
                return Some((Ok(chunk), cursor));
            }
            if cursor.finished {
                return None;
            }

            // status first: once `done` is seen, the read that follows is complete
            let status = match cursor.store.status(&cursor.key).await {
                Ok(status) => status,
                Err(e) => {
                    cursor.finished = true;
                    return Some((Err(store_error(e)), cursor));
                }
            };
            match cursor.store.read_from(&cursor.key, cursor.next).await {
                Ok(chunks) if !chunks.is_empty() => {
                    cursor.next += chunks.len();
                    cursor.pending.extend(chunks);
                    cursor.last_progress = Instant::now();
                }
                Ok(_) if status == RunStatus::Done => cursor.finished = true,
                Ok(_) if cursor.last_progress.elapsed() >= stall_timeout => {
                    warn!("Stream run {} stalled at chunk {}", cursor.key, cursor.next);
                    cursor.finished = true;
                    let stalled = LLMError::Timeout(format!(
                        "run {} stored nothing new for {:?}",
                        cursor.key, stall_timeout
                    ));
                    return Some((Err(stalled), cursor));
                }
                Ok(_) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    cursor.finished = true;
                    return Some((Err(store_error(e)), cursor));
                }
            }
        }
    })
    .boxed()
}

/// Read a finished run in one go
pub async fn get_completed_stream(store: &dyn ChunkStore, key: &str) -> Result<TextStream> {
    let chunks = store.read_from(key, 0).await?;
    Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
}

/// Attach to whatever state the run under `key` is in; `None` if it never started
pub async fn attach(
    store: Arc<dyn ChunkStore>,
    key: &str,
    config: &StreamSourceConfig,
) -> Result<Option<TextStream>> {
    match store.status(key).await? {
        RunStatus::Uninitialized => Ok(None),
        RunStatus::Running => Ok(Some(get_running_stream(store, key.to_string(), config))),
        RunStatus::Done => Ok(Some(get_completed_stream(store.as_ref(), key).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryChunkStore;
    use crate::llm::providers::ScriptedClient;

    struct Echo;

    impl StreamPrompt for Echo {
        type Input = String;

        fn system_message(&self, _input: &String) -> String {
            "Answer in YAML.".to_string()
        }

        fn user_message(&self, input: &String) -> String {
            format!("Topic: {}", input)
        }

        fn temperature(&self) -> f32 {
            0.2
        }
    }

    fn fast() -> StreamSourceConfig {
        StreamSourceConfig {
            flush_interval: Duration::from_millis(5),
            poll_interval: Duration::from_millis(5),
            stall_timeout: Duration::from_millis(200),
        }
    }

    async fn collect(stream: TextStream) -> Vec<String> {
        stream.map(|c| c.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_request_from_prompt_hooks() {
        let client = Arc::new(ScriptedClient::new(["x"]));
        let source = TokenStreamSource::new(Echo, client.clone());

        let request = source.request(&"soup".to_string());
        assert_eq!(request.model, "scripted");
        assert_eq!(request.messages[1].content, "Topic: soup");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(2048));

        let chunks = collect(source.get_stream(&"soup".to_string()).await.unwrap()).await;
        assert_eq!(chunks, vec!["x"]);
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cached_run_is_replicated() {
        let store = Arc::new(InMemoryChunkStore::new());
        let source = TokenStreamSource::new(Echo, Arc::new(ScriptedClient::new(["a", "b", "c"])))
            .with_cache(store.clone(), "run-1")
            .with_config(fast());

        let stream = source.get_stream(&"t".to_string()).await.unwrap();
        assert_eq!(store.status("run-1").await.unwrap(), RunStatus::Running);
        assert_eq!(collect(stream).await, vec!["a", "b", "c"]);

        let replay = source.get_running_stream().unwrap();
        assert_eq!(collect(replay).await, vec!["a", "b", "c"]);
        assert_eq!(store.status("run-1").await.unwrap(), RunStatus::Done);

        let completed = source.get_completed_stream().await.unwrap();
        assert_eq!(collect(completed).await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_reader_sees_same_chunks() {
        let store = Arc::new(InMemoryChunkStore::new());
        let client = ScriptedClient::new(["reci", "pes:\n", "  - x\n"]).with_delay(Duration::from_millis(10));
        let source = TokenStreamSource::new(Echo, Arc::new(client))
            .with_cache(store.clone(), "run-2")
            .with_config(fast());

        let primary = source.get_stream(&"t".to_string()).await.unwrap();
        let follower = attach(store.clone(), "run-2", &fast())
            .await
            .unwrap()
            .unwrap();

        let (a, b) = tokio::join!(collect(primary), collect(follower));
        assert_eq!(a, vec!["reci", "pes:\n", "  - x\n"]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_run_continues_after_primary_drops() {
        let store = Arc::new(InMemoryChunkStore::new());
        let source = TokenStreamSource::new(Echo, Arc::new(ScriptedClient::new(["a", "b"])))
            .with_cache(store.clone(), "run-3")
            .with_config(fast());

        drop(source.get_stream(&"t".to_string()).await.unwrap());

        let replay = get_running_stream(store.clone(), "run-3".to_string(), &fast());
        assert_eq!(collect(replay).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_source_failure_keeps_partial_run() {
        let store = Arc::new(InMemoryChunkStore::new());
        let source = TokenStreamSource::new(Echo, Arc::new(ScriptedClient::new(["a", "b"]).failing_after(1)))
            .with_cache(store.clone(), "run-4")
            .with_config(fast());

        let items: Vec<LLMResult<String>> = source.get_stream(&"t".to_string()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());

        let replay = get_running_stream(store.clone(), "run-4".to_string(), &fast());
        assert_eq!(collect(replay).await, vec!["a"]);
    }

    #[tokio::test]
    async fn test_second_run_on_same_key_is_refused() {
        let store = Arc::new(InMemoryChunkStore::new());
        let source = TokenStreamSource::new(Echo, Arc::new(ScriptedClient::new(["a"])))
            .with_cache(store.clone(), "run-5");

        let _first = source.get_stream(&"t".to_string()).await.unwrap();
        assert!(matches!(
            source.get_stream(&"t".to_string()).await,
            Err(LiveStateError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_before_start_is_none() {
        let store: Arc<dyn ChunkStore> = Arc::new(InMemoryChunkStore::new());
        assert!(attach(store, "missing", &fast())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_concurrent_starts_have_one_writer() {
        let store = Arc::new(InMemoryChunkStore::new());
        let client = ScriptedClient::new(["a", "b"]);
        let source = TokenStreamSource::new(Echo, Arc::new(client.clone()))
            .with_cache(store.clone(), "run-6")
            .with_config(fast());

        let input = "t".to_string();
        let (first, second) = tokio::join!(source.get_stream(&input), source.get_stream(&input));
        assert!(first.is_ok() ^ second.is_ok());
        assert_eq!(client.requests().len(), 1);

        let winner = first.or(second).unwrap();
        assert_eq!(collect(winner).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_orphaned_run_stalls_out() {
        let store = Arc::new(InMemoryChunkStore::new());
        store.start_run("run-7").await.unwrap();
        store.append("run-7", vec!["reci".to_string()]).await.unwrap();

        let items: Vec<LLMResult<String>> =
            get_running_stream(store.clone(), "run-7".to_string(), &fast()).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "reci");
        assert!(matches!(items[1], Err(LLMError::Timeout(_))));
    }

    /// Chunk store whose first `failures` appends fail
    struct FlakyStore {
        inner: InMemoryChunkStore,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChunkStore for FlakyStore {
        async fn append(&self, key: &str, chunks: Vec<String>) -> Result<()> {
            use std::sync::atomic::Ordering;
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("store unavailable").into());
            }
            self.inner.append(key, chunks).await
        }

        async fn read_from(&self, key: &str, from: usize) -> Result<Vec<String>> {
            self.inner.read_from(key, from).await
        }

        async fn status(&self, key: &str) -> Result<RunStatus> {
            self.inner.status(key).await
        }

        async fn start_run(&self, key: &str) -> Result<bool> {
            self.inner.start_run(key).await
        }

        async fn set_status(&self, key: &str, status: RunStatus) -> Result<()> {
            self.inner.set_status(key, status).await
        }
    }

    fn flaky(failures: usize) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: InMemoryChunkStore::new(),
            failures: std::sync::atomic::AtomicUsize::new(failures),
        })
    }

    #[tokio::test]
    async fn test_failed_append_is_retried_in_order() {
        let store = flaky(1);
        let script = ["reci", "pes:\n  - name: A\n", "    description: B\n"];
        let client = ScriptedClient::new(script).with_delay(Duration::from_millis(10));
        let source = TokenStreamSource::new(Echo, Arc::new(client))
            .with_cache(store.clone(), "run-8")
            .with_config(fast());

        let primary = collect(source.get_stream(&"t".to_string()).await.unwrap()).await;
        let replay = collect(get_running_stream(store.clone(), "run-8".to_string(), &fast())).await;

        assert_eq!(primary, script);
        assert_eq!(replay, primary);
        assert_eq!(store.status("run-8").await.unwrap(), RunStatus::Done);
    }

    #[tokio::test]
    async fn test_unstorable_run_is_not_marked_done() {
        let store = flaky(usize::MAX);
        let source = TokenStreamSource::new(Echo, Arc::new(ScriptedClient::new(["a"])))
            .with_cache(store.clone(), "run-9")
            .with_config(fast());

        collect(source.get_stream(&"t".to_string()).await.unwrap()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.status("run-9").await.unwrap(), RunStatus::Running);
    }
}
