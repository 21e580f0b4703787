use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::downloader::chunk_fetcher::fetch_chunk;
use crate::downloader::preallocate::preallocate;
use crate::downloader::strategy::download_strategy::DownloadStrategy;
use crate::types::types::{Chunk, ChunkState, DownloadError, DownloadJob, ProgressEvent};

/// Wall-clock limit for a single request attempt, covering the request and
/// the body copy. Per attempt and per chunk; there is no job-level timeout.
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Splits `total_size` bytes into fixed-size chunks in ascending offset
/// order. Chunks are contiguous, non-overlapping, and cover `[0, total_size)`
/// exactly; the final chunk is clamped to the remaining bytes, so there are
/// always `ceil(total_size / chunk_size)` of them. A zero `total_size`
/// yields no chunks.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;

    while offset < total_size {
        let length = chunk_size.min(total_size - offset);
        chunks.push(Chunk::new(index, offset, length));
        offset += length;
        index += 1;
    }

    chunks
}

/// Coordinates one all-or-nothing ranged download: plans chunks, preallocates
/// the destination, fans out bounded concurrent workers, joins them all, and
/// deletes the file if any chunk failed.
pub struct RangedDownloadStrategy {
    job: DownloadJob,
    chunks: Arc<RwLock<HashMap<usize, Chunk>>>,
    client: Arc<Client>,
    cancel_token: CancellationToken,
    attempt_timeout: Duration,
    progress_tx: Mutex<Option<mpsc::Sender<Result<ProgressEvent, String>>>>,
}

pub struct RangedDownloadStrategyBuilder {
    job: DownloadJob,
    client: Option<Client>,
    attempt_timeout: Duration,
}

impl RangedDownloadStrategy {
    pub fn builder(job: DownloadJob) -> RangedDownloadStrategyBuilder {
        RangedDownloadStrategyBuilder {
            job,
            client: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn job(&self) -> &DownloadJob {
        &self.job
    }

    /// Returns a reference to the internal chunk table (for testing/inspection).
    pub fn chunks(&self) -> &Arc<RwLock<HashMap<usize, Chunk>>> {
        &self.chunks
    }

    /// Returns a reference to the cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    fn progress_sender(&self) -> Option<mpsc::Sender<Result<ProgressEvent, String>>> {
        self.progress_tx
            .lock()
            .expect("progress_tx mutex poisoned")
            .clone()
    }
}

impl RangedDownloadStrategyBuilder {
    /// Use a caller-supplied HTTP client instead of the tuned default.
    /// The client is owned by the strategy, never global state, so tests can
    /// inject their own transport configuration.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn build(self) -> RangedDownloadStrategy {
        let concurrency = self.job.concurrency.max(1);
        let client = self.client.unwrap_or_else(|| {
            // Tuned HTTP client: connection pool sized to the worker count,
            // bounded connect time, TCP optimizations.
            Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .pool_max_idle_per_host(concurrency)
                .tcp_nodelay(true)
                .build()
                .expect("failed to build HTTP client")
        });

        RangedDownloadStrategy {
            job: self.job,
            chunks: Arc::new(RwLock::new(HashMap::new())),
            client: Arc::new(client),
            cancel_token: CancellationToken::new(),
            attempt_timeout: self.attempt_timeout,
            progress_tx: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DownloadStrategy for RangedDownloadStrategy {
    fn set_progress_tx(&self, tx: mpsc::Sender<Result<ProgressEvent, String>>) {
        *self
            .progress_tx
            .lock()
            .expect("progress_tx mutex poisoned") = Some(tx);
    }

    fn clear_progress_tx(&self) {
        *self
            .progress_tx
            .lock()
            .expect("progress_tx mutex poisoned") = None;
    }

    /// Plans the chunk table and preallocates the destination file to its
    /// final size. A preallocation failure aborts the job before any worker
    /// starts; the partially created file is removed best-effort.
    async fn preprocess(&self) -> Result<(), DownloadError> {
        let plan = plan_chunks(self.job.total_size, self.job.chunk_size);

        {
            let mut chunks = self.chunks.write().await;
            chunks.clear();
            for chunk in plan {
                chunks.insert(chunk.index, chunk);
            }
        }

        if let Err(err) = preallocate(&self.job.dest_path, self.job.total_size).await {
            let _ = tokio::fs::remove_file(&self.job.dest_path).await;
            return Err(err);
        }

        Ok(())
    }

    /// Runs one worker per pending chunk, at most `concurrency` in flight at
    /// once. Dispatch order is ascending offset; completion order is not.
    /// Every worker reports exactly one outcome, and the decision is made
    /// only after all of them have joined: any chunk failure invalidates the
    /// whole file, which is then deleted and the first observed failure
    /// returned.
    async fn download(&self) -> Result<(), DownloadError> {
        let pending: Vec<Chunk> = {
            let chunks = self.chunks.read().await;
            let mut pending: Vec<Chunk> = chunks
                .values()
                .filter(|c| c.state == ChunkState::Pending)
                .cloned()
                .collect();
            pending.sort_by_key(|c| c.offset);
            pending
        };

        if pending.is_empty() {
            return Ok(());
        }

        let progress_tx = self.progress_sender();
        let semaphore = Arc::new(Semaphore::new(self.job.concurrency.max(1)));
        let mut handles = Vec::with_capacity(pending.len());

        for chunk in pending {
            let client = Arc::clone(&self.client);
            let url = self.job.url.clone();
            let dest_path = self.job.dest_path.clone();
            let max_retries = self.job.max_retries;
            let attempt_timeout = self.attempt_timeout;
            let cancel_token = self.cancel_token.clone();
            let semaphore = Arc::clone(&semaphore);
            let progress_tx = progress_tx.clone();
            let index = chunk.index;
            let chunk_length = chunk.length;

            let handle = tokio::spawn(async move {
                // Excess chunks queue here until a worker slot frees up.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(DownloadError::Cancelled),
                };

                fetch_chunk(
                    chunk,
                    &client,
                    &url,
                    &dest_path,
                    max_retries,
                    attempt_timeout,
                    cancel_token,
                    move |bytes_delta| {
                        if let Some(tx) = &progress_tx {
                            let _ = tx.try_send(Ok(ProgressEvent {
                                chunk_index: index,
                                bytes_delta,
                                total_bytes: Some(chunk_length),
                            }));
                        }
                    },
                )
                .await
            });

            handles.push((index, handle));
        }

        // Join every worker before deciding: no short-circuit on first
        // failure while siblings are still writing.
        let results: Vec<_> = futures::future::join_all(
            handles
                .into_iter()
                .map(|(index, handle)| async move { (index, handle.await) }),
        )
        .await;

        let mut chunks_guard = self.chunks.write().await;
        let mut first_error: Option<DownloadError> = None;

        for (index, result) in results {
            match result {
                Ok(Ok(done)) => {
                    chunks_guard.insert(index, done);
                }
                Ok(Err(err)) => {
                    if let Some(c) = chunks_guard.get_mut(&index) {
                        c.state = ChunkState::Failed;
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if let Some(c) = chunks_guard.get_mut(&index) {
                        c.state = ChunkState::Failed;
                    }
                    if first_error.is_none() {
                        first_error = Some(DownloadError::ChunkFailed(join_err.to_string()));
                    }
                }
            }
        }

        drop(chunks_guard);

        if let Some(err) = first_error {
            // A file with a missing range is not a valid reconstruction of
            // the source. Deletion is best-effort; a failure to delete is
            // logged but does not replace the chunk error.
            if let Err(remove_err) = tokio::fs::remove_file(&self.job.dest_path).await {
                log::warn!(
                    "failed to remove incomplete file {}: {}",
                    self.job.dest_path.display(),
                    remove_err
                );
            }
            return Err(err);
        }

        Ok(())
    }

    /// Terminal for this strategy: there is no resume path, so pausing
    /// cancels the token just like `stop()` and a subsequent `download()`
    /// fails with `Cancelled` and removes the destination.
    async fn pause(&self) -> Result<(), DownloadError> {
        self.cancel_token.cancel();
        Ok(())
    }

    async fn stop(&self) -> Result<(), DownloadError> {
        self.cancel_token.cancel();
        Ok(())
    }

    /// Sanity guard: every chunk must have finished. `download()` already
    /// enforces this, so a violation here means a caller skipped a phase.
    async fn postprocess(&self) -> Result<(), DownloadError> {
        let chunks = self.chunks.read().await;
        for chunk in chunks.values() {
            if chunk.state != ChunkState::Finished {
                return Err(DownloadError::ChunkFailed(format!(
                    "chunk {} is in state {:?}, expected Finished",
                    chunk.index, chunk.state
                )));
            }
        }
        Ok(())
    }
}
