use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Pending,
    Downloading,
    Finished,
    Failed,
}

/// One contiguous byte range of the source file, downloaded by one worker.
///
/// Chunks are derived deterministically from the job parameters: contiguous,
/// non-overlapping, and together covering exactly `[0, total_size)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
    pub written: u64,
    pub state: ChunkState,
}

impl Chunk {
    pub fn new(index: usize, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            written: 0,
            state: ChunkState::Pending,
        }
    }
}

/// Everything the coordinator needs to run one download attempt.
/// Immutable once the strategy starts.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub dest_path: PathBuf,
    /// Total file size in bytes, known in advance from the metadata probe.
    pub total_size: u64,
    pub chunk_size: u64,
    /// Upper bound on workers in flight at once.
    pub concurrency: usize,
    /// Attempts per chunk, counting the first try.
    pub max_retries: usize,
}

/// Result of the header-only metadata probe. The etag is an opaque content
/// identifier reported to the user; it is never used for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub total_size: u64,
    pub etag: Option<String>,
}

/// Raw progress message sent from a chunk worker to the notifier.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub chunk_index: usize,
    pub bytes_delta: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    /// Transport-level failure while sending a request. Retryable.
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("disk I/O failed: {0}")]
    Disk(std::io::Error),

    /// A per-attempt deadline expired. Retryable, like any transport failure.
    #[error("request exceeded the {0:?} attempt deadline")]
    Timeout(Duration),

    /// The server answered something other than 206 Partial Content.
    /// Not retried: a server without range support fails the whole job.
    #[error("server answered {0} instead of 206 Partial Content")]
    UnexpectedStatus(reqwest::StatusCode),

    /// The response body ended before the full range arrived. Never
    /// tolerated silently: a short chunk is a failed chunk.
    #[error("response body ended after {written} of {expected} bytes")]
    ShortBody { written: u64, expected: u64 },

    #[error("response carries no Content-Length header")]
    MissingContentLength,

    /// A chunk ran out of transport-level retries; carries the last error.
    #[error("chunk {index} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        index: usize,
        attempts: usize,
        last: Box<DownloadError>,
    },

    #[error("chunk failed: {0}")]
    ChunkFailed(String),

    #[error("download cancelled")]
    Cancelled,
}
