use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::types::types::{Chunk, ChunkState, DownloadError, ProbeResult};

/// Sends a header-only request to learn the total file size and the server's
/// content identifier. The `Content-Length` header is parsed directly rather
/// than going through the response body's size hint, which is unreliable for
/// HEAD responses.
///
/// The coordinator never calls this; callers probe first and bake the size
/// into the `DownloadJob`.
pub async fn probe_url(client: &Client, url: &str) -> Result<ProbeResult, DownloadError> {
    let response = client.head(url).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::UnexpectedStatus(status));
    }

    let total_size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(DownloadError::MissingContentLength)?;

    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    Ok(ProbeResult { total_size, etag })
}

/// Downloads a single chunk of the file into its slot of the destination.
///
/// Sends `Range: bytes={offset}-{offset+length-1}` and expects 206 Partial
/// Content; any other status fails the chunk immediately, with no fallback
/// to a full-file download and no retry consumed.
///
/// Each attempt runs under its own wall-clock deadline, independent of other
/// chunks. Transport-level failures (the request never produced a response)
/// are retried up to `max_retries` total attempts with exponential backoff;
/// once a response is in hand, any copy failure is final for the chunk.
///
/// The worker opens its own write handle and seeks it to `offset`, so no
/// cursor is shared across workers. Writes are capped at `length` bytes:
/// bytes outside `[offset, offset + length)` are never touched, even when a
/// server ignores the Range header and streams the whole file.
pub async fn fetch_chunk(
    chunk: Chunk,
    client: &Client,
    url: &str,
    dest_path: &Path,
    max_retries: usize,
    attempt_timeout: Duration,
    cancel_token: CancellationToken,
    on_progress: impl Fn(u64),
) -> Result<Chunk, DownloadError> {
    let mut chunk = chunk;
    let mut attempts = 0usize;
    let max_attempts = max_retries.max(1);

    chunk.state = ChunkState::Downloading;

    let range_start = chunk.offset;
    let range_end = chunk.offset + chunk.length - 1;

    loop {
        if cancel_token.is_cancelled() {
            chunk.state = ChunkState::Failed;
            return Err(DownloadError::Cancelled);
        }

        attempts += 1;
        let deadline = Instant::now() + attempt_timeout;

        log::debug!(
            "[fetch_chunk] chunk={}: attempt {}/{}, Range: bytes={}-{}",
            chunk.index,
            attempts,
            max_attempts,
            range_start,
            range_end
        );

        let request = client
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", range_start, range_end));

        // Only the request phase is retryable. Timeouts and send errors here
        // mean no response arrived, which is a transport-level failure.
        let last = match timeout_at(deadline, request.send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status != reqwest::StatusCode::PARTIAL_CONTENT {
                    chunk.state = ChunkState::Failed;
                    return Err(DownloadError::UnexpectedStatus(status));
                }

                // The same deadline covers the body copy; past this point a
                // failure is final for the chunk, exactly one slot of the
                // destination is in an unknown state and must be refetched
                // by a fresh job.
                let copied = timeout_at(
                    deadline,
                    write_body(
                        response,
                        dest_path,
                        chunk.offset,
                        chunk.length,
                        &cancel_token,
                        &on_progress,
                    ),
                )
                .await;

                return match copied {
                    Ok(Ok(written)) => {
                        chunk.written = written;
                        chunk.state = ChunkState::Finished;
                        log::debug!(
                            "[fetch_chunk] chunk={}: wrote {} bytes at offset {}",
                            chunk.index,
                            written,
                            chunk.offset
                        );
                        Ok(chunk)
                    }
                    Ok(Err(err)) => {
                        chunk.state = ChunkState::Failed;
                        Err(err)
                    }
                    Err(_) => {
                        chunk.state = ChunkState::Failed;
                        Err(DownloadError::Timeout(attempt_timeout))
                    }
                };
            }
            Ok(Err(err)) => DownloadError::Network(err),
            Err(_) => DownloadError::Timeout(attempt_timeout),
        };

        if attempts >= max_attempts {
            chunk.state = ChunkState::Failed;
            return Err(DownloadError::RetriesExhausted {
                index: chunk.index,
                attempts,
                last: Box::new(last),
            });
        }

        log::warn!(
            "[fetch_chunk] chunk={}: attempt {} failed ({}), retrying",
            chunk.index,
            attempts,
            last
        );

        // Bounded exponential backoff: 100ms, 200ms, 400ms, ...
        let delay_ms = 100u64 * (1u64 << attempts.min(5));
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// Streams the response body into `[offset, offset + length)` of the
/// destination through a freshly opened, independently seeked handle.
async fn write_body(
    response: reqwest::Response,
    dest_path: &Path,
    offset: u64,
    length: u64,
    cancel_token: &CancellationToken,
    on_progress: &impl Fn(u64),
) -> Result<u64, DownloadError> {
    let file = OpenOptions::new()
        .write(true)
        .open(dest_path)
        .await
        .map_err(DownloadError::Disk)?;
    let mut writer = BufWriter::with_capacity(256 * 1024, file);
    writer
        .seek(SeekFrom::Start(offset))
        .await
        .map_err(DownloadError::Disk)?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(next) = stream.next().await {
        if cancel_token.is_cancelled() {
            let _ = writer.flush().await;
            return Err(DownloadError::Cancelled);
        }

        // A mid-stream transport error is final: part of the range may
        // already be on disk, so the chunk cannot simply be resent.
        let bytes = next?;
        if bytes.is_empty() {
            continue;
        }

        // Cap at the remaining bytes of this chunk's slot so a server that
        // ignores the Range header cannot write past `offset + length`.
        let remaining = length - written;
        let usable = (bytes.len() as u64).min(remaining) as usize;

        writer
            .write_all(&bytes[..usable])
            .await
            .map_err(DownloadError::Disk)?;
        written += usable as u64;
        on_progress(usable as u64);

        if written == length {
            break;
        }
    }

    writer.flush().await.map_err(DownloadError::Disk)?;

    if written < length {
        return Err(DownloadError::ShortBody {
            written,
            expected: length,
        });
    }

    Ok(written)
}
