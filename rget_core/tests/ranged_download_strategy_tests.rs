use std::path::PathBuf;
use std::time::Duration;

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use rget_core::downloader::strategy::download_strategy::DownloadStrategy;
use rget_core::downloader::strategy::ranged_download_strategy::{
    plan_chunks, RangedDownloadStrategy,
};
use rget_core::types::types::{ChunkState, DownloadError, DownloadJob};

/// Generates deterministic test data: each byte = (offset % 251) as u8.
fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn make_job(url: &str, dest: PathBuf, total_size: u64, chunk_size: u64) -> DownloadJob {
    DownloadJob {
        url: url.to_string(),
        dest_path: dest,
        total_size,
        chunk_size,
        concurrency: 3,
        max_retries: 3,
    }
}

/// A wiremock responder that honors Range requests by slicing its body.
struct RangeResponder {
    body: Vec<u8>,
}

/// Like `RangeResponder`, but answers 500 for the range starting at
/// `fail_from`: one chunk fails, its siblings succeed.
struct FailOneRangeResponder {
    body: Vec<u8>,
    fail_from: u64,
}

/// Parses a Range header like "bytes=1024-2047".
fn parse_range(header: &str, body_len: usize) -> Option<(usize, usize)> {
    let s = header.strip_prefix("bytes=")?;
    let (start, end) = s.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    Some((start, end.min(body_len - 1)))
}

fn range_of(request: &Request, body_len: usize) -> Option<(usize, usize)> {
    let header = request.headers.get(&reqwest::header::RANGE)?;
    parse_range(header.to_str().ok()?, body_len)
}

impl wiremock::Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match range_of(request, self.body.len()) {
            Some((start, end)) => ResponseTemplate::new(206)
                .set_body_bytes(self.body[start..=end].to_vec())
                .insert_header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, end, self.body.len()),
                ),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

/// Like `RangeResponder`, but delays the response for the range starting at
/// `stall_from` far past any reasonable attempt deadline, so only that chunk
/// burns through its transport retries.
struct StallOneRangeResponder {
    body: Vec<u8>,
    stall_from: u64,
}

impl wiremock::Respond for StallOneRangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match range_of(request, self.body.len()) {
            Some((start, end)) => {
                let template = ResponseTemplate::new(206)
                    .set_body_bytes(self.body[start..=end].to_vec())
                    .insert_header(
                        "Content-Range",
                        format!("bytes {}-{}/{}", start, end, self.body.len()),
                    );
                if start as u64 == self.stall_from {
                    template.set_delay(Duration::from_secs(60))
                } else {
                    template
                }
            }
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

impl wiremock::Respond for FailOneRangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match range_of(request, self.body.len()) {
            Some((start, _)) if start as u64 == self.fail_from => ResponseTemplate::new(500),
            Some((start, end)) => ResponseTemplate::new(206)
                .set_body_bytes(self.body[start..=end].to_vec())
                .insert_header(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, end, self.body.len()),
                ),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        }
    }
}

// ---------------------------------------------------------------
// plan_chunks
// ---------------------------------------------------------------

#[test]
fn test_plan_chunks_clamps_last_chunk() {
    let chunks = plan_chunks(10_000, 4_000);

    assert_eq!(chunks.len(), 3);
    assert_eq!((chunks[0].offset, chunks[0].length), (0, 4_000));
    assert_eq!((chunks[1].offset, chunks[1].length), (4_000, 4_000));
    assert_eq!((chunks[2].offset, chunks[2].length), (8_000, 2_000));
}

#[test]
fn test_plan_chunks_partitions_exactly() {
    for (total_size, chunk_size) in [
        (1u64, 1u64),
        (1, 1024),
        (1023, 1024),
        (1024, 1024),
        (1025, 1024),
        (4096, 1024),
        (10_000, 3_333),
        (1_000_000, 65_536),
    ] {
        let chunks = plan_chunks(total_size, chunk_size);

        let expected_count = total_size.div_ceil(chunk_size) as usize;
        assert_eq!(chunks.len(), expected_count, "S={} C={}", total_size, chunk_size);

        // Contiguous, non-overlapping, covering [0, total_size) exactly.
        let mut next_offset = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.offset, next_offset, "S={} C={}", total_size, chunk_size);
            assert!(chunk.length > 0);
            assert_eq!(chunk.state, ChunkState::Pending);
            next_offset += chunk.length;
        }
        assert_eq!(next_offset, total_size);

        // Every chunk but the last is full-size.
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.length, chunk_size);
        }
        let expected_last = total_size - chunk_size * (expected_count as u64 - 1);
        assert_eq!(chunks.last().unwrap().length, expected_last);
    }
}

#[test]
fn test_plan_chunks_zero_size_yields_no_chunks() {
    assert!(plan_chunks(0, 1024).is_empty());
}

// ---------------------------------------------------------------
// preprocess
// ---------------------------------------------------------------

#[tokio::test]
async fn test_preprocess_preallocates_and_plans() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    let job = make_job("http://unused", dest.clone(), 10_000, 4_000);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();

    let metadata = std::fs::metadata(&dest).unwrap();
    assert_eq!(metadata.len(), 10_000);

    let chunks = strategy.chunks().read().await;
    assert_eq!(chunks.len(), 3);
    for chunk in chunks.values() {
        assert_eq!(chunk.state, ChunkState::Pending);
    }
}

#[tokio::test]
async fn test_preprocess_failure_starts_no_workers() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("missing_dir").join("out.bin");

    // The URL is unreachable, but preprocess never touches the network: the
    // filesystem failure must surface before any request is attempted.
    let job = make_job("http://127.0.0.1:1", dest.clone(), 10_000, 4_000);
    let strategy = RangedDownloadStrategy::builder(job).build();

    let result = strategy.preprocess().await;
    assert!(matches!(result.unwrap_err(), DownloadError::Disk(_)));
    assert!(!dest.exists());
}

// ---------------------------------------------------------------
// download
// ---------------------------------------------------------------

#[tokio::test]
async fn test_download_assembles_file_from_many_chunks() {
    let body = generate_test_data(10_000);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    // 10 chunks through 3 workers: chunk count independent of concurrency.
    let job = make_job(&server.uri(), dest.clone(), 10_000, 1_000);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();
    strategy.download().await.unwrap();
    strategy.postprocess().await.unwrap();

    let content = std::fs::read(&dest).unwrap();
    assert_eq!(content.len(), 10_000);
    assert_eq!(content, body, "every byte range written exactly once, in place");

    let chunks = strategy.chunks().read().await;
    for chunk in chunks.values() {
        assert_eq!(chunk.state, ChunkState::Finished);
        assert_eq!(chunk.written, chunk.length);
    }
}

#[tokio::test]
async fn test_download_single_chunk_smaller_than_chunk_size() {
    let body = generate_test_data(100);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(RangeResponder { body: body.clone() })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("small.bin");

    let job = make_job(&server.uri(), dest.clone(), 100, 1024 * 1024);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();
    strategy.download().await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_download_no_chunks_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("empty.bin");

    let job = make_job("http://unused", dest.clone(), 0, 1024);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();
    strategy.download().await.unwrap();

    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
}

#[tokio::test]
async fn test_one_failed_chunk_fails_job_and_removes_file() {
    let body = generate_test_data(10_000);
    let server = MockServer::start().await;

    // Chunk 2 of 3 (offset 4000) answers 500; its siblings succeed.
    Mock::given(method("GET"))
        .respond_with(FailOneRangeResponder {
            body: body.clone(),
            fail_from: 4_000,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    let job = make_job(&server.uri(), dest.clone(), 10_000, 4_000);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();
    let result = strategy.download().await;

    match result.unwrap_err() {
        DownloadError::UnexpectedStatus(status) => assert_eq!(status.as_u16(), 500),
        other => panic!("expected the failing chunk's cause, got {:?}", other),
    }
    assert!(!dest.exists(), "a file with a missing range must be deleted");

    let chunks = strategy.chunks().read().await;
    assert_eq!(chunks.get(&1).unwrap().state, ChunkState::Failed);
    assert_eq!(chunks.get(&0).unwrap().state, ChunkState::Finished);
    assert_eq!(chunks.get(&2).unwrap().state, ChunkState::Finished);
}

#[tokio::test]
async fn test_retries_exhausted_fails_job_and_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    // Unreachable host: every chunk burns through its transport retries.
    let job = DownloadJob {
        url: "http://127.0.0.1:1".to_string(),
        dest_path: dest.clone(),
        total_size: 2_048,
        chunk_size: 1_024,
        concurrency: 2,
        max_retries: 2,
    };
    let strategy = RangedDownloadStrategy::builder(job)
        .with_attempt_timeout(Duration::from_secs(2))
        .build();

    strategy.preprocess().await.unwrap();
    assert!(dest.exists());

    let result = strategy.download().await;

    match result.unwrap_err() {
        DownloadError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_one_chunk_exhausting_retries_fails_job_and_removes_file() {
    let body = generate_test_data(10_000);
    let server = MockServer::start().await;

    // Chunk 2 of 3 (offset 4000) never answers within the attempt deadline;
    // its siblings succeed normally.
    Mock::given(method("GET"))
        .respond_with(StallOneRangeResponder {
            body: body.clone(),
            stall_from: 4_000,
        })
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    let job = make_job(&server.uri(), dest.clone(), 10_000, 4_000);
    let strategy = RangedDownloadStrategy::builder(job)
        .with_attempt_timeout(Duration::from_millis(200))
        .build();

    strategy.preprocess().await.unwrap();
    let result = strategy.download().await;

    // The reported error is the stalled chunk's cause, not a generic one.
    match result.unwrap_err() {
        DownloadError::RetriesExhausted { index, attempts, last } => {
            assert_eq!(index, 1);
            assert_eq!(attempts, 3);
            assert!(matches!(*last, DownloadError::Timeout(_)));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert!(!dest.exists(), "a file with a missing range must be deleted");

    let chunks = strategy.chunks().read().await;
    assert_eq!(chunks.get(&1).unwrap().state, ChunkState::Failed);
    assert_eq!(chunks.get(&0).unwrap().state, ChunkState::Finished);
    assert_eq!(chunks.get(&2).unwrap().state, ChunkState::Finished);
}

// ---------------------------------------------------------------
// stop / pause / postprocess
// ---------------------------------------------------------------

#[tokio::test]
async fn test_stop_cancels_token() {
    let dir = tempfile::tempdir().unwrap();
    let job = make_job("http://unused", dir.path().join("out.bin"), 1_024, 1_024);
    let strategy = RangedDownloadStrategy::builder(job).build();

    assert!(!strategy.cancel_token().is_cancelled());
    strategy.stop().await.unwrap();
    assert!(strategy.cancel_token().is_cancelled());
}

#[tokio::test]
async fn test_pause_cancels_token() {
    let dir = tempfile::tempdir().unwrap();
    let job = make_job("http://unused", dir.path().join("out.bin"), 1_024, 1_024);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.pause().await.unwrap();
    assert!(strategy.cancel_token().is_cancelled());
}

#[tokio::test]
async fn test_download_after_pause_is_cancelled_and_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.bin");

    // No resume path: a paused strategy behaves exactly like a stopped one.
    // The workers observe the token before sending, so no request goes out.
    let job = make_job("http://127.0.0.1:1", dest.clone(), 2_048, 1_024);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();
    strategy.pause().await.unwrap();

    let result = strategy.download().await;
    assert!(matches!(result.unwrap_err(), DownloadError::Cancelled));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_postprocess_fails_if_chunk_not_finished() {
    let dir = tempfile::tempdir().unwrap();
    let job = make_job("http://unused", dir.path().join("out.bin"), 2_048, 1_024);
    let strategy = RangedDownloadStrategy::builder(job).build();

    strategy.preprocess().await.unwrap();

    let result = strategy.postprocess().await;
    assert!(result.is_err(), "postprocess must reject pending chunks");
}
