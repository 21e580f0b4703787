use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::mpsc;

use super::observer::ProgressObserver;
use super::snapshot::{ChunkSnapshot, ProgressSnapshot};
use crate::types::types::ProgressEvent;

/// EMA smoothing factor. 0.3 = responsive but stable.
const EMA_ALPHA: f64 = 0.3;

/// Internal per-chunk tracking (purely data, no UI).
struct ChunkProgress {
    bytes_downloaded: u64,
    total_bytes: u64,
    speed: f64,
    last_update: Instant,
}

/// Consumes `Result<ProgressEvent, String>` from the download channel,
/// aggregates progress into `ProgressSnapshot`s, and fans out to all
/// registered observers.
///
/// Chunks are keyed by their sequence index, so snapshots always list them
/// in ascending offset order regardless of completion order.
///
/// | Channel message         | Observer method called         |
/// |-------------------------|--------------------------------|
/// | `Ok(ProgressEvent)`     | `on_progress(&snapshot)`       |
/// | `Err(String)`           | `on_error(&msg)` then stops    |
/// | Channel closed (no err) | `on_complete(&final_snapshot)` |
pub struct ProgressNotifier {
    observers: Vec<Box<dyn ProgressObserver>>,
    chunks: BTreeMap<usize, ChunkProgress>,
    start_time: Instant,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            chunks: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }

    /// Register an observer. Must be called before `run()`.
    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// Consume progress messages until the channel closes or an error arrives.
    pub async fn run(mut self, mut progress_rx: mpsc::Receiver<Result<ProgressEvent, String>>) {
        while let Some(msg) = progress_rx.recv().await {
            match msg {
                Ok(ev) => {
                    let snapshot = self.handle_event(ev);
                    for observer in &self.observers {
                        observer.on_progress(&snapshot).await;
                    }
                }
                Err(error) => {
                    for observer in &self.observers {
                        observer.on_error(&error).await;
                    }
                    return; // stop processing after error
                }
            }
        }
        // Channel closed cleanly: all senders dropped, no error received
        self.finish().await;
    }

    /// Fold a single progress event into the aggregation state.
    fn handle_event(&mut self, ev: ProgressEvent) -> ProgressSnapshot {
        let now = Instant::now();

        let chunk = self.chunks.entry(ev.chunk_index).or_insert(ChunkProgress {
            bytes_downloaded: 0,
            total_bytes: ev.total_bytes.unwrap_or(0),
            speed: 0.0,
            last_update: now,
        });

        chunk.bytes_downloaded += ev.bytes_delta;
        if chunk.total_bytes == 0 {
            if let Some(tb) = ev.total_bytes {
                chunk.total_bytes = tb;
            }
        }

        // EMA over the instantaneous rate since the last event for this chunk
        let elapsed = now.duration_since(chunk.last_update).as_secs_f64();
        if elapsed > 0.0 {
            let instant_speed = ev.bytes_delta as f64 / elapsed;
            chunk.speed = EMA_ALPHA * instant_speed + (1.0 - EMA_ALPHA) * chunk.speed;
            chunk.last_update = now;
        }

        self.build_snapshot()
    }

    fn build_snapshot(&self) -> ProgressSnapshot {
        let total_bytes: u64 = self.chunks.values().map(|c| c.total_bytes).sum();
        let total_downloaded: u64 = self.chunks.values().map(|c| c.bytes_downloaded).sum();
        let combined_speed: f64 = self.chunks.values().map(|c| c.speed).sum();
        let remaining = total_bytes.saturating_sub(total_downloaded);
        let eta = if combined_speed > 0.0 {
            remaining as f64 / combined_speed
        } else {
            0.0
        };

        let chunk_snapshots: Vec<ChunkSnapshot> = self
            .chunks
            .iter()
            .map(|(&index, c)| {
                let rem = c.total_bytes.saturating_sub(c.bytes_downloaded);
                let chunk_eta = if c.speed > 0.0 { rem as f64 / c.speed } else { 0.0 };
                ChunkSnapshot {
                    chunk_index: index,
                    bytes_downloaded: c.bytes_downloaded,
                    total_bytes: c.total_bytes,
                    speed: c.speed,
                    eta_secs: chunk_eta,
                }
            })
            .collect();

        ProgressSnapshot {
            chunks: chunk_snapshots,
            total_bytes_downloaded: total_downloaded,
            total_bytes,
            speed: combined_speed,
            eta_secs: eta,
            done: false,
        }
    }

    /// Finalize: build the last snapshot with `done = true` and the average
    /// speed over the whole download, then notify all observers.
    async fn finish(self) {
        let elapsed = self.start_time.elapsed();
        let total_downloaded: u64 = self.chunks.values().map(|c| c.bytes_downloaded).sum();
        let avg_speed = if elapsed.as_secs_f64() > 0.0 {
            total_downloaded as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let mut final_snapshot = self.build_snapshot();
        final_snapshot.done = true;
        final_snapshot.speed = avg_speed;
        final_snapshot.eta_secs = 0.0;

        for observer in &self.observers {
            observer.on_complete(&final_snapshot).await;
        }
    }
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::new()
    }
}
