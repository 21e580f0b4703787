use std::collections::HashMap;

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use rget_core::progress::{format_bytes, ProgressObserver, ProgressSnapshot};
use rget_core::types::types::Chunk;

const CHUNK_BAR_TEMPLATE: &str = "{prefix:>9} {bar:25.green} {bytes:>10} / {total_bytes}";
const TOTAL_BAR_TEMPLATE: &str =
    "{prefix:>9} {bar:25.cyan} {bytes:>10} / {total_bytes} {bytes_per_sec:>12} eta {eta} {msg}";

/// Renders one indicatif bar per planned chunk plus an aggregate bar.
///
/// The chunk plan is known before the first byte arrives, so every bar is
/// created up front from the plan and only ever repositioned afterwards.
pub struct TerminalProgressObserver {
    chunk_bars: HashMap<usize, ProgressBar>,
    total_bar: ProgressBar,
}

impl TerminalProgressObserver {
    pub fn new(total_size: u64, chunks: &[Chunk]) -> Self {
        let multi = MultiProgress::new();

        let chunk_style = ProgressStyle::with_template(CHUNK_BAR_TEMPLATE)
            .unwrap()
            .progress_chars("##.");

        let mut chunk_bars = HashMap::with_capacity(chunks.len());
        for chunk in chunks {
            let bar = multi.add(ProgressBar::new(chunk.length.max(1)));
            bar.set_style(chunk_style.clone());
            bar.set_prefix(format!("chunk {}", chunk.index));
            chunk_bars.insert(chunk.index, bar);
        }

        let total_bar = multi.add(ProgressBar::new(total_size.max(1)));
        total_bar.set_style(
            ProgressStyle::with_template(TOTAL_BAR_TEMPLATE)
                .unwrap()
                .progress_chars("##."),
        );
        total_bar.set_prefix("total");

        // The bars keep the shared draw state alive; the MultiProgress
        // handle itself is no longer needed once they are registered.
        Self {
            chunk_bars,
            total_bar,
        }
    }
}

#[async_trait]
impl ProgressObserver for TerminalProgressObserver {
    async fn on_progress(&self, snapshot: &ProgressSnapshot) {
        for chunk in &snapshot.chunks {
            if let Some(bar) = self.chunk_bars.get(&chunk.chunk_index) {
                bar.set_position(chunk.bytes_downloaded);
            }
        }
        self.total_bar.set_position(snapshot.total_bytes_downloaded);
    }

    async fn on_complete(&self, snapshot: &ProgressSnapshot) {
        for bar in self.chunk_bars.values() {
            bar.finish();
        }
        self.total_bar.set_position(snapshot.total_bytes_downloaded);
        self.total_bar.finish_with_message(format!(
            "avg {}/s",
            format_bytes(snapshot.speed as u64)
        ));
    }

    async fn on_error(&self, error: &str) {
        for bar in self.chunk_bars.values() {
            bar.abandon();
        }
        self.total_bar.abandon_with_message(format!("failed: {}", error));
    }
}
