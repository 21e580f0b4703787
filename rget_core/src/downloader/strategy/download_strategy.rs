use tokio::sync::mpsc;

use crate::types::types::{DownloadError, ProgressEvent};
use async_trait::async_trait;

#[async_trait]
pub trait DownloadStrategy: Send + Sync {
    /// Inject the progress sender before calling `download()`.
    /// The `HttpDownloader` calls this internally; callers never touch the channel.
    fn set_progress_tx(&self, tx: mpsc::Sender<Result<ProgressEvent, String>>);

    /// Drop the progress sender so the notifier channel closes after download.
    fn clear_progress_tx(&self);

    /// Set up everything workers rely on. For a ranged download this plans
    /// the chunks and preallocates the destination file; no worker starts
    /// until this succeeds.
    async fn preprocess(&self) -> Result<(), DownloadError>;

    /// Run all chunk workers and decide the all-or-nothing outcome.
    async fn download(&self) -> Result<(), DownloadError>;

    /// Ask the workers to stop at the next opportunity. Strategies without a
    /// resume path treat this as terminal, the same as `stop()`.
    async fn pause(&self) -> Result<(), DownloadError>;

    async fn stop(&self) -> Result<(), DownloadError>;

    /// Final consistency check after `download()` reports success.
    async fn postprocess(&self) -> Result<(), DownloadError>;
}
