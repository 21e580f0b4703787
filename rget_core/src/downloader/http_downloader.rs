use std::sync::Arc;

use tokio::sync::mpsc;

use crate::downloader::strategy::download_strategy::DownloadStrategy;
use crate::progress::notifier::ProgressNotifier;
use crate::progress::observer::ProgressObserver;
use crate::types::types::DownloadError;

/// Capacity of the worker → notifier progress channel. Progress sends are
/// lossy `try_send`s, so the capacity never blocks a worker.
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Drives a `DownloadStrategy` through its full lifecycle and fans progress
/// out to registered observers.
///
/// One call to `download()` is the whole job: it either leaves the complete
/// file at the destination or returns the first failure after the strategy
/// has cleaned up the incomplete file. Per job state machine:
/// Idle → Preallocating (preprocess) → Downloading → Succeeded | Failed.
pub struct HttpDownloader {
    strategy: Arc<dyn DownloadStrategy>,
    notifier: ProgressNotifier,
}

impl HttpDownloader {
    pub fn new(strategy: Arc<dyn DownloadStrategy>) -> Self {
        Self {
            strategy,
            notifier: ProgressNotifier::new(),
        }
    }

    /// Register a progress observer. Must be called before `download()`.
    pub fn add_observer(&mut self, observer: Box<dyn ProgressObserver>) {
        self.notifier.add_observer(observer);
    }

    /// Run preprocess → download → postprocess.
    ///
    /// The progress channel is created here and its sender injected into the
    /// strategy; the notifier drains the receiver on a background task until
    /// every sender is gone. Clearing the strategy's sender after the phases
    /// finish is what closes the channel, so the notifier is always joined
    /// before this returns and observers never fire after `download()`.
    pub async fn download(&mut self) -> Result<(), DownloadError> {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        self.strategy.set_progress_tx(progress_tx.clone());

        // Move the notifier into its task, leaving a fresh one behind so the
        // downloader stays usable.
        let notifier = std::mem::replace(&mut self.notifier, ProgressNotifier::new());
        let notifier_handle = tokio::spawn(notifier.run(progress_rx));

        let result = self.run_phases().await;

        // Whatever phase failed, the notifier hears about it through the same
        // channel the workers use, so observers get exactly one terminal call.
        if let Err(err) = &result {
            let _ = progress_tx.send(Err(err.to_string())).await;
        }
        drop(progress_tx);

        self.strategy.clear_progress_tx();
        let _ = notifier_handle.await;

        result
    }

    async fn run_phases(&self) -> Result<(), DownloadError> {
        self.strategy.preprocess().await?;
        self.strategy.download().await?;
        self.strategy.postprocess().await
    }

    pub async fn stop(&self) -> Result<(), DownloadError> {
        self.strategy.stop().await
    }

    pub async fn pause(&self) -> Result<(), DownloadError> {
        self.strategy.pause().await
    }
}
