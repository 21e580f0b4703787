use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use rget_core::downloader::chunk_fetcher::probe_url;
use rget_core::downloader::http_downloader::HttpDownloader;
use rget_core::downloader::strategy::ranged_download_strategy::{
    plan_chunks, RangedDownloadStrategy,
};
use rget_core::types::types::DownloadJob;

mod terminal_observer;
use terminal_observer::TerminalProgressObserver;

#[derive(Parser)]
#[command(name = "rget", about = "Parallel range-request downloader")]
struct Args {
    /// URL of the file to download
    #[arg(short, long)]
    url: String,

    /// Destination file path
    #[arg(short, long)]
    output: PathBuf,

    /// Number of concurrent download workers
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Attempts per chunk, counting the first try
    #[arg(short, long, default_value_t = 3)]
    retries: usize,

    /// Chunk size in bytes
    #[arg(short, long, default_value_t = 1024 * 1024)]
    chunk_size: u64,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(args.workers.max(1))
        .tcp_nodelay(true)
        .build()
        .expect("failed to build HTTP client");

    // Header-only probe: total size drives the chunk plan, the etag is
    // reported back to the user on success.
    let probe = match probe_url(&client, &args.url).await {
        Ok(probe) => probe,
        Err(e) => {
            eprintln!("Probe failed: {}", e);
            std::process::exit(1);
        }
    };

    let job = DownloadJob {
        url: args.url.clone(),
        dest_path: args.output,
        total_size: probe.total_size,
        chunk_size: args.chunk_size,
        concurrency: args.workers,
        max_retries: args.retries,
    };

    // The plan is deterministic, so the progress bars can be laid out
    // before the strategy runs.
    let planned = plan_chunks(probe.total_size, args.chunk_size);

    let strategy = Arc::new(
        RangedDownloadStrategy::builder(job)
            .with_client(client)
            .build(),
    );
    let mut downloader = HttpDownloader::new(strategy);
    downloader.add_observer(Box::new(TerminalProgressObserver::new(
        probe.total_size,
        &planned,
    )));

    println!("Downloading {} ({} bytes)", args.url, probe.total_size);
    let start = Instant::now();

    match downloader.download().await {
        Ok(()) => {
            println!("Download completed in {:.2}s", start.elapsed().as_secs_f64());
            match probe.etag {
                Some(etag) => println!("Content identifier (ETag): {}", etag),
                None => println!("Server reported no content identifier"),
            }
        }
        Err(e) => {
            eprintln!("Download failed: {}", e);
            std::process::exit(1);
        }
    }
}
