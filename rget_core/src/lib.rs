pub mod downloader;
pub mod progress;
pub mod types;
