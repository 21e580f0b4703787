pub mod chunk_fetcher;
pub mod http_downloader;
pub mod preallocate;
pub mod strategy;
