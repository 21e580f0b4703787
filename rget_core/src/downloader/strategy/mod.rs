pub mod download_strategy;
pub mod ranged_download_strategy;
