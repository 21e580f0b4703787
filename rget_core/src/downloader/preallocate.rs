use std::path::Path;

use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::types::types::DownloadError;

/// Creates the destination file at exactly `size` bytes before any chunk is
/// written, so concurrent workers can seek and write without coordination.
///
/// The file is extended by writing a single zero byte at offset `size - 1`
/// rather than writing `size` zeros, which lets the filesystem keep the file
/// sparse. Any prior content at `path` is truncated. A `size` of 0 produces
/// a valid empty file.
pub async fn preallocate(path: &Path, size: u64) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(DownloadError::Disk)?;

    if size > 0 {
        file.seek(SeekFrom::Start(size - 1))
            .await
            .map_err(DownloadError::Disk)?;
        file.write_all(&[0]).await.map_err(DownloadError::Disk)?;
        file.flush().await.map_err(DownloadError::Disk)?;
    }

    Ok(())
}
