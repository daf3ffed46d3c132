//! File Store Management support (§4.9) — bounded, disk-backed upload
//! streaming. Bytes are never buffered whole in memory; the temporary
//! artifact is removed on every exit path (success handoff, cap
//! violation, or stream error).

use futures_core::Stream;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub filename: String,
}

/// Removes the path on drop unless `defuse`d. Covers the cancellation
/// exit path that a simple `match`-on-`Err` cannot: if the surrounding
/// future is dropped mid-upload (client disconnect), no `Err` branch
/// ever runs, but this guard's `Drop` still does.
struct CleanupGuard {
    path: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Consume a stream of raw byte chunks, writing them to a fresh
/// UUID-named file under `temp_dir`, enforcing `max_bytes`. The partial
/// file is removed on every exit path — a caller-supplied chunk error,
/// a cap violation, or the future being dropped outright (e.g. the
/// client disconnected mid-upload).
pub async fn receive_upload<S>(
    mut chunks: S,
    temp_dir: &Path,
    filename: &str,
    max_bytes: u64,
) -> Result<UploadedFile>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    tokio::fs::create_dir_all(temp_dir).await?;
    let file_id = Uuid::new_v4().to_string();
    let path = temp_dir.join(&file_id);
    let guard = CleanupGuard::new(path.clone());

    let size_bytes = write_chunks(&mut chunks, &path, max_bytes).await?;

    guard.defuse();
    Ok(UploadedFile {
        file_id,
        path,
        size_bytes,
        filename: filename.to_string(),
    })
}

async fn write_chunks<S>(chunks: &mut S, path: &Path, max_bytes: u64) -> Result<u64>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let mut file = File::create(path).await?;
    let mut written: u64 = 0;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(GatewayError::invalid_input(format!(
                "upload exceeds the {max_bytes}-byte cap"
            )));
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok(written)
}

/// Remove the on-disk artifact after it has been handed off to the
/// indexing pipeline, or on deletion of the owning file record.
pub async fn discard(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn writes_chunks_to_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = stream::iter(vec![Ok(b"hello ".to_vec()), Ok(b"world".to_vec())]);
        let uploaded = receive_upload(chunks, dir.path(), "notes.txt", 1_000).await.unwrap();
        assert_eq!(uploaded.size_bytes, 11);
        let contents = tokio::fs::read(&uploaded.path).await.unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn cap_violation_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = stream::iter(vec![Ok(vec![0u8; 10]), Ok(vec![0u8; 10])]);
        let err = receive_upload(chunks, dir.path(), "big.bin", 15).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none(), "partial file must be removed");
    }

    #[tokio::test]
    async fn stream_error_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let chunks = stream::iter(vec![
            Ok(b"ok".to_vec()),
            Err(GatewayError::UpstreamTransient("client disconnected".into())),
        ]);
        assert!(receive_upload(chunks, dir.path(), "f.bin", 1_000).await.is_err());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropping_the_upload_future_midstream_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Vec<u8>>>();
        let chunks = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

        let upload = receive_upload(chunks, dir.path(), "f.bin", 1_000);
        tokio::pin!(upload);

        // Poll once so the file is created, then send one chunk and drop
        // the future without ever reaching a terminal Ok/Err.
        tx.send(Ok(b"partial".to_vec())).unwrap();
        let _ = futures_util::poll!(&mut upload);
        drop(upload);
        drop(tx);

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none(), "cancelled upload must not leak its temp file");
    }

    #[tokio::test]
    async fn discard_is_idempotent_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(discard(&missing).await.is_ok());
    }
}
