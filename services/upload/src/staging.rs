//! Scratch-file staging for uploads and tool outputs.

use crate::error::{PipelineError, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Exclusive handle to a local scratch file.
///
/// The file is deleted when the handle is dropped, so an aborted run never
/// leaves it behind. Removal on drop is a blocking unlink on the dropping
/// thread; regular exits go through [`cleanup`] instead.
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
}

impl StagedArtifact {
    /// Take ownership of `path`; whatever ends up there is deleted with the handle
    pub fn claim(path: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            path: TempPath::try_from_path(path.into())?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the backing file
    pub async fn size(&self) -> io::Result<u64> {
        Ok(tokio::fs::metadata(self.path()).await?.len())
    }

    /// Delete the backing file now. A file that was never created is not an error.
    pub fn remove(self) -> io::Result<()> {
        match self.path.close() {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Writes inbound streams to uniquely named files in a scratch directory
#[derive(Debug, Clone)]
pub struct StagingStore {
    dir: PathBuf,
}

impl StagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `body` to a fresh scratch file and rewind it.
    ///
    /// Errors yielded by `body` are returned unchanged; the partial file is
    /// removed before returning.
    #[instrument(skip(self, body), fields(dir = %self.dir.display()))]
    pub async fn stage<S>(&self, video_id: Uuid, mut body: S) -> Result<StagedArtifact>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let named = tempfile::Builder::new()
            .prefix(&format!("upload-{video_id}-"))
            .suffix(".mp4")
            .tempfile_in(&self.dir)
            .map_err(|e| PipelineError::storage("Failed to create scratch file", e))?;

        let (file, path) = named.into_parts();
        let artifact = StagedArtifact { path };
        let mut file = tokio::fs::File::from_std(file);

        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::storage("Failed to write scratch file", e))?;
            written += chunk.len() as u64;
        }

        file.flush()
            .await
            .map_err(|e| PipelineError::storage("Failed to flush scratch file", e))?;
        file.seek(io::SeekFrom::Start(0))
            .await
            .map_err(|e| PipelineError::storage("Failed to rewind scratch file", e))?;

        debug!(
            path = %artifact.path().display(),
            size_bytes = written,
            "Upload staged"
        );
        metrics::counter!("upload.bytes.staged").increment(written);

        Ok(artifact)
    }
}

/// Remove artifacts on the blocking pool, logging rather than failing on errors
pub async fn cleanup(artifacts: Vec<StagedArtifact>) {
    let removal = tokio::task::spawn_blocking(move || {
        for artifact in artifacts {
            let path = artifact.path().to_path_buf();
            if let Err(e) = artifact.remove() {
                warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
            }
        }
    });

    if let Err(e) = removal.await {
        warn!(error = %e, "Scratch cleanup task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: Vec<Result<Bytes>>) -> impl Stream<Item = Result<Bytes>> + Unpin {
        stream::iter(parts)
    }

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_stage_writes_full_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path());
        let video_id = Uuid::new_v4();

        let artifact = store
            .stage(
                video_id,
                chunks(vec![Ok(Bytes::from_static(b"ftyp")), Ok(Bytes::from_static(b"mdat"))]),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"ftypmdat");
        assert_eq!(artifact.size().await.unwrap(), 8);
        let name = artifact.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("upload-{video_id}-")));
    }

    #[tokio::test]
    async fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path());

        let artifact = store
            .stage(Uuid::new_v4(), chunks(vec![Ok(Bytes::from_static(b"data"))]))
            .await
            .unwrap();
        let path = artifact.path().to_path_buf();
        assert!(path.exists());

        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path());

        let err = store
            .stage(
                Uuid::new_v4(),
                chunks(vec![
                    Ok(Bytes::from_static(b"partial")),
                    Err(PipelineError::Validation("too large".into())),
                ]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_same_video_gets_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::new(dir.path());
        let video_id = Uuid::new_v4();

        let a = store.stage(video_id, chunks(vec![])).await.unwrap();
        let b = store.stage(video_id, chunks(vec![])).await.unwrap();

        assert_ne!(a.path(), b.path());
        cleanup(vec![a, b]).await;
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_is_storage_error() {
        let store = StagingStore::new("/nonexistent/scratch/dir");
        let err = store
            .stage(Uuid::new_v4(), chunks(vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "storage");
    }

    #[test]
    fn test_remove_of_never_created_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagedArtifact::claim(dir.path().join("never-written.processing")).unwrap();
        tokio_test::assert_ok!(artifact.remove());
    }
}
