use super::{check_fresh, StateStore};
use async_trait::async_trait;
use rollback_core::{CorrelationId, RollbackAttempt, StoreError};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// One JSON document per attempt in a directory
///
/// Writes go to a temporary file in the same directory and are renamed
/// into place, so a crash never leaves a torn record behind.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: Arc<PathBuf>,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir: Arc::new(dir) })
    }

    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(dir: &Path, id: CorrelationId) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    fn read(path: &Path) -> Result<Option<RollbackAttempt>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(dir: &Path, attempt: &RollbackAttempt) -> Result<(), StoreError> {
        let path = Self::path_for(dir, attempt.correlation_id);
        check_fresh(Self::read(&path)?.as_ref(), attempt)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, attempt)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn list_sync(dir: &Path) -> Result<Vec<RollbackAttempt>, StoreError> {
        let mut attempts = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(Some(attempt)) => attempts.push(attempt),
                Ok(None) => {}
                Err(StoreError::Serialization(e)) => {
                    tracing::error!(path = %path.display(), error = %e, "skipping unreadable attempt record");
                }
                Err(e) => return Err(e),
            }
        }
        attempts.sort_by_key(|a| (a.created_at, a.correlation_id));
        Ok(attempts)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn put(&self, attempt: &RollbackAttempt) -> Result<(), StoreError> {
        let attempt = attempt.clone();
        self.blocking(move |dir| Self::write(dir, &attempt)).await
    }

    async fn get(&self, id: CorrelationId) -> Result<Option<RollbackAttempt>, StoreError> {
        self.blocking(move |dir| Self::read(&Self::path_for(dir, id))).await
    }

    async fn list(&self) -> Result<Vec<RollbackAttempt>, StoreError> {
        self.blocking(Self::list_sync).await
    }

    async fn remove(&self, id: CorrelationId) -> Result<bool, StoreError> {
        self.blocking(move |dir| match std::fs::remove_file(Self::path_for(dir, id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }
}
