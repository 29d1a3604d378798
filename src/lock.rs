//! Advisory file locking, grounded in `reprise.lock.file_lock`: try a
//! non-blocking exclusive lock first (logging if it falls back to
//! blocking), release on drop.

use std::path::Path;

use fs4::tokio::AsyncFileExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type LockResult<T> = Result<T, LockError>;

/// A held exclusive lock on a file; released when dropped.
pub struct FileLock {
    file: tokio::fs::File,
}

/// Acquires an exclusive lock on `path`, creating it if necessary.
/// Attempts a non-blocking lock first; if another process holds it,
/// falls back to a blocking wait (logged at debug level), matching the
/// original's `fcntl.flock(LOCK_EX | LOCK_NB)` then blocking fallback.
pub async fn file_lock(path: &Path) -> LockResult<FileLock> {
    let std_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.display().to_string(),
            source,
        })?;
    let file = tokio::fs::File::from_std(std_file);

    if file.try_lock_exclusive().is_err() {
        tracing::debug!(path = %path.display(), "lock contended, waiting");
        file.lock_exclusive()
            .await
            .map_err(|source| LockError::Lock {
                path: path.display().to_string(),
                source,
            })?;
    }

    Ok(FileLock { file })
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Best-effort: an explicit unlock is a courtesy, the OS also
        // releases the lock once the fd closes at drop time regardless.
        let _ = AsyncFileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_lock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let lock = file_lock(&path).await.unwrap();
        drop(lock);
        // Re-acquiring after drop should not hang.
        let lock2 = file_lock(&path).await.unwrap();
        drop(lock2);
    }
}
