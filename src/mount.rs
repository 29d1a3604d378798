//! Bind, device-node, and in-memory mount primitives.
//!
//! Grounded in `reprise.mount.filesystems` (`mount_nullfs`,
//! `mount_devfs`, `mount_tmpfs`) and `reprise.mount.Mountpoint`, whose
//! destructor forces an unmount.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::executor::{ExecOptions, Executor, ExecutorError};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount command failed: {0}")]
    Command(#[from] ExecutorError),
}

pub type MountResult<T> = Result<T, MountError>;

/// A live mount. Its destructor (via [`Mount::destroy`]) issues a
/// forced unmount; a second call is a no-op.
pub struct Mount {
    executor: Arc<Executor>,
    destination: PathBuf,
    destroyed: bool,
}

impl Mount {
    /// Wraps a mountpoint already observed to be mounted (used by the
    /// resource enumerator).
    pub fn from_existing(executor: Arc<Executor>, destination: PathBuf) -> Self {
        Self {
            executor,
            destination,
            destroyed: false,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Forced unmount. Idempotent.
    pub async fn destroy(&mut self) -> MountResult<()> {
        if self.destroyed {
            return Ok(());
        }
        let _ = self
            .executor
            .execute(
                "mount::umount",
                "umount",
                &["-f".to_string(), self.destination.display().to_string()],
                &ExecOptions::allow_failure(),
            )
            .await?;
        self.destroyed = true;
        Ok(())
    }
}

/// Bind-mounts `src` onto `dst` (nullfs), optionally read-only.
pub async fn mount_bind(
    executor: Arc<Executor>,
    src: &Path,
    dst: &Path,
    readonly: bool,
) -> MountResult<Mount> {
    let mut args = vec!["-t".to_string(), "nullfs".to_string()];
    if readonly {
        args.push("-o".to_string());
        args.push("ro".to_string());
    }
    args.push(src.display().to_string());
    args.push(dst.display().to_string());

    executor
        .execute("mount::bind", "mount", &args, &ExecOptions::default())
        .await
        .map_err(MountError::Command)?;

    Ok(Mount {
        executor,
        destination: dst.to_path_buf(),
        destroyed: false,
    })
}

/// Populates a minimal device-node filesystem using the jail ruleset
/// (ruleset 4, matching `devfsrules_jail` — hardcoded, as upstream
/// devfs rulesets are not dynamically discoverable here).
pub async fn mount_devfs(executor: Arc<Executor>, dst: &Path) -> MountResult<Mount> {
    let args = vec![
        "-t".to_string(),
        "devfs".to_string(),
        "-o".to_string(),
        "ruleset=4".to_string(),
        "dev".to_string(),
        dst.display().to_string(),
    ];

    executor
        .execute("mount::devfs", "mount", &args, &ExecOptions::default())
        .await
        .map_err(MountError::Command)?;

    Ok(Mount {
        executor,
        destination: dst.to_path_buf(),
        destroyed: false,
    })
}

/// An in-memory filesystem; a zero `byte_limit` means unbounded.
pub async fn mount_memfs(executor: Arc<Executor>, dst: &Path, byte_limit: u64) -> MountResult<Mount> {
    let args = vec![
        "-t".to_string(),
        "tmpfs".to_string(),
        "-o".to_string(),
        format!("size={byte_limit}"),
        "tmp".to_string(),
        dst.display().to_string(),
    ];

    executor
        .execute("mount::memfs", "mount", &args, &ExecOptions::default())
        .await
        .map_err(MountError::Command)?;

    Ok(Mount {
        executor,
        destination: dst.to_path_buf(),
        destroyed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn destroy_is_idempotent_without_a_real_mount() {
        let mut mount = Mount {
            executor: Arc::new(Executor::new()),
            destination: PathBuf::from("/nonexistent/reprise-test-mount"),
            destroyed: true,
        };
        mount.destroy().await.unwrap();
        assert!(mount.destroyed);
    }
}
