//! The persistent on-disk layout rooted at a single ZFS pool.
//!
//! Grounded in `reprise.workdir.Workdir`: autodetects the single ZFS
//! pool on the host (raising if there is none or more than one),
//! builds `<pool>/reprise`, and exposes accessors for the per-jail,
//! per-instance, and shared subtrees documented in spec.md §6's
//! on-disk layout tree.

use std::path::PathBuf;
use std::sync::Arc;

use crate::dataset::{get_zfs_pools, Dataset, DatasetError};
use crate::executor::Executor;

#[derive(Debug, thiserror::Error)]
pub enum WorkdirError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("no zfs pool found; pass --dataset explicitly")]
    NoPool,
    #[error("multiple zfs pools found ({0:?}); pass --dataset explicitly")]
    MultiplePools(Vec<String>),
}

pub type WorkdirResult<T> = Result<T, WorkdirError>;

/// The root of the persistent on-disk layout.
pub struct Workdir {
    root: Dataset,
}

impl Workdir {
    /// Autodetects the single ZFS pool on the host if `dataset` is
    /// `None`, then resolves/creates `<pool>/reprise`.
    pub async fn initialize(
        executor: Arc<Executor>,
        dataset: Option<String>,
    ) -> WorkdirResult<Self> {
        let root_name = match dataset {
            Some(name) => name,
            None => {
                let pools = get_zfs_pools(&executor).await?;
                match pools.len() {
                    0 => return Err(WorkdirError::NoPool),
                    1 => format!("{}/reprise", pools[0]),
                    _ => return Err(WorkdirError::MultiplePools(pools)),
                }
            }
        };

        let mut root = Dataset::new(executor, root_name);
        if !root.exists().await? {
            root.create(true, &[]).await?;
        }
        root.resolve_mountpoint().await?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Dataset {
        &self.root
    }

    /// `<root>/jails/<name>` — master templates.
    pub fn get_jail_master(&self, name: &str) -> Dataset {
        self.root.get_child("jails").get_child(name)
    }

    /// `<root>/instances/<name>` — per-job clones.
    pub fn get_jail_instance(&self, name: &str) -> Dataset {
        self.root.get_child("instances").get_child(name)
    }

    /// `<root>/packages/<abi>` — per-ABI package cache directories.
    pub fn get_jail_packages(&self, abi: &str) -> Dataset {
        self.root.get_child("packages").get_child(abi)
    }

    /// `<root>/ccache` — shared ccache roots (host).
    pub fn get_ccache(&self) -> Dataset {
        self.root.get_child("ccache")
    }

    /// `<root>/logs` — per-job log files, monotonically numbered.
    pub fn get_logs(&self) -> Dataset {
        self.root.get_child("logs")
    }

    pub fn fetch_lock_path(&self) -> WorkdirResult<PathBuf> {
        Ok(self.root.get_path()?.join("fetch.lock"))
    }

    pub fn jails_lock_path(&self) -> WorkdirResult<PathBuf> {
        Ok(self.root.get_path()?.join("jails.lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_children_use_root_relative_paths() {
        let executor = Arc::new(Executor::new());
        let mut root = Dataset::new(executor, "zroot/reprise");
        // Not mounted in this unit test; exercise the pure path logic.
        let jails = root.get_child("jails").get_child("140amd64");
        assert_eq!(jails.name(), "zroot/reprise/jails/140amd64");
        let _ = &mut root;
    }
}
