//! The sole cleanup entry point: given a prefix path, finds every live
//! sandbox and mount rooted under it and returns them ordered so that
//! depth-descending destruction is safe.
//!
//! Grounded in `reprise.resources.enumerate`: `enumerate_jails` (via
//! `jls -n --libxo json`) and `enumerate_mountpoints` (via `mount -p`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::executor::{ExecOptions, Executor, ExecutorError};
use crate::mount::Mount;
use crate::sandbox::{Sandbox, SandboxError};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// A resource discovered under a prefix path, ready for destruction.
pub enum Resource {
    Sandbox(Sandbox),
    Mount(Mount),
}

impl Resource {
    pub async fn destroy(self) -> ResourceResult<()> {
        match self {
            Resource::Sandbox(sandbox) => {
                sandbox.destroy().await?;
            }
            Resource::Mount(mut mount) => {
                mount.destroy().await?;
            }
        }
        Ok(())
    }
}

/// Parses `jls -n` output (`key=value ...` per line) for jail roots
/// under `prefix`, returning `(jid, path)` pairs.
fn parse_running_jails(lines: &[String], prefix: &Path) -> Vec<(u32, PathBuf)> {
    let mut out = Vec::new();
    for line in lines {
        let mut jid = None;
        let mut path = None;
        for field in line.split_whitespace() {
            if let Some(value) = field.strip_prefix("jid=") {
                jid = value.parse::<u32>().ok();
            } else if let Some(value) = field.strip_prefix("path=") {
                path = Some(PathBuf::from(value.trim_matches('"')));
            }
        }
        if let (Some(jid), Some(path)) = (jid, path) {
            if path.starts_with(prefix) {
                out.push((jid, path));
            }
        }
    }
    out
}

/// Parses `mount -p` output (`device mountpoint type options dump
/// pass`, tab-separated) for mounts under `prefix`.
fn parse_mounts(lines: &[String], prefix: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for line in lines {
        let mut columns = line.split('\t');
        let _device = columns.next();
        let Some(mountpoint) = columns.next() else {
            continue;
        };
        let path = PathBuf::from(mountpoint);
        if path.starts_with(prefix) && path != *prefix {
            out.push(path);
        }
    }
    out
}

/// Returns all live sandboxes rooted under `prefix` and all live
/// mounts destined under `prefix`, ordered: sandboxes first (to free
/// mount references), then mounts deepest-first.
pub async fn enumerate_resources(
    executor: Arc<Executor>,
    prefix: &Path,
) -> ResourceResult<Vec<Resource>> {
    let jail_lines = executor
        .execute(
            "resources::enumerate_jails",
            "jls",
            &["-n".to_string()],
            &ExecOptions::allow_failure(),
        )
        .await?
        .stdout;
    let mount_lines = executor
        .execute(
            "resources::enumerate_mounts",
            "mount",
            &["-p".to_string()],
            &ExecOptions::allow_failure(),
        )
        .await?
        .stdout;

    let mut jails = parse_running_jails(&jail_lines, prefix);
    jails.sort_by(|a, b| b.1.as_os_str().len().cmp(&a.1.as_os_str().len()));

    let mut mounts = parse_mounts(&mount_lines, prefix);
    mounts.sort_by(|a, b| b.as_os_str().len().cmp(&a.as_os_str().len()));

    let mut resources = Vec::new();
    for (jid, path) in jails {
        resources.push(Resource::Sandbox(Sandbox::from_existing(
            executor.clone(),
            jid,
            path,
        )));
    }
    for mountpoint in mounts {
        resources.push(Resource::Mount(Mount::from_existing(
            executor.clone(),
            mountpoint,
        )));
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_running_jails_filters_by_prefix() {
        let lines = vec![
            r#"jid=12 path="/reprise/instances/140amd64-111" host.hostname=reprise-builder"#
                .to_string(),
            r#"jid=13 path="/var/other" host.hostname=other"#.to_string(),
        ];
        let jails = parse_running_jails(&lines, Path::new("/reprise/instances/140amd64-111"));
        assert_eq!(jails.len(), 1);
        assert_eq!(jails[0].0, 12);
    }

    #[test]
    fn parse_mounts_excludes_prefix_itself() {
        let lines = vec![
            "devfs\t/reprise/instances/140amd64-111/dev\tdevfs\trw\t0\t0".to_string(),
            "zroot/reprise/instances/140amd64-111\t/reprise/instances/140amd64-111\tzfs\trw\t0\t0"
                .to_string(),
        ];
        let mounts = parse_mounts(&lines, Path::new("/reprise/instances/140amd64-111"));
        assert_eq!(mounts, vec![PathBuf::from("/reprise/instances/140amd64-111/dev")]);
    }

    #[test]
    fn deepest_mounts_sort_first() {
        let mut mounts = vec![
            PathBuf::from("/reprise/instances/x"),
            PathBuf::from("/reprise/instances/x/usr/ports"),
            PathBuf::from("/reprise/instances/x/dev"),
        ];
        mounts.sort_by(|a, b| b.as_os_str().len().cmp(&a.as_os_str().len()));
        assert_eq!(mounts[0], PathBuf::from("/reprise/instances/x/usr/ports"));
    }
}
