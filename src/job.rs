//! Job runner: the top-level state machine driving one `JobSpec`
//! through prepare → clone → mount → fetch → build → (test), with
//! guaranteed resource cleanup on every exit path.
//!
//! Grounded in `reprise.jobs.runner.JobRunner`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::dataset::{Dataset, DatasetError};
use crate::executor::{write_banner_async, ExecOptions, Executor, ExecutorError};
use crate::lock::{file_lock, LockError};
use crate::mount::{mount_bind, mount_devfs, mount_memfs, MountError};
use crate::planner::{PlanTimeouts, Planner, PlannerError};
use crate::repository::{RepositoryError, RepositoryManager, RepositoryUpdateMode};
use crate::resources::{enumerate_resources, ResourceError};
use crate::sandbox::{start_prison, SandboxError, SandboxUser};
use crate::task::TaskStatus;
use crate::template::{get_prepared_jail, TemplateError};
use crate::types::{JobResult, JobSpec, JobStatus, NetworkingIsolationMode};
use crate::workdir::{Workdir, WorkdirError};

/// The ABI system name is fixed; reprise targets FreeBSD exclusively.
const ABI_SYSTEM: &str = "FreeBSD";
/// The pkg branch is fixed to the rolling-release feed, same as the
/// `quarterly` → `latest` patch applied to `etc/pkg/FreeBSD.conf` below.
const ABI_BRANCH: &str = "latest";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Task(#[from] crate::task::TaskError),
    #[error(transparent)]
    Workdir(#[from] WorkdirError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no package manifest for 'pkg' in the repository")]
    MissingPkgManifest,
}

pub type JobResultOutcome = Result<JobStatus, JobError>;

/// Drives jobs against a shared workdir and repository manager.
pub struct JobRunner {
    executor: Arc<Executor>,
    workdir: Arc<Workdir>,
    repository_manager: Arc<RepositoryManager>,
    update_mode: RepositoryUpdateMode,
}

impl JobRunner {
    pub fn new(
        executor: Arc<Executor>,
        workdir: Arc<Workdir>,
        repository_manager: Arc<RepositoryManager>,
        update_mode: RepositoryUpdateMode,
    ) -> Self {
        Self {
            executor,
            workdir,
            repository_manager,
            update_mode,
        }
    }

    async fn cleanup_jail(&self, path: &Path) {
        match enumerate_resources(self.executor.clone(), path).await {
            Ok(resources) => {
                for resource in resources {
                    if let Err(err) = resource.destroy().await {
                        tracing::warn!(%err, path = %path.display(), "failed to destroy leftover resource");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "failed to enumerate resources for cleanup");
            }
        }
    }

    /// Runs `jobspec` to completion, never propagating an error: any
    /// internal failure is classified as [`JobStatus::Crashed`]. Runs
    /// resource cleanup on every exit path.
    pub async fn run(&self, jobspec: JobSpec) -> JobResult {
        let instance_name = format!("{}-{}", jobspec.jailspec.name, std::process::id());
        let instance_zfs = self.workdir.get_jail_instance(&instance_name);
        let instance_path = match instance_zfs.get_path() {
            Ok(path) => path.to_path_buf(),
            Err(err) => {
                return JobResult {
                    spec: jobspec,
                    status: JobStatus::Crashed,
                    log_path: None,
                    details: Some(err.to_string()),
                };
            }
        };

        self.cleanup_jail(&instance_path).await;

        let mut log_path: Option<PathBuf> = None;
        let outcome = self
            .run_phases(&jobspec, instance_zfs, &instance_path, &mut log_path)
            .await;

        self.cleanup_jail(&instance_path).await;

        match outcome {
            Ok(status) => JobResult {
                spec: jobspec,
                status,
                log_path,
                details: None,
            },
            Err(err) => {
                tracing::error!(%err, origin = %jobspec.origin, "job failed with an internal error");
                JobResult {
                    spec: jobspec,
                    status: JobStatus::Crashed,
                    log_path,
                    details: Some(err.to_string()),
                }
            }
        }
    }

    async fn run_phases(
        &self,
        jobspec: &JobSpec,
        mut instance_zfs: Dataset,
        instance_path: &Path,
        log_path: &mut Option<PathBuf>,
    ) -> JobResultOutcome {
        let prepared = get_prepared_jail(self.executor.clone(), &self.workdir, &jobspec.jailspec).await?;

        tracing::debug!(name = %instance_zfs.name(), "cloning instance");
        instance_zfs.clone_from(&prepared.jail_zfs, "clean", true).await?;
        instance_zfs.resolve_mountpoint().await?;

        let repository = self
            .repository_manager
            .get_repository(
                ABI_SYSTEM,
                &jobspec.jailspec.version,
                &jobspec.jailspec.arch,
                ABI_BRANCH,
                self.update_mode,
            )
            .await?;

        tracing::debug!("creating host directories");
        let host_packages_path = repository.get_path().to_path_buf();
        let ccache_zfs = self.workdir.get_ccache();
        let host_ccache_path = ccache_zfs
            .get_path()?
            .join(if jobspec.build_as_nobody { "nobody" } else { "root" });

        tokio::fs::create_dir_all(&host_packages_path).await?;
        if jobspec.use_ccache {
            tokio::fs::create_dir_all(&host_ccache_path).await?;
        }

        tracing::debug!("creating jail directories");
        let jail_ports_path = instance_path.join("usr/ports");
        let jail_distfiles_path = instance_path.join("distfiles");
        let jail_work_path = instance_path.join("work");
        let jail_packages_path = instance_path.join("packages");
        let jail_ccache_path = instance_path.join("ccache");
        let jail_localbase_path = instance_path.join("usr/local");

        for dir in [
            &jail_ports_path,
            &jail_distfiles_path,
            &jail_work_path,
            &jail_packages_path,
            &jail_localbase_path,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        if jobspec.use_ccache {
            tokio::fs::create_dir_all(&jail_ccache_path).await?;
        }

        tracing::debug!("installing resolv.conf");
        tokio::fs::write(instance_path.join("etc/resolv.conf"), "nameserver 8.8.8.8\n").await?;

        tracing::debug!("installing make.conf");
        let make_conf: String = jobspec
            .all_variables()
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        tokio::fs::write(instance_path.join("etc/make.conf"), make_conf).await?;

        tracing::debug!("patching etc/pkg/FreeBSD.conf to the latest branch");
        let pkg_conf_path = instance_path.join("etc/pkg/FreeBSD.conf");
        if let Ok(contents) = tokio::fs::read_to_string(&pkg_conf_path).await {
            tokio::fs::write(&pkg_conf_path, contents.replace("quarterly", "latest")).await?;
        }

        tracing::debug!("mounting filesystems");
        let (devfs, ports_mount, distfiles_mount, packages_mount) = tokio::try_join!(
            mount_devfs(self.executor.clone(), &instance_path.join("dev")),
            mount_bind(self.executor.clone(), &jobspec.portsdir, &jail_ports_path, true),
            mount_bind(self.executor.clone(), &jobspec.distdir, &jail_distfiles_path, false),
            mount_bind(self.executor.clone(), &host_packages_path, &jail_packages_path, false),
        )?;
        let mut mounts = vec![devfs, ports_mount, distfiles_mount, packages_mount];

        if jobspec.use_ccache {
            mounts.push(mount_bind(self.executor.clone(), &host_ccache_path, &jail_ccache_path, false).await?);
        }
        if jobspec.use_tmpfs_work {
            mounts.push(mount_memfs(self.executor.clone(), &jail_work_path, jobspec.tmpfs_limit_bytes).await?);
        }
        if jobspec.use_tmpfs_localbase {
            mounts.push(mount_memfs(self.executor.clone(), &jail_localbase_path, jobspec.tmpfs_limit_bytes).await?);
        }
        // Mounts are intentionally not retained past this point: they
        // live under `instance_path` and are torn down by the resource
        // enumerator during cleanup, regardless of how this job exits.
        let _ = mounts;

        tracing::debug!("starting prison (fetcher)");
        let mut sandbox = Arc::new(
            start_prison(
                self.executor.clone(),
                instance_path,
                "reprise-fetcher",
                NetworkingIsolationMode::Unrestricted,
            )
            .await?,
        );

        tracing::debug!("bootstrapping pkg");
        let pkg_info = repository
            .by_name("pkg")
            .await?
            .ok_or(JobError::MissingPkgManifest)?;
        let pkg_package = repository.get_package(&pkg_info).await?;
        self.executor
            .execute(
                "job::bootstrap_pkg",
                "tar",
                &[
                    "-x".to_string(),
                    "-f".to_string(),
                    pkg_package.path.display().to_string(),
                    "-C".to_string(),
                    instance_path.display().to_string(),
                    "--strip-components=1".to_string(),
                    "/usr/local/sbin/pkg-static".to_string(),
                ],
                &ExecOptions::default(),
            )
            .await?;
        let jail_pkg_path = instance_path.join("usr/local/sbin/pkg");
        let jail_pkg_static_path = instance_path.join("usr/local/sbin/pkg-static");
        tokio::fs::hard_link(&jail_pkg_static_path, &jail_pkg_path).await?;

        let ignore_result = sandbox
            .execute(
                "make",
                &[
                    "-C".to_string(),
                    format!("/usr/ports/{}", jobspec.origin),
                    "-V".to_string(),
                    "IGNORE".to_string(),
                ],
                SandboxUser::Root,
                &ExecOptions::default().with_env("_LICENSE_STATUS", "accepted"),
            )
            .await?;
        if let Some(reason) = ignore_result.stdout.first().filter(|s| !s.is_empty()) {
            return Ok(skip_with_reason(reason));
        }

        let planner = Planner::new(sandbox.clone(), repository.clone(), self.executor.clone());
        let plan = planner
            .prepare(
                &jobspec.origin,
                &jobspec.origins_to_rebuild,
                jobspec.build_as_nobody,
                PlanTimeouts {
                    fetch_secs: jobspec.fetch_timeout_secs,
                    build_secs: jobspec.build_timeout_secs,
                    test_secs: jobspec.test_timeout_secs,
                },
            )
            .await?;

        let logs_zfs = self.workdir.get_logs();
        let log_file_path = next_log_path(logs_zfs.get_path()?).await?;
        *log_path = Some(log_file_path.clone());
        let mut log = tokio::fs::File::create(&log_file_path).await?;
        tracing::info!(log = %log_file_path.display(), "log file allocated");

        tracing::info!("fetching");
        write_banner_async(&mut log, &format!("fetch: {}", jobspec.origin)).await?;
        let fetch_status = {
            let _lock = file_lock(&self.workdir.fetch_lock_path()?).await?;
            plan.fetch(&sandbox, &mut log).await?
        };
        if let Some(status) = classify_phase_failure(fetch_status, JobStatus::FetchFailed, JobStatus::FetchTimeout) {
            return Ok(status);
        }

        tracing::debug!("setting up the prison for building");
        sandbox.destroy().await?;
        sandbox = Arc::new(
            start_prison(
                self.executor.clone(),
                instance_path,
                "reprise-builder",
                jobspec.networking_build,
            )
            .await?,
        );

        tracing::info!("installation");
        let install_status = plan.install(&sandbox, &mut log).await?;
        if let Some(status) = classify_phase_failure(install_status, JobStatus::BuildFailed, JobStatus::BuildTimeout)
        {
            return Ok(status);
        }

        if jobspec.do_test {
            tracing::debug!("setting up the prison for testing");
            sandbox.destroy().await?;
            sandbox = Arc::new(
                start_prison(
                    self.executor.clone(),
                    instance_path,
                    "reprise-tester",
                    jobspec.networking_test,
                )
                .await?,
            );

            tracing::info!("testing");
            let test_status = plan.test(&sandbox, &mut log).await?;
            if let Some(status) = classify_phase_failure(test_status, JobStatus::TestFailed, JobStatus::TestTimeout) {
                return Ok(status);
            }
        }

        tracing::info!(log = %log_file_path.display(), "job succeeded");
        Ok(JobStatus::Success)
    }
}

fn skip_with_reason(reason: &str) -> JobStatus {
    tracing::info!(%reason, "job skipped (IGNORE set)");
    JobStatus::Skipped
}

fn classify_phase_failure(
    status: TaskStatus,
    on_failure: JobStatus,
    on_timeout: JobStatus,
) -> Option<JobStatus> {
    match status {
        TaskStatus::Success => None,
        TaskStatus::Failure => Some(on_failure),
        TaskStatus::Timeout => Some(on_timeout),
    }
}

/// Finds the next monotonically increasing integer filename under
/// `dir` (creating it if absent), matching the original's
/// `_get_next_file_name`.
async fn next_log_path(dir: &Path) -> std::io::Result<PathBuf> {
    if tokio::fs::try_exists(dir).await.unwrap_or(false) {
        let mut max_seen = 0u64;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                    max_seen = max_seen.max(n + 1);
                }
            }
        }
        Ok(dir.join(max_seen.to_string()))
    } else {
        tokio::fs::create_dir_all(dir).await?;
        Ok(dir.join("0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_phase_failure_maps_each_status() {
        assert_eq!(
            classify_phase_failure(TaskStatus::Success, JobStatus::FetchFailed, JobStatus::FetchTimeout),
            None
        );
        assert_eq!(
            classify_phase_failure(TaskStatus::Failure, JobStatus::FetchFailed, JobStatus::FetchTimeout),
            Some(JobStatus::FetchFailed)
        );
        assert_eq!(
            classify_phase_failure(TaskStatus::Timeout, JobStatus::FetchFailed, JobStatus::FetchTimeout),
            Some(JobStatus::FetchTimeout)
        );
    }

    #[tokio::test]
    async fn next_log_path_starts_at_zero_for_fresh_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let path = next_log_path(&logs).await.unwrap();
        assert_eq!(path, logs.join("0"));
    }

    #[tokio::test]
    async fn next_log_path_continues_after_highest_existing() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("0"), b"").await.unwrap();
        tokio::fs::write(dir.path().join("3"), b"").await.unwrap();
        let path = next_log_path(dir.path()).await.unwrap();
        assert_eq!(path, dir.path().join("4"));
    }
}
