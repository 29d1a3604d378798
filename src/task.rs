//! Task variants: install-from-package, and build-from-port (with an
//! optional test phase). Each exposes `fetch`, `install`, `test`.
//!
//! Grounded in `reprise.plan.tasks` (`PackageTask`, `PortTask`).

use std::sync::Arc;

use crate::executor::{write_banner_async, ExecOptions, Executor, TIMEOUT_EXIT_CODE};
use crate::repository::{Repository, RepositoryError};
use crate::sandbox::{Sandbox, SandboxError, SandboxUser};
use crate::types::{PackageInfo, Port};

/// Outcome of a single task phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Failure,
    Timeout,
}

impl TaskStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Exit code `124` is reserved for the timeout wrapper; any other
    /// non-zero exit is a plain failure.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::Success
        } else if code == TIMEOUT_EXIT_CODE {
            Self::Timeout
        } else {
            Self::Failure
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TaskResult<T> = Result<T, TaskError>;

/// One node of a `Plan`: either install a prebuilt package, or build
/// (and optionally test) a port from source.
pub enum Task {
    Package(PackageTask),
    Port(PortTask),
}

impl Task {
    pub fn label(&self) -> String {
        match self {
            Task::Package(t) => format!("Package({})", t.info.name),
            Task::Port(t) => format!("Port({}, test={})", t.port, t.do_test),
        }
    }

    pub async fn fetch(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        match self {
            Task::Package(t) => t.fetch(log).await,
            Task::Port(t) => t.fetch(sandbox, log).await,
        }
    }

    pub async fn install(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        match self {
            Task::Package(t) => t.install(sandbox, log).await,
            Task::Port(t) => t.install(sandbox, log).await,
        }
    }

    pub async fn test(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        match self {
            Task::Package(t) => t.test(sandbox, log).await,
            Task::Port(t) => t.test(sandbox, log).await,
        }
    }
}

/// Installs a prebuilt binary package; `fetch` populates the shared
/// repository cache, `install` runs `pkg add`, `test` is a no-op.
pub struct PackageTask {
    pub info: PackageInfo,
    pub repository: Arc<Repository>,
    pub executor: Arc<Executor>,
}

impl PackageTask {
    async fn fetch(&self, _log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        match self.repository.get_package(&self.info).await {
            Ok(_) => Ok(TaskStatus::Success),
            Err(_) => Ok(TaskStatus::Failure),
        }
    }

    async fn install(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        write_banner_async(log, &format!("install {}", self.info.namever())).await?;
        let args = vec![
            "add".to_string(),
            "-q".to_string(),
            format!("/packages/{}", self.info.filename()),
        ];
        let code = sandbox
            .execute_streaming("pkg", &args, SandboxUser::Root, log, &ExecOptions::default())
            .await?;
        Ok(TaskStatus::from_exit_code(code))
    }

    async fn test(&self, _sandbox: &Sandbox, _log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        Ok(TaskStatus::Success)
    }
}

/// Builds (and optionally tests) a port from source.
pub struct PortTask {
    pub port: Port,
    pub do_test: bool,
    pub build_as_nobody: bool,
    pub fetch_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub test_timeout_secs: u64,
}

impl PortTask {
    fn flavor_env(&self) -> Vec<(String, String)> {
        match self.port.flavor() {
            Some(flavor) => vec![("FLAVOR".to_string(), flavor.to_string())],
            None => vec![],
        }
    }

    fn build_user(&self) -> SandboxUser {
        if self.build_as_nobody {
            SandboxUser::Nobody
        } else {
            SandboxUser::Root
        }
    }

    async fn fetch(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        write_banner_async(log, &format!("fetch distfiles for {}", self.port)).await?;

        let mut opts = ExecOptions::default().with_timeout(self.fetch_timeout_secs);
        for (k, v) in [
            ("BATCH", "1"),
            ("DISTDIR", "/distfiles"),
            ("WRKDIRPREFIX", "/work"),
            ("PKG_ADD", "false"),
            ("USE_PACKAGE_DEPENDS_ONLY", "1"),
            ("NO_IGNORE", "1"),
            ("_LICENSE_STATUS", "accepted"),
        ] {
            opts = opts.with_env(k, v);
        }
        for (k, v) in self.flavor_env() {
            opts = opts.with_env(k, v);
        }

        let args = vec![
            "-C".to_string(),
            format!("/usr/ports/{}", self.port.origin()),
            "checksum".to_string(),
        ];
        let code = sandbox
            .execute_streaming("make", &args, SandboxUser::Root, log, &opts)
            .await?;
        Ok(TaskStatus::from_exit_code(code))
    }

    async fn install(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        write_banner_async(log, &format!("install {}", self.port)).await?;

        let mut opts = ExecOptions::default().with_timeout(self.build_timeout_secs);
        for (k, v) in [
            ("BATCH", "1"),
            ("DISTDIR", "/distfiles"),
            ("WRKDIRPREFIX", "/work"),
            ("PKG_ADD", "false"),
            ("USE_PACKAGE_DEPENDS_ONLY", "1"),
            ("_LICENSE_STATUS", "accepted"),
        ] {
            opts = opts.with_env(k, v);
        }
        for (k, v) in self.flavor_env() {
            opts = opts.with_env(k, v);
        }

        // Step 1: build and check the packing list, as the configured
        // build user.
        let check_args = vec![
            "-C".to_string(),
            format!("/usr/ports/{}", self.port.origin()),
            "package".to_string(),
            "check-plist".to_string(),
        ];
        let code = sandbox
            .execute_streaming("make", &check_args, self.build_user(), log, &opts)
            .await?;
        let status = TaskStatus::from_exit_code(code);
        if !status.is_success() {
            return Ok(status);
        }

        // Step 2: install-package as root, since it touches /usr/local.
        let install_args = vec![
            "-C".to_string(),
            format!("/usr/ports/{}", self.port.origin()),
            "install-package".to_string(),
        ];
        let code = sandbox
            .execute_streaming("make", &install_args, SandboxUser::Root, log, &opts)
            .await?;
        Ok(TaskStatus::from_exit_code(code))
    }

    async fn test(&self, sandbox: &Sandbox, log: &mut tokio::fs::File) -> TaskResult<TaskStatus> {
        if !self.do_test {
            return Ok(TaskStatus::Success);
        }

        write_banner_async(log, &format!("test {}", self.port)).await?;

        let mut opts = ExecOptions::default().with_timeout(self.test_timeout_secs);
        for (k, v) in [
            ("BATCH", "1"),
            ("DISTDIR", "/distfiles"),
            ("WRKDIRPREFIX", "/work"),
            ("PKG_ADD", "false"),
            ("USE_PACKAGE_DEPENDS_ONLY", "1"),
            ("_LICENSE_STATUS", "accepted"),
        ] {
            opts = opts.with_env(k, v);
        }
        for (k, v) in self.flavor_env() {
            opts = opts.with_env(k, v);
        }

        let args = vec![
            "-C".to_string(),
            format!("/usr/ports/{}", self.port.origin()),
            "test".to_string(),
        ];
        let code = sandbox
            .execute_streaming("make", &args, self.build_user(), log, &opts)
            .await?;
        Ok(TaskStatus::from_exit_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_from_exit_code_classifies_timeout() {
        assert_eq!(TaskStatus::from_exit_code(0), TaskStatus::Success);
        assert_eq!(TaskStatus::from_exit_code(124), TaskStatus::Timeout);
        assert_eq!(TaskStatus::from_exit_code(1), TaskStatus::Failure);
        assert_eq!(TaskStatus::from_exit_code(127), TaskStatus::Failure);
    }

    #[test]
    fn port_task_skips_test_when_do_test_false() {
        let task = PortTask {
            port: Port::new("cat/p", None),
            do_test: false,
            build_as_nobody: true,
            fetch_timeout_secs: 60,
            build_timeout_secs: 60,
            test_timeout_secs: 60,
        };
        assert!(!task.do_test);
        assert_eq!(task.build_user(), SandboxUser::Nobody);
    }

    #[test]
    fn flavor_env_empty_without_flavor() {
        let task = PortTask {
            port: Port::new("cat/p", None),
            do_test: false,
            build_as_nobody: false,
            fetch_timeout_secs: 60,
            build_timeout_secs: 60,
            test_timeout_secs: 60,
        };
        assert!(task.flavor_env().is_empty());

        let task_with_flavor = PortTask {
            port: Port::new("cat/p", Some("py311".to_string())),
            ..task
        };
        assert_eq!(
            task_with_flavor.flavor_env(),
            vec![("FLAVOR".to_string(), "py311".to_string())]
        );
    }
}
