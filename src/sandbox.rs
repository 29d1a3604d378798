//! FreeBSD jail process confinement ("prison").
//!
//! Grounded in `reprise.prison`: `start_prison` creates a jail rooted
//! at a path with a given hostname and networking mode; `Prison`
//! exposes `execute`/`execute_streaming`/`is_running`/`destroy`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::executor::{ExecOptions, Executor, ExecutorError};
use crate::types::NetworkingIsolationMode;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("jail command failed: {0}")]
    Command(#[from] ExecutorError),
    #[error("could not parse jail id from jail(8) output: {0:?}")]
    UnparseableJid(Vec<String>),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Which user a command runs as inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxUser {
    Root,
    Nobody,
}

impl SandboxUser {
    fn login_class(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Nobody => "daemon",
        }
    }

    fn username(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Nobody => "nobody",
        }
    }
}

fn networking_args(mode: NetworkingIsolationMode) -> Vec<String> {
    match mode {
        NetworkingIsolationMode::Unrestricted => vec![
            "ip4=inherit".to_string(),
            "ip6=inherit".to_string(),
        ],
        NetworkingIsolationMode::Restricted => vec![
            "ip4.addr=127.0.0.1".to_string(),
            "ip6.addr=::1".to_string(),
        ],
        NetworkingIsolationMode::Disabled => vec!["ip4=disable".to_string(), "ip6=disable".to_string()],
    }
}

/// A running jail: process-confinement parameterised by root path,
/// hostname, and network-isolation mode.
pub struct Sandbox {
    executor: Arc<Executor>,
    jid: u32,
    path: PathBuf,
}

impl Sandbox {
    /// Wraps a jail id/path already observed to be running (used by the
    /// resource enumerator, which discovers jails rather than starting
    /// them).
    pub fn from_existing(executor: Arc<Executor>, jid: u32, path: PathBuf) -> Self {
        Self {
            executor,
            jid,
            path,
        }
    }

    pub fn jid(&self) -> u32 {
        self.jid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wraps `program`/`args` with the environment-clearing shim that
    /// sets the login class and a minimal environment (`HOME`,
    /// `SHELL`, `TERM`, `USER`), for both unprivileged and root users.
    fn wrap_for_user(&self, user: SandboxUser, program: &str, args: &[String]) -> Vec<String> {
        let mut wrapped = vec![
            "-l".to_string(),
            format!("-u{}", user.username()),
            "/usr/bin/env".to_string(),
            "-i".to_string(),
            format!("HOME=/{}", if user == SandboxUser::Root { "root" } else { "home/nobody" }),
            "SHELL=/bin/sh".to_string(),
            "TERM=xterm".to_string(),
            format!("USER={}", user.username()),
            program.to_string(),
        ];
        wrapped.extend_from_slice(args);
        wrapped
    }

    /// Captures output of `program` run as `user`.
    pub async fn execute(
        &self,
        program: &str,
        args: &[String],
        user: SandboxUser,
        opts: &ExecOptions,
    ) -> SandboxResult<crate::executor::ExecResult> {
        let jexec_args = self.wrap_for_user(user, program, args);
        let mut full_args = vec![self.jid.to_string()];
        full_args.extend(jexec_args);

        Ok(self
            .executor
            .execute("sandbox::execute", "jexec", &full_args, opts)
            .await?)
    }

    /// Streams merged stdout/stderr of `program` run as `user` to
    /// `log_sink`; returns the exit code.
    pub async fn execute_streaming(
        &self,
        program: &str,
        args: &[String],
        user: SandboxUser,
        log_sink: &mut tokio::fs::File,
        opts: &ExecOptions,
    ) -> SandboxResult<i32> {
        let jexec_args = self.wrap_for_user(user, program, args);
        let mut full_args = vec![self.jid.to_string()];
        full_args.extend(jexec_args);

        Ok(self
            .executor
            .execute_streaming("sandbox::execute_streaming", "jexec", &full_args, log_sink, opts)
            .await?)
    }

    /// Probes liveness via `jls -j <jid>`.
    pub async fn is_running(&self) -> SandboxResult<bool> {
        let result = self
            .executor
            .execute(
                "sandbox::is_running",
                "jls",
                &["-j".to_string(), self.jid.to_string()],
                &ExecOptions::allow_failure(),
            )
            .await?;
        Ok(result.exit_code == 0)
    }

    /// Signals teardown (`jail -r`) and blocks-with-polling until the
    /// sandbox id disappears.
    pub async fn destroy(&self) -> SandboxResult<()> {
        let _ = self
            .executor
            .execute(
                "sandbox::destroy",
                "jail",
                &["-r".to_string(), self.jid.to_string()],
                &ExecOptions::allow_failure(),
            )
            .await?;
        while self.is_running().await? {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }
}

/// Starts a jail rooted at `root_path` with the given `hostname` and
/// `networking` mode, returning the live [`Sandbox`].
pub async fn start_prison(
    executor: Arc<Executor>,
    root_path: &Path,
    hostname: &str,
    networking: NetworkingIsolationMode,
) -> SandboxResult<Sandbox> {
    let mut args = vec![
        "-c".to_string(),
        "-i".to_string(),
        "persist".to_string(),
        format!("path={}", root_path.display()),
        format!("host.hostname={hostname}"),
    ];
    args.extend(networking_args(networking));

    let result = executor
        .execute("sandbox::start_prison", "jail", &args, &ExecOptions::default())
        .await?;

    let jid: u32 = result
        .stdout
        .first()
        .and_then(|line| line.split_whitespace().next())
        .and_then(|tok| tok.trim_end_matches(':').parse().ok())
        .ok_or_else(|| SandboxError::UnparseableJid(result.stdout.clone()))?;

    Ok(Sandbox {
        executor,
        jid,
        path: root_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networking_args_cover_all_modes() {
        assert_eq!(
            networking_args(NetworkingIsolationMode::Unrestricted),
            vec!["ip4=inherit".to_string(), "ip6=inherit".to_string()]
        );
        assert_eq!(
            networking_args(NetworkingIsolationMode::Restricted),
            vec!["ip4.addr=127.0.0.1".to_string(), "ip6.addr=::1".to_string()]
        );
        assert_eq!(
            networking_args(NetworkingIsolationMode::Disabled),
            vec!["ip4=disable".to_string(), "ip6=disable".to_string()]
        );
    }

    #[test]
    fn wrap_for_user_sets_minimal_environment() {
        let sandbox = Sandbox {
            executor: Arc::new(Executor::new()),
            jid: 1,
            path: PathBuf::from("/tmp"),
        };
        let wrapped = sandbox.wrap_for_user(SandboxUser::Nobody, "make", &["test".to_string()]);
        assert!(wrapped.contains(&"USER=nobody".to_string()));
        assert!(wrapped.contains(&"make".to_string()));
    }

    #[test]
    fn parses_jid_from_first_stdout_line() {
        let lines = vec!["7: created".to_string()];
        let jid: u32 = lines
            .first()
            .and_then(|line| line.split_whitespace().next())
            .and_then(|tok| tok.trim_end_matches(':').parse().ok())
            .unwrap();
        assert_eq!(jid, 7);
    }
}
