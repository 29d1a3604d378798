//! Runs external programs with captured or streamed output, an
//! optional timeout, and call-site timing records.
//!
//! Every subsystem that shells out (dataset store, mount manager,
//! sandbox, template manager, planner) goes through this module so the
//! `allow_failure`/timeout contract and the timing ledger stay uniform.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// The exit code `timeout(1)` uses to signal that it killed the child.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        program: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Options controlling a single `execute`/`execute_streaming` call.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// If true, a non-zero exit yields an empty line list rather than
    /// an error.
    pub allow_failure: bool,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Zero disables the timeout wrapper.
    pub timeout_secs: u64,
}

impl ExecOptions {
    pub fn allow_failure() -> Self {
        Self {
            allow_failure: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Captured result of `execute`.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ExecResult {
    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }
}

/// One recorded call, kept for an optional end-of-run slow-caller report.
#[derive(Debug, Clone)]
pub struct TimingRecord {
    pub call_site: String,
    pub program: String,
    pub duration: Duration,
}

/// Splits on LF, dropping the trailing empty element so that
/// `"a\nb\n"` becomes `["a", "b"]`.
fn split_lines_dropping_trailing_empty(s: &str) -> Vec<String> {
    let mut lines: Vec<String> = s.split('\n').map(str::to_string).collect();
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

fn wrap_with_timeout(program: &str, args: &[String], timeout_secs: u64) -> (String, Vec<String>) {
    if timeout_secs == 0 {
        return (program.to_string(), args.to_vec());
    }
    let mut wrapped = vec!["-k".to_string(), "30".to_string(), timeout_secs.to_string()];
    wrapped.push(program.to_string());
    wrapped.extend_from_slice(args);
    ("timeout".to_string(), wrapped)
}

/// Records each call's wall-time and call site so an optional
/// end-of-run report can summarise slow callers.
#[derive(Debug, Default)]
pub struct Executor {
    timings: std::sync::Mutex<Vec<TimingRecord>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timings(&self) -> Vec<TimingRecord> {
        self.timings.lock().unwrap().clone()
    }

    fn record(&self, call_site: &str, program: &str, duration: Duration) {
        self.timings.lock().unwrap().push(TimingRecord {
            call_site: call_site.to_string(),
            program: program.to_string(),
            duration,
        });
    }

    /// Captures full stdout/stderr of a command, injecting the timeout
    /// wrapper when `opts.timeout_secs` is positive.
    pub async fn execute(
        &self,
        call_site: &str,
        program: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> ExecutorResult<ExecResult> {
        let (real_program, real_args) = wrap_with_timeout(program, args, opts.timeout_secs);

        let mut cmd = tokio::process::Command::new(&real_program);
        cmd.args(&real_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let start = Instant::now();
        let output = cmd.output().await.map_err(|source| ExecutorError::Spawn {
            program: program.to_string(),
            source,
        })?;
        self.record(call_site, program, start.elapsed());

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if exit_code != 0 && !opts.allow_failure {
            return Err(ExecutorError::NonZeroExit {
                program: program.to_string(),
                exit_code,
                stderr: stderr.to_string(),
            });
        }

        if exit_code != 0 {
            return Ok(ExecResult {
                exit_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        Ok(ExecResult {
            exit_code,
            stdout: split_lines_dropping_trailing_empty(&stdout),
            stderr: split_lines_dropping_trailing_empty(&stderr),
        })
    }

    /// Merges stdout+stderr to `log_sink` line-bufferedly; stdin is
    /// closed. Returns the exit code regardless of sign (timeout
    /// callers check for [`TIMEOUT_EXIT_CODE`]).
    pub async fn execute_streaming(
        &self,
        call_site: &str,
        program: &str,
        args: &[String],
        log_sink: &mut tokio::fs::File,
        opts: &ExecOptions,
    ) -> ExecutorResult<i32> {
        use futures::stream::StreamExt;
        use tokio::io::{AsyncBufReadExt, BufReader};

        let (real_program, real_args) = wrap_with_timeout(program, args, opts.timeout_secs);

        let mut cmd = tokio::process::Command::new(&real_program);
        cmd.args(&real_args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        enum Line {
            Out(String),
            Err(String),
        }

        let stdout_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
                .map(|l| Line::Out(l.unwrap_or_default()));
        let stderr_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
                .map(|l| Line::Err(l.unwrap_or_default()));
        let mut combined = futures::stream::select(stdout_stream, stderr_stream);

        while let Some(line) = combined.next().await {
            let text = match line {
                Line::Out(s) | Line::Err(s) => s,
            };
            log_sink.write_all(text.as_bytes()).await?;
            log_sink.write_all(b"\n").await?;
        }
        log_sink.flush().await?;

        let status = child.wait().await?;
        self.record(call_site, program, start.elapsed());

        Ok(status.code().unwrap_or(-1))
    }
}

/// Writes a 3-line ASCII banner (`=` x 80) to a log sink before the
/// commands of a phase run.
pub fn write_banner(log_sink: &mut impl Write, title: &str) -> std::io::Result<()> {
    let bar = "=".repeat(80);
    writeln!(log_sink, "{bar}")?;
    writeln!(log_sink, "{title}")?;
    writeln!(log_sink, "{bar}")?;
    Ok(())
}

/// Async variant of [`write_banner`] for log sinks opened via tokio.
pub async fn write_banner_async(
    log_sink: &mut tokio::fs::File,
    title: &str,
) -> std::io::Result<()> {
    let bar = "=".repeat(80);
    log_sink
        .write_all(format!("{bar}\n{title}\n{bar}\n").as_bytes())
        .await
}

pub fn path_display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_dropping_trailing_empty() {
        assert_eq!(
            split_lines_dropping_trailing_empty("a\nb\n"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            split_lines_dropping_trailing_empty("a\nb"),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            split_lines_dropping_trailing_empty(""),
            Vec::<String>::new()
        );
    }

    #[tokio::test]
    async fn execute_captures_stdout_and_splits_lines() {
        let executor = Executor::new();
        let result = executor
            .execute(
                "test::echo",
                "/bin/echo",
                &["a\nb".to_string()],
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(executor.timings().len(), 1);
    }

    #[tokio::test]
    async fn execute_allow_failure_returns_empty_on_nonzero() {
        let executor = Executor::new();
        let result = executor
            .execute(
                "test::false",
                "/usr/bin/env",
                &["false".to_string()],
                &ExecOptions::allow_failure(),
            )
            .await
            .unwrap();
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn execute_without_allow_failure_errors_on_nonzero() {
        let executor = Executor::new();
        let err = executor
            .execute(
                "test::false",
                "/usr/bin/env",
                &["false".to_string()],
                &ExecOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn execute_streaming_writes_merged_output() {
        let executor = Executor::new();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log");
        let mut log = tokio::fs::File::create(&log_path).await.unwrap();

        let code = executor
            .execute_streaming(
                "test::echo_stream",
                "/bin/echo",
                &["hello".to_string()],
                &mut log,
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);

        let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert!(contents.contains("hello"));
    }
}
