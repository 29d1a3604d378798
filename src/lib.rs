//! # reprise
//!
//! Builds and tests FreeBSD ports inside disposable, ZFS-snapshot-based
//! jail sandboxes.
//!
//! ## Architecture
//!
//! - [`dataset`] — copy-on-write ZFS dataset tree (create/destroy,
//!   snapshot/clone/rollback, mountpoint resolution).
//! - [`mount`] — bind/devfs/memfs mount lifecycle.
//! - [`sandbox`] — jail ("prison") lifecycle: start, wrap a command for
//!   a user, destroy.
//! - [`resources`] — crash-recovery discovery of leftover
//!   jails/mounts under a path prefix.
//! - [`lock`] — advisory file locking (per-template, per-repository,
//!   workdir-wide).
//! - [`workdir`] — the persistent on-disk layout rooted at a ZFS pool.
//! - [`template`] — master jail template preparation and compliance
//!   checking.
//! - [`repository`] — the remote binary-package index/file cache.
//! - [`planner`] — dependency graph construction and topological sort.
//! - [`task`] / [`plan`] — the ordered fetch/install/test task list and
//!   its sequential executor.
//! - [`job`] — the full per-job state machine tying the above together.
//! - [`generate`] — turns parsed CLI arguments into the jobs to run.
//! - [`config`] — the YAML config file (`jails` mapping).
//! - [`cli`] — command-line argument parsing.
//! - [`executor`] — shells out to external programs with timeout and
//!   timing-ledger support.
//! - [`types`] — the shared data model (`Port`, `JobSpec`, `JailSpec`, …).

pub mod cli;
pub mod config;
pub mod dataset;
pub mod executor;
pub mod generate;
pub mod job;
pub mod lock;
pub mod mount;
pub mod planner;
pub mod plan;
pub mod profiling;
pub mod repository;
pub mod resources;
pub mod sandbox;
pub mod task;
pub mod template;
pub mod types;
pub mod workdir;

pub use config::{load_config, Config};
pub use job::{JobError, JobRunner};
pub use types::{JailSpec, JobResult, JobSpec, JobStatus};
