//! Command-line interface: one flat argument set, no subcommands — this
//! program has a single mode (build and test the given ports).
//!
//! Grounded in `reprise.cli`'s `argparse` definitions and spec.md's
//! external-interface flag table; flag names follow the latter where
//! the two disagree.

use std::path::PathBuf;

use clap::Parser;

use crate::types::{NetworkingIsolationMode, PackageCompressionMode};

#[derive(Debug, Parser)]
#[command(name = "reprise", version, about = "Build and test FreeBSD ports in disposable jails")]
pub struct Cli {
    /// Port origins to build (`category/name`), or `.` for the port in
    /// the current directory.
    pub ports: Vec<String>,

    #[arg(short = 'p', long)]
    pub portsdir: Option<PathBuf>,

    #[arg(long)]
    pub distdir: Option<PathBuf>,

    /// Origins to force a full rebuild of even if a cached package exists.
    #[arg(short = 'r', long)]
    pub rebuild: Vec<String>,

    /// Read additional port origins from this file (one per line, `#`
    /// starts a comment); `-` reads from stdin.
    #[arg(short = 'f', long)]
    pub file: Option<String>,

    /// `KEY=VALUE` pairs added to the jail's `make.conf`.
    #[arg(short = 'V', long = "vars")]
    pub vars: Vec<String>,

    /// Enumerate and test every non-default option combination.
    #[arg(short = 'O', long)]
    pub options: bool,

    #[arg(long)]
    pub include_options: Vec<String>,

    #[arg(long)]
    pub exclude_options: Vec<String>,

    /// Skip the default (no options touched) build when `--options` is set.
    #[arg(long)]
    pub exclude_default_options: bool,

    /// Jail names or tags to build in; defaults to every configured jail.
    #[arg(short = 'j', long)]
    pub jails: Vec<String>,

    #[arg(short = 'd', long)]
    pub debug: bool,

    #[arg(short = 'n', long)]
    pub dry_run: bool,

    #[arg(short = 'q', long)]
    pub quiet: bool,

    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Stop after the first failing job instead of running the rest.
    #[arg(long)]
    pub fail_fast: bool,

    #[arg(long, value_enum, default_value_t = NetworkingIsolationMode::Disabled)]
    pub networking_build: NetworkingIsolationMode,

    #[arg(long, value_enum, default_value_t = NetworkingIsolationMode::Restricted)]
    pub networking_test: NetworkingIsolationMode,

    #[arg(long)]
    pub build_as_root: bool,

    #[arg(long)]
    pub no_ccache: bool,

    #[arg(long)]
    pub no_test: bool,

    #[arg(long, value_enum, default_value_t = PackageCompressionMode::Default)]
    pub package_compression: PackageCompressionMode,

    #[arg(long)]
    pub tmpfs_work: bool,

    #[arg(long)]
    pub tmpfs_localbase: bool,

    #[arg(long, default_value_t = 1024)]
    pub tmpfs_limit_mb: u64,

    #[arg(long, default_value_t = 900)]
    pub timeout_fetch: u64,

    #[arg(long, default_value_t = 3600)]
    pub timeout_build: u64,

    #[arg(long, default_value_t = 1800)]
    pub timeout_test: u64,

    /// Skip the automatic package-index refresh check.
    #[arg(short = 'U', long)]
    pub no_repo_update: bool,

    /// Force a package-index refresh even if the cache looks fresh.
    #[arg(short = 'u', long)]
    pub force_repo_update: bool,

    /// Drop into an interactive shell in the sandbox on failure.
    #[arg(short = 'i', long)]
    pub interactive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_ports_and_jails() {
        let cli = Cli::parse_from(["reprise", "-j", "140amd64", "www/nginx"]);
        assert_eq!(cli.ports, vec!["www/nginx".to_string()]);
        assert_eq!(cli.jails, vec!["140amd64".to_string()]);
    }

    #[test]
    fn repo_update_flags_are_mutually_informative_not_exclusive() {
        let cli = Cli::parse_from(["reprise", "-u"]);
        assert!(cli.force_repo_update);
        assert!(!cli.no_repo_update);
    }
}
