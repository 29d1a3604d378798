//! Shared data model: the value types passed between every subsystem.
//!
//! These mirror the dataclasses of the original implementation
//! (`Port`, `PackageInfo`, `JailSpec`, `JobSpec`, `JobResult`, …) but
//! are expressed as immutable, strongly-typed Rust structs/enums
//! rather than loosely-typed dictionaries.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A port identifier: `category/name`, optionally qualified by a flavor.
///
/// Two ports are equal iff both `origin` and `flavor` are equal.
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    origin: String,
    flavor: Option<String>,
}

impl Port {
    pub fn new(origin: impl Into<String>, flavor: Option<String>) -> Self {
        Self {
            origin: origin.into(),
            flavor,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn flavor(&self) -> Option<&str> {
        self.flavor.as_deref()
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.flavor {
            Some(flavor) => write!(f, "{}@{}", self.origin, flavor),
            None => write!(f, "{}", self.origin),
        }
    }
}

/// The metadata row for a single package, as decoded from the remote
/// package index (`packagesite.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub origin: String,
    pub size: u64,
    pub flavor: Option<String>,
    /// Dependency package names, or `None` if the index record carried
    /// no `deps` map at all.
    pub deps: Option<Vec<String>>,
}

impl PackageInfo {
    pub fn namever(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn filename(&self) -> String {
        format!("{}.pkg", self.namever())
    }

    pub fn port(&self) -> Port {
        Port::new(self.origin.clone(), self.flavor.clone())
    }
}

/// The schema tag embedded in a serialized `RepositoryMetadata`. Bump
/// this whenever `PackageInfo`'s on-disk shape changes; a mismatched
/// tag on load forces a clean re-fetch rather than risking a
/// misinterpreted byte layout.
pub const REPOSITORY_METADATA_SCHEMA_TAG: &str = "reprise-repository-metadata-v1";

/// The parsed package index: an etag, a last-update timestamp, and the
/// full package list plus three lookup indices built once at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    schema_tag: String,
    pub etag: Option<String>,
    pub last_update: chrono::DateTime<chrono::Utc>,
    pub packages: Vec<PackageInfo>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
    #[serde(skip)]
    by_namever: HashMap<String, usize>,
    #[serde(skip)]
    by_port: HashMap<Port, usize>,
}

impl RepositoryMetadata {
    pub fn new(etag: Option<String>, packages: Vec<PackageInfo>) -> Self {
        let mut meta = Self {
            schema_tag: REPOSITORY_METADATA_SCHEMA_TAG.to_string(),
            etag,
            last_update: chrono::Utc::now(),
            packages,
            by_name: HashMap::new(),
            by_namever: HashMap::new(),
            by_port: HashMap::new(),
        };
        meta.rebuild_indices();
        meta
    }

    /// Called after deserialization (serde skips the index maps) and
    /// after construction.
    pub fn rebuild_indices(&mut self) {
        self.by_name.clear();
        self.by_namever.clear();
        self.by_port.clear();
        for (idx, pkg) in self.packages.iter().enumerate() {
            self.by_name.insert(pkg.name.clone(), idx);
            self.by_namever.insert(pkg.namever(), idx);
            self.by_port.insert(pkg.port(), idx);
        }
    }

    pub fn schema_tag_matches(&self) -> bool {
        self.schema_tag == REPOSITORY_METADATA_SCHEMA_TAG
    }

    pub fn by_name(&self, name: &str) -> Option<&PackageInfo> {
        self.by_name.get(name).map(|&idx| &self.packages[idx])
    }

    pub fn by_namever(&self, namever: &str) -> Option<&PackageInfo> {
        self.by_namever.get(namever).map(|&idx| &self.packages[idx])
    }

    pub fn by_port(&self, port: &Port) -> Option<&PackageInfo> {
        self.by_port.get(port).map(|&idx| &self.packages[idx])
    }
}

/// Identifies a master jail template: name, FreeBSD release version,
/// and architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JailSpec {
    pub name: String,
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Network isolation mode for a sandbox phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkingIsolationMode {
    Disabled,
    Restricted,
    Unrestricted,
}

impl std::fmt::Display for NetworkingIsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "DISABLED",
            Self::Restricted => "RESTRICTED",
            Self::Unrestricted => "UNRESTRICTED",
        };
        write!(f, "{s}")
    }
}

/// Binary package compression mode, passed through to `pkg create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PackageCompressionMode {
    None,
    Fast,
    Default,
    Best,
}

impl std::fmt::Display for PackageCompressionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Fast => "FAST",
            Self::Default => "DEFAULT",
            Self::Best => "BEST",
        };
        write!(f, "{s}")
    }
}

/// One unit of work: build/test a single port origin in a given jail.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub origin: String,
    pub portsdir: PathBuf,
    pub distdir: PathBuf,
    pub jailspec: JailSpec,
    pub origins_to_rebuild: HashSet<String>,
    pub do_test: bool,
    pub build_as_nobody: bool,
    pub use_ccache: bool,
    pub use_tmpfs_work: bool,
    pub use_tmpfs_localbase: bool,
    pub tmpfs_limit_bytes: u64,
    pub fail_fast: bool,
    pub networking_build: NetworkingIsolationMode,
    pub networking_test: NetworkingIsolationMode,
    pub variables: HashMap<String, String>,
    pub options: HashMap<String, bool>,
    pub package_compression: PackageCompressionMode,
    pub fetch_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub test_timeout_secs: u64,
}

/// Path the jail's ccache mount is bound at when `use_ccache` is set
/// (mirrors `job.rs`'s `jail_ccache_path = instance_path.join("ccache")`).
const JAIL_CCACHE_DIR: &str = "/ccache";

impl JobSpec {
    /// Combines `variables`, the `WITH`/`WITHOUT` option toggles derived
    /// from `options`, the ccache toggle, and the package-compression
    /// mode into the final `make.conf` contents.
    pub fn all_variables(&self) -> HashMap<String, String> {
        let mut vars = self.variables.clone();

        let with: Vec<&str> = self
            .options
            .iter()
            .filter(|(_, &on)| on)
            .map(|(k, _)| k.as_str())
            .collect();
        if !with.is_empty() {
            let mut with = with;
            with.sort_unstable();
            vars.insert("WITH".to_string(), with.join(" "));
        }

        let without: Vec<&str> = self
            .options
            .iter()
            .filter(|(_, &on)| !on)
            .map(|(k, _)| k.as_str())
            .collect();
        if !without.is_empty() {
            let mut without = without;
            without.sort_unstable();
            vars.insert("WITHOUT".to_string(), without.join(" "));
        }

        if self.use_ccache {
            vars.insert("WITH_CCACHE_BUILD".to_string(), "yes".to_string());
            vars.insert("CCACHE_DIR".to_string(), JAIL_CCACHE_DIR.to_string());
        }

        match self.package_compression {
            PackageCompressionMode::None => {
                vars.insert("PKG_COMPRESSION_FORMAT".to_string(), "tar".to_string());
            }
            PackageCompressionMode::Fast => {
                vars.insert("PKG_COMPRESSION_LEVEL".to_string(), "fast".to_string());
            }
            PackageCompressionMode::Default => {
                vars.insert("PKG_COMPRESSION_LEVEL".to_string(), "default".to_string());
            }
            PackageCompressionMode::Best => {
                vars.insert("PKG_COMPRESSION_LEVEL".to_string(), "best".to_string());
            }
        }

        vars
    }
}

impl std::fmt::Display for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let extras: Vec<String> = self
            .all_variables()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        write!(f, "{} on {}", self.origin, self.jailspec.name)?;
        if !extras.is_empty() {
            write!(f, " ({})", extras.join(", "))?;
        }
        Ok(())
    }
}

/// Final disposition of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    FetchFailed,
    BuildFailed,
    TestFailed,
    FetchTimeout,
    BuildTimeout,
    TestTimeout,
    Crashed,
    Skipped,
}

impl JobStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::FetchFailed => "FETCH_FAILED",
            Self::BuildFailed => "BUILD_FAILED",
            Self::TestFailed => "TEST_FAILED",
            Self::FetchTimeout => "FETCH_TIMEOUT",
            Self::BuildTimeout => "BUILD_TIMEOUT",
            Self::TestTimeout => "TEST_TIMEOUT",
            Self::Crashed => "CRASHED",
            Self::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// The outcome of running one `JobSpec` to completion.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub spec: JobSpec,
    pub status: JobStatus,
    pub log_path: Option<PathBuf>,
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_display_includes_flavor() {
        let p = Port::new("www/nginx", Some("full".to_string()));
        assert_eq!(p.to_string(), "www/nginx@full");
        let p2 = Port::new("www/nginx", None);
        assert_eq!(p2.to_string(), "www/nginx");
    }

    #[test]
    fn package_info_derived_fields() {
        let info = PackageInfo {
            name: "curl".to_string(),
            version: "8.1.0".to_string(),
            origin: "ftp/curl".to_string(),
            size: 1024,
            flavor: None,
            deps: None,
        };
        assert_eq!(info.namever(), "curl-8.1.0");
        assert_eq!(info.filename(), "curl-8.1.0.pkg");
        assert_eq!(info.port(), Port::new("ftp/curl", None));
    }

    #[test]
    fn repository_metadata_lookup_indices() {
        let pkgs = vec![
            PackageInfo {
                name: "a".into(),
                version: "1".into(),
                origin: "cat/a".into(),
                size: 1,
                flavor: None,
                deps: None,
            },
            PackageInfo {
                name: "b".into(),
                version: "2".into(),
                origin: "cat/b".into(),
                size: 2,
                flavor: Some("x".into()),
                deps: Some(vec!["a".into()]),
            },
        ];
        let meta = RepositoryMetadata::new(Some("etag1".into()), pkgs);
        assert!(meta.schema_tag_matches());
        assert_eq!(meta.by_name("a").unwrap().origin, "cat/a");
        assert_eq!(meta.by_namever("b-2").unwrap().name, "b");
        assert_eq!(
            meta.by_port(&Port::new("cat/b", Some("x".into())))
                .unwrap()
                .name,
            "b"
        );
        assert!(meta.by_name("nope").is_none());
    }

    #[test]
    fn job_spec_all_variables_combines_options() {
        let mut spec = sample_job_spec();
        spec.variables.insert("FOO".into(), "bar".into());
        spec.options.insert("DOCS".into(), true);
        spec.options.insert("NLS".into(), false);
        let vars = spec.all_variables();
        assert_eq!(vars.get("FOO").unwrap(), "bar");
        assert_eq!(vars.get("WITH").unwrap(), "DOCS");
        assert_eq!(vars.get("WITHOUT").unwrap(), "NLS");
    }

    #[test]
    fn job_spec_all_variables_maps_ccache_and_compression() {
        let mut spec = sample_job_spec();
        spec.use_ccache = true;
        spec.package_compression = PackageCompressionMode::Best;
        let vars = spec.all_variables();
        assert_eq!(vars.get("WITH_CCACHE_BUILD").unwrap(), "yes");
        assert_eq!(vars.get("CCACHE_DIR").unwrap(), "/ccache");
        assert_eq!(vars.get("PKG_COMPRESSION_LEVEL").unwrap(), "best");

        let mut spec = sample_job_spec();
        spec.use_ccache = false;
        spec.package_compression = PackageCompressionMode::None;
        let vars = spec.all_variables();
        assert!(!vars.contains_key("WITH_CCACHE_BUILD"));
        assert_eq!(vars.get("PKG_COMPRESSION_FORMAT").unwrap(), "tar");
    }

    fn sample_job_spec() -> JobSpec {
        JobSpec {
            origin: "cat/p".into(),
            portsdir: "/usr/ports".into(),
            distdir: "/distfiles".into(),
            jailspec: JailSpec {
                name: "140amd64".into(),
                version: "14.0-RELEASE".into(),
                arch: "amd64".into(),
                tags: vec![],
            },
            origins_to_rebuild: HashSet::new(),
            do_test: true,
            build_as_nobody: true,
            use_ccache: false,
            use_tmpfs_work: false,
            use_tmpfs_localbase: false,
            tmpfs_limit_bytes: 0,
            fail_fast: false,
            networking_build: NetworkingIsolationMode::Disabled,
            networking_test: NetworkingIsolationMode::Restricted,
            variables: HashMap::new(),
            options: HashMap::new(),
            package_compression: PackageCompressionMode::Default,
            fetch_timeout_secs: 900,
            build_timeout_secs: 1800,
            test_timeout_secs: 900,
        }
    }
}
