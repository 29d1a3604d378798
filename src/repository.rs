//! Per `(system, release, arch, branch)` remote binary-package
//! repository cache: a content-addressed on-disk cache of the decoded
//! index and of individual package files, with conditional refresh,
//! single-flight fetch coalescing, and atomic persistence.
//!
//! Grounded in `reprise.repository` (`Repository`, `RepositoryManager`,
//! the pickle-protocol schema-tag check) and, for the cache-loading
//! shape (load-gracefully-degrade-on-corruption), `cache.rs`'s
//! `ImageCache::load`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use crate::lock::{file_lock, LockError};
use crate::types::{PackageInfo, RepositoryMetadata};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository is uninitialized (index never successfully loaded or updated)")]
    Uninitialized,
    #[error("no such package in repository: {0}")]
    NoSuchPackage(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("failed to parse packagesite.yaml record: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A fetched, on-disk package file.
pub struct Package {
    pub path: PathBuf,
}

/// State shared across concurrent `get_package` callers for a single
/// repository: the set of filenames currently being fetched plus a
/// wake-up signal. Waiters loop until the filename leaves the set,
/// then re-check the file — no per-filename lock object is used.
#[derive(Default)]
struct InFlight {
    fetching: Mutex<HashSet<String>>,
    notify: Notify,
}

/// Maintains a local directory containing the decoded package index
/// and fetched package files for one `(system, release, arch, branch)`
/// ABI/branch combination.
pub struct Repository {
    http: reqwest::Client,
    dir: PathBuf,
    base_url: String,
    metadata: Mutex<Option<RepositoryMetadata>>,
    in_flight: InFlight,
}

fn index_path(dir: &Path) -> PathBuf {
    dir.join("packagesite.bin")
}

impl Repository {
    /// Opens the cache directory, attempting to load the serialized
    /// index. A missing, corrupt, or schema-tag-mismatched index
    /// leaves the repository uninitialized (logged, not fatal).
    pub async fn open(http: reqwest::Client, dir: PathBuf, base_url: String) -> RepositoryResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;

        let metadata = match tokio::fs::read(index_path(&dir)).await {
            Ok(bytes) => match bincode::deserialize::<RepositoryMetadata>(&bytes) {
                Ok(mut meta) => {
                    if meta.schema_tag_matches() {
                        meta.rebuild_indices();
                        Some(meta)
                    } else {
                        tracing::warn!(dir = %dir.display(), "repository index schema tag mismatch, ignoring");
                        None
                    }
                }
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), %err, "repository index corrupt, ignoring");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), %err, "failed to read repository index, ignoring");
                None
            }
        };

        Ok(Self {
            http,
            dir,
            base_url,
            metadata: Mutex::new(metadata),
            in_flight: InFlight::default(),
        })
    }

    pub fn get_path(&self) -> &Path {
        &self.dir
    }

    async fn etag(&self) -> Option<String> {
        self.metadata.lock().await.as_ref().and_then(|m| m.etag.clone())
    }

    fn index_url(&self) -> String {
        format!("{}/packagesite.pkg", self.base_url)
    }

    fn package_url(&self, filename: &str) -> String {
        format!("{}/All/{filename}", self.base_url)
    }

    /// Conditional refresh: HEAD the index URL and compare etags unless
    /// `force`; on change (or force), GET + extract + parse + atomic
    /// replace.
    pub async fn update(&self, force: bool) -> RepositoryResult<()> {
        if !force {
            let head = self.http.head(self.index_url()).send().await?;
            let server_etag = head
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if server_etag.is_some() && server_etag == self.etag().await {
                return Ok(());
            }
        }

        let response = self.http.get(self.index_url()).send().await?.error_for_status()?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let archive_path = self.dir.join("packagesite.pkg");
        let mut file = tokio::fs::File::create(&archive_path).await?;
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);

        let packages = extract_and_parse_packagesite(&archive_path)?;

        let new_metadata = RepositoryMetadata::new(etag, packages);
        atomic_replace_bincode(&index_path(&self.dir), &new_metadata).await?;

        *self.metadata.lock().await = Some(new_metadata);

        let _ = tokio::fs::remove_file(&archive_path).await;

        Ok(())
    }

    pub async fn by_name(&self, name: &str) -> RepositoryResult<Option<PackageInfo>> {
        let guard = self.metadata.lock().await;
        let meta = guard.as_ref().ok_or(RepositoryError::Uninitialized)?;
        Ok(meta.by_name(name).cloned())
    }

    pub async fn by_namever(&self, namever: &str) -> RepositoryResult<Option<PackageInfo>> {
        let guard = self.metadata.lock().await;
        let meta = guard.as_ref().ok_or(RepositoryError::Uninitialized)?;
        Ok(meta.by_namever(namever).cloned())
    }

    pub async fn by_port(&self, port: &crate::types::Port) -> RepositoryResult<Option<PackageInfo>> {
        let guard = self.metadata.lock().await;
        let meta = guard.as_ref().ok_or(RepositoryError::Uninitialized)?;
        Ok(meta.by_port(port).cloned())
    }

    pub fn is_initialized_blocking(&self) -> bool {
        self.metadata.try_lock().map(|g| g.is_some()).unwrap_or(true)
    }

    /// Fetches `info`'s package file if not already cached, coalescing
    /// concurrent fetches of the same filename to a single network GET.
    pub async fn get_package(&self, info: &PackageInfo) -> RepositoryResult<Package> {
        let filename = info.filename();
        let final_path = self.dir.join(&filename);

        loop {
            if tokio::fs::try_exists(&final_path).await? {
                return Ok(Package { path: final_path });
            }

            let became_owner = {
                let mut fetching = self.in_flight.fetching.lock().await;
                if fetching.contains(&filename) {
                    false
                } else {
                    fetching.insert(filename.clone());
                    true
                }
            };

            if !became_owner {
                self.in_flight.notify.notified().await;
                continue;
            }

            let result = self.fetch_package_file(&filename).await;

            {
                let mut fetching = self.in_flight.fetching.lock().await;
                fetching.remove(&filename);
            }
            self.in_flight.notify.notify_waiters();

            result?;
            return Ok(Package { path: final_path });
        }
    }

    async fn fetch_package_file(&self, filename: &str) -> RepositoryResult<()> {
        let tmp_path = self.dir.join(format!("{filename}.tmp"));
        let response = self
            .http
            .get(self.package_url(filename))
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut stream = response.bytes_stream();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, self.dir.join(filename)).await?;
        Ok(())
    }
}

/// Writes `value` to `<path>.new`, fsyncs, then renames over `path` —
/// never mutates the file in place.
async fn atomic_replace_bincode<T: serde::Serialize>(path: &Path, value: &T) -> RepositoryResult<()> {
    let tmp_path = path.with_extension("new");
    let bytes = bincode::serialize(value).expect("RepositoryMetadata is always serializable");
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Extracts `packagesite.yaml` from the compressed tar archive at
/// `archive_path` and parses it as a multi-value JSON stream (one
/// object per line).
fn extract_and_parse_packagesite(archive_path: &Path) -> RepositoryResult<Vec<PackageInfo>> {
    let file = std::fs::File::open(archive_path)?;
    let decoder = flate2_or_identity(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        if path.file_name().and_then(|n| n.to_str()) == Some("packagesite.yaml") {
            let mut contents = String::new();
            std::io::Read::read_to_string(&mut entry, &mut contents)?;
            return parse_packagesite_yaml(&contents);
        }
    }
    Ok(Vec::new())
}

/// The archive is gzip-compressed per the wire protocol; small helper
/// so the tar-reading code above stays a single straight-line path.
fn flate2_or_identity(file: std::fs::File) -> impl std::io::Read {
    flate2::read::GzDecoder::new(file)
}

#[derive(serde::Deserialize)]
struct PackagesiteRecord {
    name: String,
    version: String,
    origin: String,
    #[serde(default)]
    flavor: Option<String>,
    #[serde(default)]
    pkgsize: u64,
    #[serde(default)]
    deps: Option<std::collections::HashMap<String, serde_json::Value>>,
}

fn parse_packagesite_yaml(contents: &str) -> RepositoryResult<Vec<PackageInfo>> {
    let mut packages = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: PackagesiteRecord = serde_json::from_str(line)?;
        packages.push(PackageInfo {
            name: record.name,
            version: record.version,
            origin: record.origin,
            size: record.pkgsize,
            flavor: record.flavor,
            deps: record.deps.map(|m| m.into_keys().collect()),
        });
    }
    Ok(packages)
}

/// Update policy for [`RepositoryManager::get_repository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RepositoryUpdateMode {
    Force,
    Auto,
    Disable,
}

/// Instantiates [`Repository`] instances on demand, keyed by
/// `"<system>:<release>:<arch>:<branch>"`, applying the update policy
/// and file-locking the per-repository directory during update.
pub struct RepositoryManager {
    http: reqwest::Client,
    root: PathBuf,
    remote_root: String,
    auto_update_period: Duration,
    repositories: Mutex<std::collections::HashMap<String, Arc<Repository>>>,
}

impl RepositoryManager {
    pub fn new(root: PathBuf, remote_root: String, auto_update_period: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            root,
            remote_root,
            auto_update_period,
            repositories: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn key(system: &str, release: &str, arch: &str, branch: &str) -> String {
        format!("{system}:{release}:{arch}:{branch}")
    }

    /// Returns the repository for the given ABI/branch, applying
    /// `mode`. Refuses (errors) if the repository is still
    /// uninitialized after the update attempt.
    pub async fn get_repository(
        &self,
        system: &str,
        release: &str,
        arch: &str,
        branch: &str,
        mode: RepositoryUpdateMode,
    ) -> RepositoryResult<Arc<Repository>> {
        let key = Self::key(system, release, arch, branch);

        let existing = self.repositories.lock().await.get(&key).cloned();
        let repository = match existing {
            Some(repo) => repo,
            None => {
                let dir = self.root.join(&key);
                let base_url = format!("{}/{system}:{release}:{arch}/{branch}", self.remote_root);
                let repo = Arc::new(Repository::open(self.http.clone(), dir, base_url).await?);
                self.repositories.lock().await.insert(key.clone(), repo.clone());
                repo
            }
        };

        let lock_path = repository.get_path().join("lock");
        let should_update = match mode {
            RepositoryUpdateMode::Disable => false,
            RepositoryUpdateMode::Force => true,
            RepositoryUpdateMode::Auto => {
                !repository.is_initialized_blocking()
                    || repository_age(&repository).await > self.auto_update_period
            }
        };

        if should_update {
            let _lock = file_lock(&lock_path).await?;
            repository.update(matches!(mode, RepositoryUpdateMode::Force)).await?;
        }

        if !repository.is_initialized_blocking() {
            return Err(RepositoryError::Uninitialized);
        }

        Ok(repository)
    }
}

async fn repository_age(repository: &Repository) -> Duration {
    let guard = repository.metadata.lock().await;
    match guard.as_ref() {
        Some(meta) => (chrono::Utc::now() - meta.last_update)
            .to_std()
            .unwrap_or(Duration::ZERO),
        None => Duration::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package(name: &str, origin: &str) -> PackageInfo {
        PackageInfo {
            name: name.to_string(),
            version: "1.0".to_string(),
            origin: origin.to_string(),
            size: 100,
            flavor: None,
            deps: None,
        }
    }

    #[test]
    fn parse_packagesite_yaml_handles_multi_value_json_stream() {
        let contents = r#"{"name":"curl","version":"8.1.0","origin":"ftp/curl","pkgsize":1000}
{"name":"zlib","version":"1.3","origin":"archivers/zlib","pkgsize":200,"deps":{"curl":{"origin":"ftp/curl"}}}
"#;
        let packages = parse_packagesite_yaml(contents).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "curl");
        assert_eq!(packages[1].deps, Some(vec!["curl".to_string()]));
    }

    #[tokio::test]
    async fn open_on_missing_index_is_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(
            reqwest::Client::new(),
            dir.path().join("FreeBSD:14.0-RELEASE:amd64:latest"),
            "https://pkg.freebsd.org/FreeBSD:14.0-RELEASE:amd64/latest".to_string(),
        )
        .await
        .unwrap();
        assert!(!repo.is_initialized_blocking());
        assert!(matches!(
            repo.by_name("curl").await,
            Err(RepositoryError::Uninitialized)
        ));
    }

    #[tokio::test]
    async fn open_rejects_mismatched_schema_tag() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();

        #[derive(serde::Serialize)]
        struct Bogus {
            schema_tag: String,
        }
        let bogus = Bogus {
            schema_tag: "some-other-tag".to_string(),
        };
        let bytes = bincode::serialize(&bogus).unwrap();
        tokio::fs::write(index_path(&repo_dir), bytes).await.unwrap();

        let repo = Repository::open(reqwest::Client::new(), repo_dir, "https://example.invalid".to_string())
            .await
            .unwrap();
        assert!(!repo.is_initialized_blocking());
    }

    #[tokio::test]
    async fn repository_roundtrip_via_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let repo_dir = dir.path().join("repo");
        tokio::fs::create_dir_all(&repo_dir).await.unwrap();

        let packages = vec![sample_package("curl", "ftp/curl"), sample_package("zlib", "archivers/zlib")];
        let metadata = RepositoryMetadata::new(Some("etag-1".to_string()), packages);
        atomic_replace_bincode(&index_path(&repo_dir), &metadata).await.unwrap();

        let repo = Repository::open(
            reqwest::Client::new(),
            repo_dir,
            "https://example.invalid".to_string(),
        )
        .await
        .unwrap();

        assert!(repo.is_initialized_blocking());
        assert_eq!(repo.by_name("curl").await.unwrap().unwrap().origin, "ftp/curl");
        assert_eq!(
            repo.by_namever("zlib-1.0").await.unwrap().unwrap().name,
            "zlib"
        );
    }
}
