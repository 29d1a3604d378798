//! YAML configuration file: the `jails` mapping referenced by `-j/--jails`.
//!
//! Grounded in `reprise.config.load_config`: search
//! `$XDG_CONFIG_HOME/reprise/reprise.conf`, then
//! `$HOME/.config/reprise/reprise.conf`, then a compile-time etc
//! fallback; a missing file is not an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named jail as declared in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailSpecConfig {
    pub version: String,
    pub arch: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub jails: HashMap<String, JailSpecConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// The Rust-native analogue of the ancestor's `%%ETCDIR%%` port
/// substitution: this crate has no install-time templating step, so
/// the fallback path is a fixed constant instead.
const FALLBACK_ETC_PATH: &str = "/usr/local/etc/reprise/reprise.conf";

/// Candidate config paths, in search order.
fn candidate_paths() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        candidates.push(PathBuf::from(xdg_config_home).join("reprise/reprise.conf"));
    }
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config/reprise/reprise.conf"));
    }
    candidates.push(PathBuf::from(FALLBACK_ETC_PATH));
    candidates
}

/// Loads `path` if given, otherwise searches [`candidate_paths`] for
/// the first existing file. No config file found yields
/// `Config::default()`, matching the original's behavior.
pub fn load_config(path: Option<&Path>) -> ConfigResult<Config> {
    let resolved = match path {
        Some(p) => Some(p.to_path_buf()),
        None => candidate_paths().into_iter().find(|p| p.exists()),
    };

    let Some(path) = resolved else {
        return Ok(Config::default());
    };

    tracing::debug!(path = %path.display(), "loading config");
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    if contents.trim().is_empty() {
        return Ok(Config::default());
    }

    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_missing_path_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nonexistent.conf"))).unwrap_err();
        assert!(matches!(config, ConfigError::Read { .. }));
    }

    #[test]
    fn load_config_parses_jails_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reprise.conf");
        std::fs::write(
            &path,
            "jails:\n  140amd64:\n    version: \"14.0-RELEASE\"\n    arch: amd64\n    tags: [stable]\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        let jail = config.jails.get("140amd64").unwrap();
        assert_eq!(jail.version, "14.0-RELEASE");
        assert_eq!(jail.arch, "amd64");
        assert_eq!(jail.tags, vec!["stable".to_string()]);
    }

    #[test]
    fn load_config_empty_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.conf");
        std::fs::write(&path, "").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(config.jails.is_empty());
    }
}
