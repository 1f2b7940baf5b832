//! Discovery and selection of MongoDB executables.
//!
//! Candidates are collected from the search path, from `<mongo_home>/bin` and
//! from every `<mongo_versions>/*/bin`. Each candidate is asked for its version
//! with `--version`; candidates that fail to answer are skipped with a warning.
//! Selection itself is a pure function over the candidate list, see [`select`].
//!
//! # Examples
//!
//! ```
//! use mongo_runner::executable::{Candidate, MongoVersion, VersionPolicy, select};
//!
//! let candidates: Vec<Candidate> = ["1.8.0", "2.0.1", "2.1.0"]
//!     .iter()
//!     .map(|v| Candidate {
//!         path: format!("/opt/{}/bin/mongod", v).into(),
//!         version: v.parse().unwrap(),
//!     })
//!     .collect();
//!
//! let picked = select(&candidates, None, VersionPolicy::LatestStable).unwrap();
//! assert_eq!(picked.version, "2.0.1".parse::<MongoVersion>().unwrap());
//! ```
mod version;

pub use version::MongoVersion;

use crate::config::{MONGO_HOME_ENV, MONGO_VERSIONS_ENV, RunnerConfig};
use crate::error::{Error, Result};
use crate::model::Server;
use std::env;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Server executable name.
pub const SERVER_EXECUTABLE: &str = "mongod";

/// Shell executable name.
pub const SHELL_EXECUTABLE: &str = "mongo";

/// How a requested version is matched against candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Same version, suffix included.
    Exact,
    /// Major version at least the requested one; the smallest such candidate wins.
    MajorGreaterOrEqual,
    /// Newest stable candidate, ignoring the requested version.
    LatestStable,
    /// Used when no version is requested: behaves like [`VersionPolicy::LatestStable`].
    Default,
}

/// An executable together with the version it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Location of the executable.
    pub path: PathBuf,
    /// Reported version.
    pub version: MongoVersion,
}

/// Picks the executable satisfying a request.
///
/// A missing request always uses the default policy. The default and
/// latest-stable policies take the newest candidate with an even minor
/// version, or the newest candidate overall when none is stable.
pub fn select<'a>(
    candidates: &'a [Candidate],
    requested: Option<&MongoVersion>,
    policy: VersionPolicy,
) -> Option<&'a Candidate> {
    let policy = if requested.is_none() {
        VersionPolicy::Default
    } else {
        policy
    };

    match (policy, requested) {
        (VersionPolicy::Exact, Some(requested)) => {
            candidates.iter().find(|c| &c.version == requested)
        }
        (VersionPolicy::MajorGreaterOrEqual, Some(requested)) => candidates
            .iter()
            .filter(|c| c.version.major() >= requested.major())
            .min_by(|a, b| a.version.cmp(&b.version)),
        _ => latest_stable(candidates),
    }
}

fn latest_stable(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .filter(|c| c.version.is_stable())
        .max_by(|a, b| a.version.cmp(&b.version))
        .or_else(|| candidates.iter().max_by(|a, b| a.version.cmp(&b.version)))
}

/// Finds executables on this machine.
#[derive(Debug, Clone)]
pub struct ExecutableResolver {
    search_path: Option<OsString>,
    mongo_home: Option<PathBuf>,
    mongo_versions: Option<PathBuf>,
}

impl ExecutableResolver {
    /// Resolver using the process search path and the configured install roots.
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            search_path: env::var_os("PATH"),
            mongo_home: config.mongo_home.clone(),
            mongo_versions: config.mongo_versions.clone(),
        }
    }

    /// Replaces the search path.
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Every location that may hold an executable called `name`, deduplicated.
    pub fn candidate_paths(&self, name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(search_path) = &self.search_path {
            if let Some(found) = env::split_paths(search_path)
                .map(|dir| dir.join(name))
                .find(|p| is_executable(p))
            {
                paths.push(found);
            }
        }

        if let Some(home) = &self.mongo_home {
            let exe = home.join("bin").join(name);
            if is_executable(&exe) {
                paths.push(exe);
            }
        }

        if let Some(root) = &self.mongo_versions {
            match std::fs::read_dir(root) {
                Ok(entries) => {
                    let mut versioned: Vec<PathBuf> = entries
                        .filter_map(|entry| entry.ok())
                        .map(|entry| entry.path().join("bin").join(name))
                        .filter(|p| is_executable(p))
                        .collect();
                    versioned.sort();
                    paths.extend(versioned);
                }
                Err(e) => debug!(root = %root.display(), error = %e, "Cannot read versions root"),
            }
        }

        let mut seen = Vec::new();
        paths.retain(|p| {
            let key = std::fs::canonicalize(p).unwrap_or_else(|_| p.clone());
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        });
        paths
    }

    /// Runs `--version` on every candidate location of `name`.
    #[tracing::instrument(skip(self))]
    pub async fn discover(&self, name: &str) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for path in self.candidate_paths(name) {
            match reported_version(&path).await {
                Ok(Some(version)) => {
                    debug!(path = %path.display(), %version, "Found executable");
                    candidates.push(Candidate { path, version });
                }
                Ok(None) => {
                    warn!(path = %path.display(), "Unable to determine version of executable")
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unable to run executable")
                }
            }
        }
        candidates
    }

    /// Resolves `name` for a requested version and policy.
    pub async fn resolve(
        &self,
        name: &str,
        requested: Option<&MongoVersion>,
        policy: VersionPolicy,
    ) -> Result<PathBuf> {
        let candidates = self.discover(name).await;
        select(&candidates, requested, policy)
            .map(|c| c.path.clone())
            .ok_or_else(|| self.not_found(name, requested))
    }

    /// Server executable matching the server's declared version exactly.
    pub async fn resolve_server(&self, server: &Server) -> Result<PathBuf> {
        let requested = server.declared_version()?;
        self.resolve(SERVER_EXECUTABLE, requested.as_ref(), VersionPolicy::Exact)
            .await
    }

    /// Shell executable compatible with the server's declared version.
    pub async fn resolve_shell(&self, server: &Server) -> Result<PathBuf> {
        let requested = server.declared_version()?;
        self.resolve(
            SHELL_EXECUTABLE,
            requested.as_ref(),
            VersionPolicy::MajorGreaterOrEqual,
        )
        .await
    }

    fn not_found(&self, name: &str, requested: Option<&MongoVersion>) -> Error {
        let wanted = match requested {
            Some(version) => format!("'{}' version '{}'", name, version),
            None => format!("'{}'", name),
        };
        let show = |value: Option<&Path>| {
            value
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unset>".to_string())
        };
        Error::Resolution(format!(
            "Unable to find a compatible {} executable. Searched PATH={}, {}={}, {}={}",
            wanted,
            self.search_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "<unset>".to_string()),
            MONGO_HOME_ENV,
            show(self.mongo_home.as_deref()),
            MONGO_VERSIONS_ENV,
            show(self.mongo_versions.as_deref()),
        ))
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

async fn reported_version(path: &Path) -> Result<Option<MongoVersion>> {
    let output = Command::new(path).arg("--version").output().await?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(MongoVersion::from_version_output(&text))
}
