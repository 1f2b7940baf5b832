use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a MongoDB install whose `bin/` is searched for executables.
pub const MONGO_HOME_ENV: &str = "MONGO_HOME";

/// Environment variable naming a directory of versioned installs (`<root>/<name>/bin/`).
pub const MONGO_VERSIONS_ENV: &str = "MONGO_VERSIONS";

/// Timeouts and polling intervals used by lifecycle and replica set operations.
///
/// Durations are written as (fractional) seconds in configuration files.
///
/// ```
/// use mongo_runner::config::Timeouts;
/// use std::time::Duration;
///
/// let timeouts = Timeouts::default();
/// assert_eq!(timeouts.start, Duration::from_secs(300));
/// assert_eq!(timeouts.graceful_stop, Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// How long to wait for a spawned server to accept connections.
    #[serde(with = "secs")]
    pub start: Duration,
    /// How long to wait after a shutdown command.
    #[serde(with = "secs")]
    pub graceful_stop: Duration,
    /// How long to wait after each signal during a forceful stop.
    #[serde(with = "secs")]
    pub forceful_stop: Duration,
    /// How long to wait for a replica set to report itself initialized.
    #[serde(with = "secs")]
    pub replica_set_init: Duration,
    /// How long to wait for the elected primary to confirm it.
    #[serde(with = "secs")]
    pub primary_election: Duration,
    /// Polling interval for process and server waits.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Polling interval for replica set waits.
    #[serde(with = "secs")]
    pub replica_poll_interval: Duration,
    /// Connection timeout for probes and commands.
    #[serde(with = "secs")]
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start: Duration::from_secs(300),
            graceful_stop: Duration::from_secs(3),
            forceful_stop: Duration::from_secs(3),
            replica_set_init: Duration::from_secs(60),
            primary_election: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            replica_poll_interval: Duration::from_secs(1),
            connect: Duration::from_secs(10),
        }
    }
}

/// Settings of the runner itself.
///
/// Server and cluster definitions are not part of this file; they come from a
/// [`Repository`](crate::repository::Repository).
///
/// # JSON Schema
///
/// ```json
/// {
///   "mongoHome": "/opt/mongodb",
///   "mongoVersions": "/opt/mongodb-versions",
///   "timeouts": {
///     "start": 300,
///     "gracefulStop": 3,
///     "pollInterval": 2
///   }
/// }
/// ```
///
/// # Examples
///
/// ```
/// use mongo_runner::config::RunnerConfig;
///
/// let config = RunnerConfig::parse_from_str(r#"{ "mongoHome": "/opt/mongodb" }"#).unwrap();
/// assert_eq!(config.mongo_home.as_deref(), Some(std::path::Path::new("/opt/mongodb")));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// MongoDB install searched for executables under `bin/`.
    #[serde(default)]
    pub mongo_home: Option<PathBuf>,

    /// Root of versioned installs searched under `*/bin/`.
    #[serde(default)]
    pub mongo_versions: Option<PathBuf>,

    /// Timeouts and polling intervals.
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl RunnerConfig {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON or YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_from_yaml_str(&content),
            _ => Self::parse_from_str(&content),
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Fills `mongo_home` and `mongo_versions` from the environment when the
    /// file left them unset.
    pub fn with_env_overrides(mut self) -> Self {
        if self.mongo_home.is_none() {
            self.mongo_home = env::var_os(MONGO_HOME_ENV).map(PathBuf::from);
        }
        if self.mongo_versions.is_none() {
            self.mongo_versions = env::var_os(MONGO_VERSIONS_ENV).map(PathBuf::from);
        }
        self
    }
}

mod secs {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
