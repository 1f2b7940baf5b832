//! Server and cluster definitions.
//!
//! These are value-like views handed to the library by a [`Repository`](crate::repository::Repository).
//! The launch options of a server are split into a typed core (the options the
//! library reads or injects itself) and a validated passthrough map for every
//! other `mongod` option.

use crate::error::{Error, Result};
use crate::executable::MongoVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Port used when neither the address nor the launch options name one.
pub const DEFAULT_PORT: u16 = 27017;

/// PID file written by the server, inside its data directory.
pub const PID_FILE_NAME: &str = "pid.txt";

/// Log file written by the server, inside its data directory.
pub const LOG_FILE_NAME: &str = "mongodb.log";

/// Shared replication key file, inside the data directory.
pub const KEY_FILE_NAME: &str = "keyFile";

/// Servers older than this are rejected.
pub const MIN_SUPPORTED_VERSION: &str = "1.8";

/// First version that understands `--keyFile` for replica set authentication.
pub const REPL_KEY_SUPPORTED_VERSION: &str = "2.0.0";

/// Value of a passthrough launch option.
///
/// Only scalars are accepted; nested documents or arrays in the option map
/// are rejected at deserialization time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Flag option, rendered bare when `true` and omitted when `false`.
    Bool(bool),
    /// Integer option.
    Int(i64),
    /// Floating point option.
    Float(f64),
    /// String option, omitted when empty.
    Text(String),
}

impl OptionValue {
    /// Renders the option as `mongod` arguments, or nothing when the value is falsy.
    pub fn to_args(&self, name: &str) -> Vec<String> {
        let flag = format!("--{}", name);
        match self {
            OptionValue::Bool(true) => vec![flag],
            OptionValue::Bool(false) => Vec::new(),
            OptionValue::Text(s) if s.is_empty() => Vec::new(),
            OptionValue::Text(s) => vec![flag, s.clone()],
            OptionValue::Int(i) => vec![flag, i.to_string()],
            OptionValue::Float(f) => vec![flag, f.to_string()],
        }
    }

    /// Boolean reading of the value, if it is a flag.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

impl From<&Path> for OptionValue {
    fn from(value: &Path) -> Self {
        OptionValue::Text(value.display().to_string())
    }
}

/// Launch options of a server (`cmdOptions` in server definitions).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Data directory. Required.
    pub dbpath: Option<PathBuf>,
    /// Listening port.
    pub port: Option<u16>,
    /// Whether clients must authenticate.
    #[serde(default)]
    pub auth: bool,
    /// Replication key file.
    #[serde(rename = "keyFile")]
    pub key_file: Option<PathBuf>,
    /// Run detached from the controller's console.
    pub fork: Option<bool>,
    /// PID file location.
    #[serde(rename = "pidfilepath")]
    pub pid_file_path: Option<PathBuf>,
    /// Log file location.
    #[serde(rename = "logpath")]
    pub log_path: Option<PathBuf>,
    /// Replica set name.
    #[serde(rename = "replSet")]
    pub repl_set: Option<String>,
    /// Every other option, passed through to `mongod` verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, OptionValue>,
}

impl LaunchOptions {
    /// Sets an option by its `mongod` name, routing typed options to their fields.
    pub fn set(&mut self, name: &str, value: OptionValue) -> Result<()> {
        let text = |value: &OptionValue| match value {
            OptionValue::Text(s) => Ok(s.clone()),
            other => Err(Error::Configuration(format!(
                "Option '{}' expects a string, got {:?}",
                name, other
            ))),
        };
        match name {
            "dbpath" => self.dbpath = Some(PathBuf::from(text(&value)?)),
            "keyFile" => self.key_file = Some(PathBuf::from(text(&value)?)),
            "pidfilepath" => self.pid_file_path = Some(PathBuf::from(text(&value)?)),
            "logpath" => self.log_path = Some(PathBuf::from(text(&value)?)),
            "replSet" => self.repl_set = Some(text(&value)?),
            "auth" => {
                self.auth = value.as_bool().ok_or_else(|| {
                    Error::Configuration("Option 'auth' expects a boolean".to_string())
                })?
            }
            "fork" => {
                self.fork = Some(value.as_bool().ok_or_else(|| {
                    Error::Configuration("Option 'fork' expects a boolean".to_string())
                })?)
            }
            "port" => match value {
                OptionValue::Int(p) => {
                    self.port = Some(u16::try_from(p).map_err(|_| {
                        Error::Configuration(format!("Port {} is out of range", p))
                    })?)
                }
                other => {
                    return Err(Error::Configuration(format!(
                        "Option 'port' expects an integer, got {:?}",
                        other
                    )));
                }
            },
            _ => {
                self.extra.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    /// All options keyed by their `mongod` name, sorted.
    pub fn to_option_map(&self) -> BTreeMap<String, OptionValue> {
        let mut map = self.extra.clone();
        if let Some(dbpath) = &self.dbpath {
            map.insert("dbpath".to_string(), dbpath.as_path().into());
        }
        if let Some(port) = self.port {
            map.insert("port".to_string(), OptionValue::Int(i64::from(port)));
        }
        if self.auth {
            map.insert("auth".to_string(), OptionValue::Bool(true));
        }
        if let Some(key_file) = &self.key_file {
            map.insert("keyFile".to_string(), key_file.as_path().into());
        }
        if let Some(fork) = self.fork {
            map.insert("fork".to_string(), OptionValue::Bool(fork));
        }
        if let Some(pid) = &self.pid_file_path {
            map.insert("pidfilepath".to_string(), pid.as_path().into());
        }
        if let Some(log) = &self.log_path {
            map.insert("logpath".to_string(), log.as_path().into());
        }
        if let Some(repl_set) = &self.repl_set {
            map.insert("replSet".to_string(), OptionValue::Text(repl_set.clone()));
        }
        map
    }
}

/// Database user credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCredential {
    /// User name.
    pub username: String,
    /// Clear-text password.
    pub password: String,
}

impl fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A MongoDB server definition.
///
/// # Examples
///
/// ```
/// use mongo_runner::model::Server;
///
/// let server: Server = serde_json::from_str(r#"{
///     "_id": "alpha",
///     "address": "localhost:28017",
///     "cmdOptions": { "dbpath": "/data/alpha", "port": 28017, "journal": true }
/// }"#).unwrap();
///
/// assert_eq!(server.port(), 28017);
/// assert_eq!(server.address().as_deref(), Some("localhost:28017"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Unique server id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// `host` or `host:port`. Absent means the server is local.
    #[serde(default)]
    pub address: Option<String>,
    /// Declared version constraint.
    #[serde(rename = "mongoVersion", default)]
    pub version: Option<String>,
    /// Launch options.
    #[serde(rename = "cmdOptions", default)]
    pub options: LaunchOptions,
    /// Users keyed by database name.
    #[serde(default)]
    pub users: BTreeMap<String, Vec<UserCredential>>,
}

impl Server {
    /// Creates a local server with only a data directory configured.
    pub fn new(id: impl Into<String>, dbpath: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            description: None,
            address: None,
            version: None,
            options: LaunchOptions {
                dbpath: Some(dbpath.into()),
                ..LaunchOptions::default()
            },
            users: BTreeMap::new(),
        }
    }

    /// Listening port, defaulting to 27017.
    pub fn port(&self) -> u16 {
        self.options.port.unwrap_or(DEFAULT_PORT)
    }

    /// Full `host:port` address, if an address is configured.
    pub fn address(&self) -> Option<String> {
        self.address.as_ref().map(|address| {
            if address.contains(':') {
                address.clone()
            } else {
                format!("{}:{}", address, self.port())
            }
        })
    }

    /// Host part of the configured address.
    pub fn host(&self) -> Option<&str> {
        self.address
            .as_deref()
            .map(|address| address.split(':').next().unwrap_or(address))
    }

    /// Loopback address used when the server runs on this machine.
    pub fn local_address(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    /// Whether clients must authenticate.
    pub fn is_auth(&self) -> bool {
        self.options.auth || self.options.key_file.is_some()
    }

    /// Data directory.
    pub fn db_path(&self) -> Result<&Path> {
        self.options.dbpath.as_deref().ok_or_else(|| {
            Error::Configuration(format!("Server '{}' has no dbpath configured", self.id))
        })
    }

    /// PID file path: the configured `pidfilepath`, else `pid.txt` in the data directory.
    pub fn pid_file_path(&self) -> Result<PathBuf> {
        match &self.options.pid_file_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.db_path()?.join(PID_FILE_NAME)),
        }
    }

    /// Log file path: the configured `logpath`, else `mongodb.log` in the data directory.
    pub fn log_file_path(&self) -> Result<PathBuf> {
        match &self.options.log_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.db_path()?.join(LOG_FILE_NAME)),
        }
    }

    /// Location of the generated replication key file.
    pub fn key_file_path(&self) -> Result<PathBuf> {
        Ok(self.db_path()?.join(KEY_FILE_NAME))
    }

    /// Parsed declared version, if any.
    pub fn declared_version(&self) -> Result<Option<MongoVersion>> {
        self.version
            .as_deref()
            .map(|v| {
                v.parse::<MongoVersion>().map_err(|_| {
                    Error::Configuration(format!(
                        "Invalid mongoVersion value '{}' for server '{}'",
                        v, self.id
                    ))
                })
            })
            .transpose()
    }

    /// Users configured for a database.
    pub fn db_users(&self, dbname: &str) -> &[UserCredential] {
        self.users.get(dbname).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Users configured for the `admin` database.
    pub fn admin_users(&self) -> &[UserCredential] {
        self.db_users("admin")
    }

    /// Whether this server needs the cluster's shared key file.
    ///
    /// True when auth is on, the server is a replica set member and its
    /// declared version is absent or recent enough to support key files.
    pub fn needs_repl_key(&self, is_cluster_member: bool) -> bool {
        if !self.is_auth() || !is_cluster_member {
            return false;
        }
        match self.declared_version() {
            Ok(Some(version)) => REPL_KEY_SUPPORTED_VERSION
                .parse::<MongoVersion>()
                .map(|min| version >= min)
                .unwrap_or(true),
            _ => true,
        }
    }
}

/// A replica set member definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Id of the server backing this member.
    #[serde(default)]
    pub server: Option<String>,
    /// Explicit `host:port`, used instead of the server's address.
    #[serde(default)]
    pub host: Option<String>,
    /// Election priority. Zero means the member can never be primary.
    #[serde(default)]
    pub priority: Option<f64>,
    /// Voting-only member holding no data.
    #[serde(rename = "arbiterOnly", default)]
    pub arbiter_only: bool,
    /// Other replica set member fields (`votes`, `tags`, ...), passed through verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Member {
    /// Member backed by a server definition.
    pub fn for_server(server_id: impl Into<String>) -> Self {
        Self {
            server: Some(server_id.into()),
            ..Self::default()
        }
    }

    /// Member known only by its host string.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::default()
        }
    }

    /// Whether this member may be elected primary.
    pub fn can_become_primary(&self) -> bool {
        !self.arbiter_only && self.priority != Some(0.0)
    }
}

/// A replica set cluster definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster id, also the replica set name.
    #[serde(rename = "_id")]
    pub id: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Members of the set.
    #[serde(default)]
    pub members: Vec<Member>,
    /// Shared replication key.
    #[serde(rename = "replKey", default)]
    pub repl_key: Option<String>,
}

impl Cluster {
    /// Member definition for a server, if the server belongs to this cluster.
    pub fn member_for(&self, server_id: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.server.as_deref() == Some(server_id))
    }

    /// Whether a server belongs to this cluster.
    pub fn has_member_server(&self, server_id: &str) -> bool {
        self.member_for(server_id).is_some()
    }
}
