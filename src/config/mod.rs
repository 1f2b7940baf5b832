//! Configuration module for Mongo Runner.
//!
//! This module holds the runner's own settings (executable search roots and
//! timeouts) and the validation rules applied to server and cluster
//! definitions before any side effect happens.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use mongo_runner::config::RunnerConfig;
//!
//! let config = RunnerConfig::from_file("runner.yaml").unwrap().with_env_overrides();
//! println!("Start timeout: {:?}", config.timeouts.start);
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use mongo_runner::config::{RunnerConfig, Timeouts};
//! use std::time::Duration;
//!
//! let config = RunnerConfig {
//!     mongo_home: Some("/opt/mongodb".into()),
//!     mongo_versions: None,
//!     timeouts: Timeouts {
//!         start: Duration::from_secs(60),
//!         ..Timeouts::default()
//!     },
//! };
//! assert_eq!(config.timeouts.graceful_stop, Duration::from_secs(3));
//! ```
mod parser;
pub mod validator;

pub use parser::{MONGO_HOME_ENV, MONGO_VERSIONS_ENV, RunnerConfig, Timeouts};
pub use validator::{validate_cluster, validate_server};
