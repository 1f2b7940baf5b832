/// Error handling module for Mongo Runner.
///
/// This module defines the error types used throughout the library.
/// Every failure reaches the caller through this one enum, carrying a
/// message and, for lifecycle and cluster failures, the underlying cause.
///
/// # Example
///
/// ```
/// use mongo_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::Configuration(msg)) => println!("Fix your configuration: {}", msg),
///         Err(Error::Lifecycle { message, .. }) => println!("Check the server log: {}", message),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the mongo-runner library.
///
/// Configuration, locality and resolution errors are raised before any
/// process is spawned or command sent. Lifecycle and cluster errors may be
/// raised after side effects already happened; the server is left as it is.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse runner configuration from a file or string.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// A server or cluster definition is missing fields or holds invalid values.
    ///
    /// This error occurs when:
    /// - A server has no data directory
    /// - A declared version is unparsable or unsupported
    /// - Authentication is enabled but required users are missing
    /// - A cluster with authenticated members has no replication key
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// An operation that must run on the server's own host was requested
    /// against a server whose address is not local.
    #[error("Locality error: {0}")]
    Locality(String),

    /// No compatible server or shell executable could be found.
    #[error("Unable to resolve executable: {0}")]
    Resolution(String),

    /// Starting or stopping a server failed or did not converge.
    #[error("{message}")]
    Lifecycle {
        /// What went wrong, in operator terms.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Initializing or reconfiguring a replica set failed.
    #[error("{message}")]
    Cluster {
        /// What went wrong, in operator terms.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Requested server was not found in the repository.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Requested cluster was not found in the repository.
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// A server replied to an administrative command with an error.
    #[error("Command error: {0}")]
    Command(String),

    /// Error in serializing or deserializing configuration documents.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error reported by the MongoDB driver.
    #[error("Driver error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// Filesystem or process I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Lifecycle error without an underlying cause.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Error::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Lifecycle error wrapping the error that caused it.
    pub fn lifecycle_caused(message: impl Into<String>, cause: Error) -> Self {
        Error::Lifecycle {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Cluster error without an underlying cause.
    pub fn cluster(message: impl Into<String>) -> Self {
        Error::Cluster {
            message: message.into(),
            source: None,
        }
    }

    /// Cluster error wrapping the error that caused it.
    pub fn cluster_caused(message: impl Into<String>, cause: Error) -> Self {
        Error::Cluster {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }
}

impl From<mongodb::bson::de::Error> for Error {
    fn from(e: mongodb::bson::de::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<mongodb::bson::ser::Error> for Error {
    fn from(e: mongodb::bson::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type for mongo-runner operations.
pub type Result<T> = std::result::Result<T, Error>;
