/// Server management module for Mongo Runner.
///
/// This module handles starting, stopping and observing local `mongod`
/// processes. All public operations are instrumented with `tracing` spans.
///
/// # Components
///
/// * `lifecycle` - Start, stop, restart and status of a server
/// * `monitor` - Server state classification and the bounded polling primitive
/// * `process` - Command line rendering, on-disk files and OS process control
/// * `limits` - Resource limits negotiated for spawned servers
///
/// # Examples
///
/// Rendering a launch command:
///
/// ```
/// use mongo_runner::model::Server;
/// use mongo_runner::server::build_launch_command;
/// use std::collections::BTreeMap;
///
/// let mut server = Server::new("alpha", "/data/alpha");
/// server.options.port = Some(28017);
///
/// let command = build_launch_command(&server, None, "/usr/bin/mongod".into(), &BTreeMap::new()).unwrap();
/// assert_eq!(
///     command.args,
///     vec![
///         "--dbpath", "/data/alpha",
///         "--logpath", "/data/alpha/mongodb.log",
///         "--pidfilepath", "/data/alpha/pid.txt",
///         "--port", "28017",
///     ]
/// );
/// assert!(command.detached);
/// ```
pub mod lifecycle;
pub mod limits;
pub mod monitor;
mod process;

pub use lifecycle::{
    LifecycleController, ServerStatus, StartOptions, StartOutcome, StopOptions, StopOutcome,
};
pub use monitor::{ServerState, wait_for};
pub use process::{
    LaunchCommand, LogTail, ProcessControl, ServerChild, StopSignal, SystemProcessControl,
    build_launch_command, ensure_data_dir, ensure_key_file, is_detached, read_pid,
};
