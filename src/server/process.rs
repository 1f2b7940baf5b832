// src/server/process.rs
use crate::error::{Error, Result};
use crate::executable::SERVER_EXECUTABLE;
use crate::model::{Cluster, OptionValue, Server};
use crate::server::limits;
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Signals used to stop a server process, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Asks the server to exit (`SIGHUP`).
    Hangup,
    /// Terminates the process unconditionally (`SIGKILL`).
    Kill,
}

impl StopSignal {
    fn as_signal(self) -> Signal {
        match self {
            StopSignal::Hangup => Signal::SIGHUP,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// A fully rendered server command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Server executable.
    pub program: PathBuf,
    /// Arguments, sorted by option name.
    pub args: Vec<String>,
    /// Whether the server runs detached from the controller's console.
    pub detached: bool,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Whether a start runs the server detached.
///
/// An explicit `fork` override wins over the server's option; detached is the default.
pub fn is_detached(server: &Server, overrides: &BTreeMap<String, OptionValue>) -> bool {
    overrides
        .get("fork")
        .and_then(OptionValue::as_bool)
        .or(server.options.fork)
        .unwrap_or(true)
}

/// Renders the launch command of a server.
///
/// Injects the PID file, the log file when detached, and for cluster members
/// the replica set name and the key file when one is needed. Overrides are
/// applied last, except `fork` which only selects detached mode.
pub fn build_launch_command(
    server: &Server,
    cluster: Option<&Cluster>,
    program: PathBuf,
    overrides: &BTreeMap<String, OptionValue>,
) -> Result<LaunchCommand> {
    let detached = is_detached(server, overrides);
    let mut options = server.options.clone();

    if options.pid_file_path.is_none() {
        options.pid_file_path = Some(server.pid_file_path()?);
    }
    if detached && options.log_path.is_none() {
        options.log_path = Some(server.log_file_path()?);
    }
    if let Some(cluster) = cluster {
        options.repl_set.get_or_insert_with(|| cluster.id.clone());
        if server.needs_repl_key(true) && options.key_file.is_none() {
            options.key_file = Some(server.key_file_path()?);
        }
    }
    for (name, value) in overrides {
        if name != "fork" {
            options.set(name, value.clone())?;
        }
    }

    let mut map = options.to_option_map();
    // detaching is done by the controller, never by mongod itself
    map.remove("fork");

    let args = map
        .iter()
        .flat_map(|(name, value)| value.to_args(name))
        .collect();

    Ok(LaunchCommand {
        program,
        args,
        detached,
    })
}

/// Creates the data directory. Returns whether it already existed.
pub fn ensure_data_dir(server: &Server) -> Result<bool> {
    let dbpath = server.db_path()?;
    if dbpath.is_dir() {
        return Ok(true);
    }
    debug!(path = %dbpath.display(), "Creating data directory");
    std::fs::create_dir_all(dbpath)?;
    Ok(false)
}

/// Writes the cluster's replication key into the server's key file, unless
/// the file already exists. The file is left readable by the owner only.
pub fn ensure_key_file(server: &Server, cluster: &Cluster) -> Result<PathBuf> {
    let key = cluster.repl_key.as_deref().ok_or_else(|| {
        Error::Configuration(format!("Cluster '{}' has no replKey", cluster.id))
    })?;
    let path = server.key_file_path()?;
    if path.exists() {
        return Ok(path);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(key.as_bytes())?;
    drop(file);
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400))?;
    debug!(path = %path.display(), "Wrote replication key file");
    Ok(path)
}

/// Reads the PID recorded by a server. Missing or malformed files yield `None`.
pub fn read_pid(server: &Server) -> Option<u32> {
    let path = server.pid_file_path().ok()?;
    let content = std::fs::read_to_string(&path).ok()?;
    content.trim().parse().ok()
}

/// A spawned server process.
#[async_trait]
pub trait ServerChild: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Exit status if the process has exited, without blocking.
    fn try_exited(&mut self) -> Result<Option<ExitStatus>>;

    /// Waits for the process to exit.
    async fn wait(&mut self) -> Result<ExitStatus>;

    /// Kills the process.
    fn terminate(&mut self) -> Result<()>;
}

/// Operating system side of the lifecycle: spawning, signalling and log tailing.
pub trait ProcessControl: Send + Sync {
    /// Spawns the server command.
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn ServerChild>>;

    /// Sends a stop signal to a process.
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()>;

    /// Whether a process exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Starts echoing a log file to the console until the guard is dropped.
    fn tail_log(&self, path: &Path) -> LogTail;
}

/// Echoes a log file while held.
#[derive(Debug, Default)]
pub struct LogTail {
    child: Option<Child>,
}

impl LogTail {
    /// A guard that tails nothing.
    pub fn inactive() -> Self {
        Self { child: None }
    }

    /// Stops tailing. Errors are ignored.
    pub fn stop(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

struct SpawnedServer {
    child: Child,
}

#[async_trait]
impl ServerChild for SpawnedServer {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exited(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(self.child.start_kill()?)
    }
}

/// [`ProcessControl`] for the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl ProcessControl for SystemProcessControl {
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn ServerChild>> {
        limits::log_process_limits();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args).stdin(Stdio::null());
        if command.detached {
            // keep the server alive when the controller's terminal goes away
            cmd.stdout(Stdio::null()).process_group(0);
        }
        // SAFETY: the hook only calls getrlimit/setrlimit, which are async-signal-safe.
        unsafe {
            cmd.pre_exec(limits::apply_process_limits);
        }

        let child = cmd.spawn().map_err(|e| {
            Error::lifecycle_caused(
                format!("Failed to start {} process", SERVER_EXECUTABLE),
                Error::Io(e),
            )
        })?;
        debug!(pid = ?child.id(), "Spawned server process");
        Ok(Box::new(SpawnedServer { child }))
    }

    fn signal(&self, pid: u32, stop: StopSignal) -> Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| Error::lifecycle(format!("Invalid pid {}", pid)))?;
        signal::kill(Pid::from_raw(pid), stop.as_signal())
            .map_err(|e| Error::Io(e.into()))
    }

    fn is_alive(&self, pid: u32) -> bool {
        match i32::try_from(pid) {
            Ok(pid) => signal::kill(Pid::from_raw(pid), None).is_ok(),
            Err(_) => false,
        }
    }

    fn tail_log(&self, path: &Path) -> LogTail {
        if let Err(e) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            warn!(path = %path.display(), error = %e, "Unable to create log file for tailing");
            return LogTail::inactive();
        }
        match Command::new("tail")
            .arg("-f")
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => LogTail { child: Some(child) },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to tail log file");
                LogTail::inactive()
            }
        }
    }
}
