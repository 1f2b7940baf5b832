// Shared fakes for the integration test crates. Not every crate uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use mongo_runner::MongoRunner;
use mongo_runner::client::{CommandReply, Connector, Probe, ServerConnection};
use mongo_runner::config::{RunnerConfig, Timeouts};
use mongo_runner::context::{ConfirmPolicy, ExecutionContext};
use mongo_runner::error::Result;
use mongo_runner::executable::ExecutableResolver;
use mongo_runner::model::Server;
use mongo_runner::repository::{InMemoryRepository, UserProvisioner};
use mongo_runner::server::{LaunchCommand, LogTail, ProcessControl, ServerChild, StopSignal};
use mongodb::bson::{Bson, Document, doc};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the fakes know about the simulated machine and its servers.
#[derive(Debug, Default)]
pub struct World {
    /// Probe answer per server id; missing means refused.
    pub probes: HashMap<String, Probe>,
    /// Server currently primary.
    pub primary: Option<String>,
    /// Replica set configuration shared by all members.
    pub replset: Option<Document>,
    /// Admin commands received, with the id of the server they were sent to.
    pub commands: Vec<(String, Document)>,
    /// Commands passed to spawn.
    pub spawned: Vec<LaunchCommand>,
    /// Signals sent, in order.
    pub signals: Vec<(u32, StopSignal)>,
    /// Live process ids.
    pub alive: HashSet<u32>,
    /// Server id per listening port.
    pub ports: HashMap<u16, String>,
    /// Process id per server id.
    pub pids: HashMap<String, u32>,
    /// Servers ignore the shutdown command.
    pub ignore_shutdown: bool,
    /// Processes survive SIGHUP.
    pub ignore_hangup: bool,
    /// Spawned processes exit at once.
    pub exit_on_spawn: bool,
    /// Children terminated after a failed preparation.
    pub terminated: usize,
    next_pid: u32,
}

pub type SharedWorld = Arc<Mutex<World>>;

impl World {
    pub fn shared() -> SharedWorld {
        Arc::new(Mutex::new(World {
            next_pid: 4000,
            ..World::default()
        }))
    }

    fn go_offline(&mut self, server_id: &str) {
        self.probes.remove(server_id);
        if let Some(pid) = self.pids.get(server_id) {
            self.alive.remove(pid);
        }
        if self.primary.as_deref() == Some(server_id) {
            self.primary = None;
        }
    }

    /// Command names received by a server.
    pub fn command_names(&self, server_id: &str) -> Vec<String> {
        self.commands
            .iter()
            .filter(|(id, _)| id == server_id)
            .filter_map(|(_, command)| command.keys().next().cloned())
            .collect()
    }

    /// First command with the given name.
    pub fn command(&self, name: &str) -> Option<(String, Document)> {
        self.commands
            .iter()
            .find(|(_, command)| command.contains_key(name))
            .cloned()
    }
}

/// Marks a server online with a live process and a PID file.
pub fn bring_online(world: &SharedWorld, server: &Server) -> u32 {
    let mut world = world.lock().unwrap();
    let pid = world.next_pid;
    world.next_pid += 1;
    world.probes.insert(server.id.clone(), Probe::Reachable);
    world.alive.insert(pid);
    world.pids.insert(server.id.clone(), pid);
    if let Ok(path) = server.pid_file_path() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, pid.to_string()).unwrap();
    }
    pid
}

pub struct FakeConnector {
    pub world: SharedWorld,
}

impl Connector for FakeConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn ServerConnection>> {
        Ok(Arc::new(FakeConnection {
            server: server.clone(),
            world: Arc::clone(&self.world),
        }))
    }
}

pub struct FakeConnection {
    server: Server,
    world: SharedWorld,
}

fn config_has_host(config: &Document, host: &str) -> bool {
    config
        .get_array("members")
        .map(|members| {
            members.iter().any(|m| match m {
                Bson::Document(m) => m.get_str("host").is_ok_and(|h| h == host),
                _ => false,
            })
        })
        .unwrap_or(false)
}

#[async_trait]
impl ServerConnection for FakeConnection {
    fn address(&self) -> String {
        self.server.local_address()
    }

    async fn probe(&self) -> Probe {
        let world = self.world.lock().unwrap();
        world
            .probes
            .get(&self.server.id)
            .cloned()
            .unwrap_or_else(|| Probe::Unreachable("connection refused".to_string()))
    }

    async fn run_admin_command(&self, command: Document) -> Result<CommandReply> {
        let mut world = self.world.lock().unwrap();
        let id = self.server.id.clone();
        world.commands.push((id.clone(), command.clone()));
        let name = command.keys().next().cloned().unwrap_or_default();

        let reply = match name.as_str() {
            "isMaster" => CommandReply::Completed(doc! {
                "ismaster": world.primary.as_deref() == Some(id.as_str()),
                "ok": 1,
            }),
            "replSetInitiate" => {
                let mut config = command.get_document("replSetInitiate").unwrap().clone();
                config.insert("version", 1);
                world.replset = Some(config);
                world.primary = Some(id);
                CommandReply::Completed(doc! { "ok": 1 })
            }
            "replSetReconfig" => {
                world.replset = Some(command.get_document("replSetReconfig").unwrap().clone());
                CommandReply::Disconnected
            }
            "replSetStepDown" => {
                world.primary = None;
                CommandReply::Disconnected
            }
            "shutdown" if world.ignore_shutdown => CommandReply::Completed(doc! { "ok": 1 }),
            "shutdown" => {
                world.go_offline(&id);
                CommandReply::Disconnected
            }
            _ => CommandReply::Completed(doc! { "ok": 1 }),
        };
        Ok(reply)
    }

    async fn replica_set_config(&self) -> Result<Option<Document>> {
        let world = self.world.lock().unwrap();
        let host = self.server.address().unwrap_or_default();
        Ok(world
            .replset
            .clone()
            .filter(|config| config_has_host(config, &host)))
    }
}

pub struct FakeProcesses {
    pub world: SharedWorld,
}

struct FakeChild {
    pid: u32,
    exited: bool,
    world: SharedWorld,
}

#[async_trait]
impl ServerChild for FakeChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exited(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.exited.then(|| ExitStatus::from_raw(1 << 8)))
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(ExitStatus::from_raw(0))
    }

    fn terminate(&mut self) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        world.terminated += 1;
        world.alive.remove(&self.pid);
        Ok(())
    }
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

impl ProcessControl for FakeProcesses {
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn ServerChild>> {
        let mut world = self.world.lock().unwrap();
        world.spawned.push(command.clone());
        let pid = world.next_pid;
        world.next_pid += 1;

        let exited = world.exit_on_spawn;
        if !exited {
            let port: u16 = arg_value(&command.args, "--port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(27017);
            if let Some(id) = world.ports.get(&port).cloned() {
                world.probes.insert(id.clone(), Probe::Reachable);
                world.pids.insert(id, pid);
            }
            world.alive.insert(pid);
            if let Some(pid_file) = arg_value(&command.args, "--pidfilepath") {
                std::fs::write(pid_file, pid.to_string()).unwrap();
            }
        }

        Ok(Box::new(FakeChild {
            pid,
            exited,
            world: Arc::clone(&self.world),
        }))
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        world.signals.push((pid, signal));
        if signal == StopSignal::Kill || !world.ignore_hangup {
            let owner = world
                .pids
                .iter()
                .find(|(_, p)| **p == pid)
                .map(|(id, _)| id.clone());
            world.alive.remove(&pid);
            if let Some(owner) = owner {
                world.go_offline(&owner);
            }
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.world.lock().unwrap().alive.contains(&pid)
    }

    fn tail_log(&self, _path: &Path) -> LogTail {
        LogTail::inactive()
    }
}

/// Provisioner that counts calls and can be told to fail.
#[derive(Default)]
pub struct CountingProvisioner {
    pub calls: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl UserProvisioner for CountingProvisioner {
    async fn ensure(&self, server: &Server) -> Result<usize> {
        self.calls.lock().unwrap().push(server.id.clone());
        if self.fail {
            return Err(mongo_runner::Error::Command("createUser failed".to_string()));
        }
        Ok(0)
    }
}

/// Timeouts short enough for tests.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        start: Duration::from_secs(2),
        graceful_stop: Duration::from_millis(40),
        forceful_stop: Duration::from_millis(40),
        replica_set_init: Duration::from_secs(1),
        primary_election: Duration::from_secs(1),
        poll_interval: Duration::from_millis(5),
        replica_poll_interval: Duration::from_millis(5),
        connect: Duration::from_millis(200),
    }
}

/// Writes a fake executable printing `version_line` for `--version`.
pub fn write_fake_executable(bin_dir: &Path, name: &str, version_line: &str) -> PathBuf {
    std::fs::create_dir_all(bin_dir).unwrap();
    let path = bin_dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\necho \"{}\"\n", version_line)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A local server with its data directory under `root`.
pub fn local_server(root: &Path, id: &str, port: u16) -> Server {
    let mut server = Server::new(id, root.join(id));
    server.address = Some(format!("localhost:{}", port));
    server.options.port = Some(port);
    server
}

/// A test harness: temp dirs, a fake `mongod`, and fakes wired into a runner.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub world: SharedWorld,
    pub provisioner: Arc<CountingProvisioner>,
    pub config: RunnerConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_provisioner(CountingProvisioner::default())
    }

    pub fn with_provisioner(provisioner: CountingProvisioner) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("mongo-home");
        write_fake_executable(&home.join("bin"), "mongod", "db version v2.4.6, pdfile version 4.5");
        let config = RunnerConfig {
            mongo_home: Some(home),
            mongo_versions: None,
            timeouts: fast_timeouts(),
        };
        Self {
            dir,
            world: World::shared(),
            provisioner: Arc::new(provisioner),
            config,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    /// A local server registered with the fake process table.
    pub fn server(&self, id: &str, port: u16) -> Server {
        self.world.lock().unwrap().ports.insert(port, id.to_string());
        local_server(&self.root(), id, port)
    }

    pub fn runner(&self, repository: InMemoryRepository, confirm: ConfirmPolicy) -> MongoRunner {
        self.runner_with_context(
            repository,
            ExecutionContext::new().with_confirm(confirm),
        )
    }

    pub fn runner_with_context(
        &self,
        repository: InMemoryRepository,
        context: ExecutionContext,
    ) -> MongoRunner {
        MongoRunner::new(self.config.clone(), repository)
            .with_context(context)
            .with_connector(Arc::new(FakeConnector {
                world: Arc::clone(&self.world),
            }))
            .with_process_control(Arc::new(FakeProcesses {
                world: Arc::clone(&self.world),
            }))
            .with_provisioner(self.provisioner.clone())
            .with_resolver(ExecutableResolver::new(&self.config).with_search_path(None))
    }
}

pub fn accept_all() -> ConfirmPolicy {
    ConfirmPolicy::AcceptAll
}
