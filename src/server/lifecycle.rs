use crate::client::{CommandReply, Connector, ServerConnection, uses_local_address};
use crate::cluster::ReplicaSetOrchestrator;
use crate::config::{RunnerConfig, Timeouts, validate_server};
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executable::ExecutableResolver;
use crate::model::{Cluster, OptionValue, Server};
use crate::repository::{Repository, UserProvisioner};
use crate::server::monitor::{ServerState, wait_for};
use crate::server::process::{
    LaunchCommand, ProcessControl, ServerChild, StopSignal, build_launch_command,
    ensure_data_dir, ensure_key_file, read_pid,
};
use mongodb::bson::doc;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-invocation start settings.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Launch option overrides. `fork` only selects detached mode.
    pub overrides: BTreeMap<String, OptionValue>,
    /// Add the server to its already initialized replica set without asking.
    pub add_to_replica_set: bool,
}

/// Per-invocation stop settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Escalate to a forceful stop without asking.
    pub force: bool,
    /// Ask a primary to step down before shutting it down.
    pub step_down: bool,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The server was already online; nothing was spawned.
    AlreadyRunning,
    /// The server was spawned and came online.
    Started {
        /// PID recorded by the server, if known.
        pid: Option<u32>,
    },
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The server was already offline.
    NotRunning,
    /// The server was stopped.
    Stopped,
}

/// Snapshot of a server's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    /// Observed state.
    pub state: ServerState,
    /// PID from the server's PID file.
    pub pid: Option<u32>,
    /// Address that was probed.
    pub address: String,
}

/// Starts, stops and inspects servers.
///
/// Operations that act on processes only run against servers local to this
/// machine (or forced local in the [`ExecutionContext`]). Starting a cluster
/// member hands off to the [`ReplicaSetOrchestrator`] once the server is up.
pub struct LifecycleController {
    context: Arc<ExecutionContext>,
    timeouts: Timeouts,
    connector: Arc<dyn Connector>,
    processes: Arc<dyn ProcessControl>,
    provisioner: Arc<dyn UserProvisioner>,
    resolver: ExecutableResolver,
    orchestrator: ReplicaSetOrchestrator,
}

impl LifecycleController {
    /// Creates a controller.
    pub fn new(
        context: Arc<ExecutionContext>,
        config: &RunnerConfig,
        repository: Arc<dyn Repository>,
        connector: Arc<dyn Connector>,
        processes: Arc<dyn ProcessControl>,
        provisioner: Arc<dyn UserProvisioner>,
    ) -> Self {
        let orchestrator = ReplicaSetOrchestrator::new(
            config.timeouts.clone(),
            repository,
            Arc::clone(&connector),
            Arc::clone(&provisioner),
        );
        Self {
            context,
            timeouts: config.timeouts.clone(),
            connector,
            processes,
            provisioner,
            resolver: ExecutableResolver::new(config),
            orchestrator,
        }
    }

    /// Replaces the executable resolver.
    pub fn with_resolver(mut self, resolver: ExecutableResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// The orchestrator used for cluster handoffs.
    pub fn orchestrator(&self) -> &ReplicaSetOrchestrator {
        &self.orchestrator
    }

    fn validate_local_op(&self, server: &Server, operation: &str) -> Result<()> {
        if uses_local_address(server, &self.context) {
            return Ok(());
        }
        Err(Error::Locality(format!(
            "Cannot {} server '{}' on this machine because server's address '{}' is not local \
             to this machine. Assume the server is local if this is a mistake",
            operation,
            server.id,
            server.address.as_deref().unwrap_or_default()
        )))
    }

    async fn validated_cluster(&self, server: &Server) -> Result<Option<Cluster>> {
        let cluster = self.orchestrator.cluster_for_server(server).await?;
        let membership = cluster.as_ref().and_then(|c| c.member_for(&server.id));
        validate_server(server, membership)?;
        Ok(cluster)
    }

    /// Observed state of a server.
    #[tracing::instrument(skip(self, server), fields(server_id = %server.id))]
    pub async fn status(&self, server: &Server) -> Result<ServerStatus> {
        let connection = self.connector.connect(server)?;
        let state = ServerState::from(&connection.probe().await);
        tracing::debug!(%state, "Probed server");
        Ok(ServerStatus {
            state,
            pid: read_pid(server),
            address: connection.address(),
        })
    }

    /// Renders the command `start` would run, without side effects.
    pub async fn dry_run_start(&self, server: &Server, options: &StartOptions) -> Result<LaunchCommand> {
        let cluster = self.validated_cluster(server).await?;
        let program = self.resolver.resolve_server(server).await?;
        build_launch_command(server, cluster.as_ref(), program, &options.overrides)
    }

    /// Starts a server and waits until it accepts connections.
    ///
    /// Starting an online server is a no-op. A server whose port answers but
    /// times out is not started. After the server comes online a cluster
    /// member may initialize its replica set or join it, and users are
    /// provisioned. In foreground mode this returns only once the server exits.
    #[tracing::instrument(skip(self, server, options), fields(server_id = %server.id))]
    pub async fn start(&self, server: &Server, options: &StartOptions) -> Result<StartOutcome> {
        self.validate_local_op(server, "start")?;
        let cluster = self.validated_cluster(server).await?;

        tracing::info!("Checking to see if server is already running before starting it");
        let connection = self.connector.connect(server)?;
        match ServerState::from(&connection.probe().await) {
            ServerState::Online => {
                tracing::info!("Server is already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            ServerState::Unresponsive => {
                return Err(Error::lifecycle(format!(
                    "Unable to start server '{}'. Unable to connect to {}: connection timed out. \
                     Something may already be listening on that port",
                    server.id,
                    connection.address()
                )));
            }
            ServerState::Offline => {}
        }

        let program = self.resolver.resolve_server(server).await?;
        let existed = ensure_data_dir(server)?;
        if let Some(cluster) = &cluster {
            if server.needs_repl_key(true) {
                ensure_key_file(server, cluster)?;
            }
        }
        let command = build_launch_command(server, cluster.as_ref(), program, &options.overrides)?;
        tracing::info!(%command, first_time = !existed, "Starting server");

        let mut child = self.processes.spawn(&command)?;
        let log_path = server.log_file_path()?;

        tracing::info!(log = %log_path.display(), "Waiting for server to start up");
        let tail = self.processes.tail_log(&log_path);
        let started = wait_for(self.timeouts.start, self.timeouts.poll_interval, || {
            let exited = child.try_exited();
            let connection = Arc::clone(&connection);
            let log_path = log_path.clone();
            async move {
                if let Some(status) = exited? {
                    return Err(Error::lifecycle(format!(
                        "Could not start the server ({}). Please check the log file at '{}'",
                        status,
                        log_path.display()
                    )));
                }
                Ok(connection.probe().await.is_reachable())
            }
        })
        .await;
        tail.stop();

        if !started? {
            return Err(Error::lifecycle(format!("Unable to start server '{}'", server.id)));
        }
        let pid = read_pid(server).or_else(|| child.id());
        tracing::info!(?pid, "Server started successfully");

        if let Some(cluster) = &cluster {
            self.join_replica_set(server, cluster, options.add_to_replica_set)
                .await?;
        }
        self.prepare(server, child.as_mut()).await?;

        if !command.detached {
            tracing::info!("Server is running in the foreground; waiting for it to exit");
            let status = child.wait().await?;
            tracing::info!(%status, "Server exited");
        }

        Ok(StartOutcome::Started { pid })
    }

    async fn join_replica_set(&self, server: &Server, cluster: &Cluster, add: bool) -> Result<()> {
        if !self.orchestrator.is_initialized(cluster).await? {
            let can_become_primary = cluster
                .member_for(&server.id)
                .is_some_and(|m| m.can_become_primary());
            if !can_become_primary {
                tracing::info!(
                    cluster_id = %cluster.id,
                    "Replica set is not initialized and this member cannot become primary"
                );
                return Ok(());
            }
            let question = format!(
                "Replica set cluster '{}' is not initialized. Do you want to initialize it \
                 using server '{}' as primary?",
                cluster.id, server.id
            );
            if self.context.confirm(&question)? {
                self.orchestrator
                    .initialize(cluster, Some(server), Some(server))
                    .await?;
            }
            return Ok(());
        }

        if self.orchestrator.is_member_configured(cluster, server).await? {
            return Ok(());
        }
        let question = format!(
            "Server '{}' is not a configured member of replica set cluster '{}'. Add it?",
            server.id, cluster.id
        );
        if add || self.context.confirm(&question)? {
            self.orchestrator.add_member(cluster, server).await?;
        }
        Ok(())
    }

    async fn prepare(&self, server: &Server, child: &mut dyn ServerChild) -> Result<()> {
        let error = match self.provisioner.ensure(server).await {
            Ok(added) => {
                tracing::debug!(added, "Users provisioned");
                return Ok(());
            }
            Err(e) => e,
        };
        tracing::error!(error = %error, "Unable to fully prepare server");

        let question = format!(
            "There was an error while preparing server '{}'. Kill server now?",
            server.id
        );
        if self.context.confirm(&question)? {
            child.terminate()?;
            return Err(Error::lifecycle_caused(
                format!("Server '{}' was killed because it could not be prepared", server.id),
                error,
            ));
        }
        Ok(())
    }

    /// Asks a server to step down if it is primary. Returns whether it was asked.
    #[tracing::instrument(skip(self, server), fields(server_id = %server.id))]
    pub async fn step_down(&self, server: &Server, force: bool) -> Result<bool> {
        let connection = self.connector.connect(server)?;
        if !connection.is_primary().await? {
            return Ok(false);
        }
        tracing::info!("Stepping down primary");
        match connection
            .run_admin_command(doc! { "replSetStepDown": 10, "force": force })
            .await?
        {
            CommandReply::Completed(_) | CommandReply::Disconnected => Ok(true),
            CommandReply::TimedOut => Err(Error::Command("Step down timed out".to_string())),
        }
    }

    /// Stops a server.
    ///
    /// Tries the shutdown command first when the server answers. If that does
    /// not converge, and force is set or the operator agrees, the shutdown is
    /// forced and finally the process is signalled with hang-up, then kill.
    #[tracing::instrument(skip(self, server, options), fields(server_id = %server.id))]
    pub async fn stop(&self, server: &Server, options: &StopOptions) -> Result<StopOutcome> {
        self.validate_local_op(server, "stop")?;

        tracing::info!("Checking to see if server is actually running before stopping it");
        let connection = self.connector.connect(server)?;
        let state = ServerState::from(&connection.probe().await);
        if state == ServerState::Offline {
            tracing::info!("Server is not running");
            return Ok(StopOutcome::NotRunning);
        }

        let pid = read_pid(server);
        tracing::info!(?pid, %state, "Stopping server");

        let online = state == ServerState::Online;
        if online && options.step_down {
            let question = format!(
                "Server '{}' will be stepped down first if it is primary. Continue?",
                server.id
            );
            if self.context.confirm(&question)? {
                if let Err(e) = self.step_down(server, options.force).await {
                    tracing::warn!(error = %e, "Step down failed; stopping anyway");
                }
            }
        }

        let mut stopped = online && self.shutdown_with_command(&connection, pid, false).await;
        if !stopped {
            let question = format!(
                "Server '{}' did not stop gracefully. Do you want to force stop it?",
                server.id
            );
            if !(options.force || self.context.confirm(&question)?) {
                return Err(Error::lifecycle(format!(
                    "Unable to stop server '{}'. Forceful stop was declined",
                    server.id
                )));
            }
            stopped = self.force_stop(&connection, pid, online).await?;
        }

        if !stopped {
            return Err(Error::lifecycle(format!("Unable to stop server '{}'", server.id)));
        }
        tracing::info!("Server stopped successfully");
        Ok(StopOutcome::Stopped)
    }

    async fn shutdown_with_command(
        &self,
        connection: &Arc<dyn ServerConnection>,
        pid: Option<u32>,
        force: bool,
    ) -> bool {
        tracing::info!(force, "Sending the shutdown command");
        match connection
            .run_admin_command(doc! { "shutdown": 1, "force": force })
            .await
        {
            Ok(reply) => tracing::debug!(?reply, "Shutdown command sent"),
            Err(e) => {
                tracing::error!(error = %e, "Shutdown command failed");
                return false;
            }
        }

        let processes = Arc::clone(&self.processes);
        let result = wait_for(self.timeouts.graceful_stop, self.timeouts.poll_interval, || {
            let connection = Arc::clone(connection);
            let alive = pid.is_some_and(|pid| processes.is_alive(pid));
            async move { Ok(!alive && !connection.probe().await.is_reachable()) }
        })
        .await;
        matches!(result, Ok(true))
    }

    async fn force_stop(
        &self,
        connection: &Arc<dyn ServerConnection>,
        pid: Option<u32>,
        try_command: bool,
    ) -> Result<bool> {
        if try_command && self.shutdown_with_command(connection, pid, true).await {
            return Ok(true);
        }

        let Some(pid) = pid else {
            tracing::error!("Cannot kill the server process: no pid recorded");
            return Ok(false);
        };
        for signal in [StopSignal::Hangup, StopSignal::Kill] {
            tracing::info!(pid, ?signal, "Signalling server process");
            if let Err(e) = self.processes.signal(pid, signal) {
                tracing::warn!(pid, error = %e, "Unable to signal server process");
            }
            let processes = Arc::clone(&self.processes);
            wait_for(self.timeouts.forceful_stop, self.timeouts.poll_interval, || {
                let alive = processes.is_alive(pid);
                async move { Ok(!alive) }
            })
            .await?;
            if !self.processes.is_alive(pid) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stops the server if it is online, then starts it.
    #[tracing::instrument(skip(self, server, options), fields(server_id = %server.id))]
    pub async fn restart(&self, server: &Server, options: &StartOptions) -> Result<StartOutcome> {
        self.validate_local_op(server, "restart")?;
        let connection = self.connector.connect(server)?;
        if connection.probe().await.is_reachable() {
            self.stop(server, &StopOptions::default()).await?;
        } else {
            tracing::info!("Server is not running; starting it");
        }
        self.start(server, options).await
    }
}
