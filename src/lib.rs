/*!
 # Mongo Runner

 A Rust library for running MongoDB servers on the local machine and driving
 the replica sets they form.

 ## Overview

 Mongo Runner provides functionality to:
 - Find `mongod` and `mongo` executables by version across several install roots
 - Start servers with negotiated resource limits and wait until they accept connections
 - Stop servers, escalating from the shutdown command to signals
 - Initialize replica sets, reconfigure them and add members
 - Validate server and cluster definitions before touching anything

 Server and cluster definitions come from a [`Repository`](repository::Repository)
 supplied by the application.

 ## Basic Usage

 ```no_run
 use mongo_runner::{MongoRunner, Result};
 use mongo_runner::config::RunnerConfig;
 use mongo_runner::model::{Cluster, Member, Server};
 use mongo_runner::repository::InMemoryRepository;
 use mongo_runner::server::{StartOptions, StopOptions};

 #[tokio::main]
 async fn main() -> Result<()> {
     let mut server = Server::new("alpha", "/data/alpha");
     server.address = Some("localhost:28017".to_string());
     server.options.port = Some(28017);

     let repository = InMemoryRepository::new()
         .with_server(server)
         .with_cluster(Cluster {
             id: "rs0".to_string(),
             description: None,
             members: vec![Member::for_server("alpha")],
             repl_key: None,
         });

     let runner = MongoRunner::new(RunnerConfig::default().with_env_overrides(), repository);

     // Start the server; the replica set is offered for initialization once it is up
     runner.start_server("alpha", &StartOptions::default()).await?;

     let status = runner.server_status("alpha").await?;
     println!("alpha is {}", status.state);

     runner.stop_server("alpha", &StopOptions::default()).await?;
     Ok(())
 }
 ```

 ## Features

 - **Executable Resolution**: Exact, same-major and latest-stable version policies
 - **Server Lifecycle**: Idempotent start, escalating stop, restart and status
 - **Replica Sets**: Initialization, reconfiguration and incremental member addition
 - **Configuration**: Runner settings from JSON or YAML files and the environment
 - **Error Handling**: One error type separating configuration, locality, resolution, lifecycle and cluster failures
 - **Async Support**: Full async/await support
*/

pub mod client;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod executable;
pub mod model;
pub mod repository;
pub mod server;

pub use config::RunnerConfig;
pub use context::ExecutionContext;
pub use error::{Error, Result};
pub use server::{ServerState, ServerStatus};

use client::{Connector, MongoConnector};
use cluster::ReplicaSetOrchestrator;
use executable::{Candidate, ExecutableResolver};
use model::{Cluster, Server};
use mongodb::bson::Document;
use repository::{NoopProvisioner, Repository, UserProvisioner};
use server::{
    LaunchCommand, LifecycleController, ProcessControl, StartOptions, StartOutcome, StopOptions,
    StopOutcome, SystemProcessControl,
};
use std::path::Path;
use std::sync::Arc;

/// Run and manage MongoDB servers and replica sets
///
/// This struct is the main entry point. It looks definitions up by id in the
/// repository and hands them to the lifecycle controller or the replica set
/// orchestrator. All public methods are instrumented with `tracing` spans.
pub struct MongoRunner {
    /// Runner settings
    config: RunnerConfig,
    /// Invocation settings shared with every operation
    context: Arc<ExecutionContext>,
    /// Source of server and cluster definitions
    repository: Arc<dyn Repository>,
    /// Custom connector; the driver-backed one is used when unset
    connector: Option<Arc<dyn Connector>>,
    /// OS process control
    processes: Arc<dyn ProcessControl>,
    /// User provisioning hook
    provisioner: Arc<dyn UserProvisioner>,
    /// Custom executable resolver
    resolver: Option<ExecutableResolver>,
}

impl MongoRunner {
    /// Create a new runner from a configuration file path
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(path, repository), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>, repository: impl Repository + 'static) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = RunnerConfig::from_file(path)?.with_env_overrides();
        Ok(Self::new(config, repository))
    }

    /// Create a new runner with the given configuration and repository
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(config, repository))]
    pub fn new(config: RunnerConfig, repository: impl Repository + 'static) -> Self {
        tracing::info!("Creating new MongoRunner");
        Self {
            config,
            context: Arc::new(ExecutionContext::new()),
            repository: Arc::new(repository),
            connector: None,
            processes: Arc::new(SystemProcessControl),
            provisioner: Arc::new(NoopProvisioner),
            resolver: None,
        }
    }

    /// Replace the execution context
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Arc::new(context);
        self
    }

    /// Replace the connector used to reach servers
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace OS process control
    pub fn with_process_control(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = processes;
        self
    }

    /// Replace the user provisioning hook
    pub fn with_provisioner(mut self, provisioner: Arc<dyn UserProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    /// Replace the executable resolver
    pub fn with_resolver(mut self, resolver: ExecutableResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Runner settings
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn connector(&self) -> Arc<dyn Connector> {
        match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => Arc::new(MongoConnector::new(
                Arc::clone(&self.context),
                self.config.timeouts.connect,
            )),
        }
    }

    fn resolver(&self) -> ExecutableResolver {
        self.resolver
            .clone()
            .unwrap_or_else(|| ExecutableResolver::new(&self.config))
    }

    /// Lifecycle controller wired to this runner's collaborators
    pub fn controller(&self) -> LifecycleController {
        LifecycleController::new(
            Arc::clone(&self.context),
            &self.config,
            Arc::clone(&self.repository),
            self.connector(),
            Arc::clone(&self.processes),
            Arc::clone(&self.provisioner),
        )
        .with_resolver(self.resolver())
    }

    /// Replica set orchestrator wired to this runner's collaborators
    pub fn orchestrator(&self) -> ReplicaSetOrchestrator {
        ReplicaSetOrchestrator::new(
            self.config.timeouts.clone(),
            Arc::clone(&self.repository),
            self.connector(),
            Arc::clone(&self.provisioner),
        )
    }

    /// Look up a server definition
    pub async fn server(&self, id: &str) -> Result<Server> {
        self.repository
            .lookup_server(id)
            .await?
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    /// Look up a cluster definition
    pub async fn cluster(&self, id: &str) -> Result<Cluster> {
        self.repository
            .lookup_cluster(id)
            .await?
            .ok_or_else(|| Error::ClusterNotFound(id.to_string()))
    }

    /// Start a server by id
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, options), fields(invocation = %self.context.invocation_id))]
    pub async fn start_server(&self, id: &str, options: &StartOptions) -> Result<StartOutcome> {
        let server = self.server(id).await?;
        self.controller().start(&server, options).await
    }

    /// Stop a server by id
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, options), fields(invocation = %self.context.invocation_id))]
    pub async fn stop_server(&self, id: &str, options: &StopOptions) -> Result<StopOutcome> {
        let server = self.server(id).await?;
        self.controller().stop(&server, options).await
    }

    /// Restart a server by id
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self, options), fields(invocation = %self.context.invocation_id))]
    pub async fn restart_server(&self, id: &str, options: &StartOptions) -> Result<StartOutcome> {
        let server = self.server(id).await?;
        self.controller().restart(&server, options).await
    }

    /// Observed state of a server by id
    pub async fn server_status(&self, id: &str) -> Result<ServerStatus> {
        let server = self.server(id).await?;
        self.controller().status(&server).await
    }

    /// Command line a start would run, without starting anything
    pub async fn dry_run_start(&self, id: &str, options: &StartOptions) -> Result<LaunchCommand> {
        let server = self.server(id).await?;
        self.controller().dry_run_start(&server, options).await
    }

    /// Bring a replica set in line with its definition, initializing it if needed
    ///
    /// This method is instrumented with `tracing`.
    #[tracing::instrument(skip(self), fields(invocation = %self.context.invocation_id))]
    pub async fn configure_cluster(&self, id: &str, preferred_primary: Option<&str>) -> Result<()> {
        let cluster = self.cluster(id).await?;
        let preferred = match preferred_primary {
            Some(server_id) => Some(self.server(server_id).await?),
            None => None,
        };
        self.orchestrator()
            .configure(&cluster, preferred.as_ref())
            .await
    }

    /// Command `configure_cluster` would send, without sending it
    pub async fn dry_run_configure_cluster(&self, id: &str) -> Result<Document> {
        let cluster = self.cluster(id).await?;
        self.orchestrator().dry_run_configure(&cluster).await
    }

    /// Executables called `name` found on this machine, with their versions
    pub async fn list_executables(&self, name: &str) -> Vec<Candidate> {
        self.resolver().discover(name).await
    }
}
