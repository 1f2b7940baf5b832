/// Administrative command channel to running servers.
///
/// This module provides the [`ServerConnection`] abstraction used by the
/// lifecycle controller and the replica set orchestrator. It allows them to:
/// - Probe whether a server accepts connections
/// - Run administrative commands against the `admin` database
/// - Read the replica set configuration stored on a member
///
/// Commands that make the server drop the connection (shutdown, reconfig,
/// step down) report [`CommandReply::Disconnected`] instead of failing, and
/// commands that exceed the socket timeout report [`CommandReply::TimedOut`].
///
/// [`MongoConnector`] is the driver-backed implementation. It also decides
/// which address to dial: servers that are local, or forced local through the
/// execution context, are reached over loopback.
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::model::Server;
use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::Client;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Result of checking whether a server accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The server answered.
    Reachable,
    /// Nothing is listening, or the connection was rejected.
    Unreachable(String),
    /// Something accepted the connection attempt but did not answer in time.
    TimedOut,
}

impl Probe {
    /// Whether the server answered.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Probe::Reachable)
    }
}

/// Outcome of an administrative command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    /// The server replied.
    Completed(Document),
    /// The server dropped the connection while handling the command.
    Disconnected,
    /// The reply did not arrive within the socket timeout.
    TimedOut,
}

/// A channel to one server.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Address this connection dials.
    fn address(&self) -> String;

    /// Checks whether the server accepts connections.
    async fn probe(&self) -> Probe;

    /// Runs a command against the `admin` database.
    async fn run_admin_command(&self, command: Document) -> Result<CommandReply>;

    /// Reads the replica set configuration stored in `local.system.replset`.
    async fn replica_set_config(&self) -> Result<Option<Document>>;

    /// Whether the server currently reports itself primary.
    async fn is_primary(&self) -> Result<bool> {
        match self.run_admin_command(doc! { "isMaster": 1 }).await? {
            CommandReply::Completed(reply) => Ok(reply.get_bool("ismaster").unwrap_or(false)),
            _ => Ok(false),
        }
    }
}

/// Opens connections to servers.
pub trait Connector: Send + Sync {
    /// Creates a connection to a server. No network traffic happens until it is used.
    fn connect(&self, server: &Server) -> Result<Arc<dyn ServerConnection>>;
}

/// Whether `host` names this machine.
pub fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return true;
    }
    let resolved = resolve_ip(host);
    if resolved.is_some_and(|ip| ip.is_loopback()) {
        return true;
    }
    let Ok(hostname) = nix::unistd::gethostname() else {
        return false;
    };
    let hostname = hostname.to_string_lossy();
    if hostname.eq_ignore_ascii_case(host) {
        return true;
    }
    match (resolve_ip(&hostname), resolved) {
        (Some(own), Some(other)) => own == other,
        _ => false,
    }
}

fn resolve_ip(host: &str) -> Option<IpAddr> {
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}

/// Whether a server should be reached over loopback.
///
/// True for servers without an address, servers forced local in the
/// context, and servers whose host resolves to this machine.
pub fn uses_local_address(server: &Server, context: &ExecutionContext) -> bool {
    if context.is_assumed_local(&server.id) {
        return true;
    }
    match server.host() {
        None => true,
        Some(host) => is_local_host(host),
    }
}

/// Address used to reach a server.
pub fn connection_address(server: &Server, context: &ExecutionContext) -> String {
    if uses_local_address(server, context) {
        server.local_address()
    } else {
        server.address().unwrap_or_else(|| server.local_address())
    }
}

/// Connector backed by the MongoDB driver.
pub struct MongoConnector {
    context: Arc<ExecutionContext>,
    timeout: Duration,
}

impl MongoConnector {
    /// Creates a connector using `timeout` for connection attempts and probes.
    pub fn new(context: Arc<ExecutionContext>, timeout: Duration) -> Self {
        Self { context, timeout }
    }
}

impl Connector for MongoConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn ServerConnection>> {
        let address = connection_address(server, &self.context);
        let loopback = uses_local_address(server, &self.context);
        Ok(Arc::new(MongoConnection::new(server, address, loopback, self.timeout)?))
    }
}

/// Driver-backed connection to one server.
///
/// Authenticates as the server's first admin user when auth is enabled. On
/// loopback connections an authentication failure is retried without
/// credentials, since a fresh server has no users yet.
pub struct MongoConnection {
    address: String,
    loopback: bool,
    timeout: Duration,
    authenticated: Option<Client>,
    anonymous: Client,
}

impl MongoConnection {
    fn new(server: &Server, address: String, loopback: bool, timeout: Duration) -> Result<Self> {
        let credential = if server.is_auth() {
            server.admin_users().first().map(|user| {
                Credential::builder()
                    .username(user.username.clone())
                    .password(user.password.clone())
                    .source("admin".to_string())
                    .build()
            })
        } else {
            None
        };

        let anonymous = Client::with_options(client_options(&address, timeout, None)?)?;
        let authenticated = match credential {
            Some(credential) => Some(Client::with_options(client_options(
                &address,
                timeout,
                Some(credential),
            )?)?),
            None => None,
        };

        Ok(Self {
            address,
            loopback,
            timeout,
            authenticated,
            anonymous,
        })
    }

    fn primary_client(&self) -> &Client {
        self.authenticated.as_ref().unwrap_or(&self.anonymous)
    }

    fn should_retry_anonymously(&self, e: &mongodb::error::Error) -> bool {
        self.loopback
            && self.authenticated.is_some()
            && matches!(e.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    async fn admin_command(client: &Client, command: Document) -> mongodb::error::Result<Document> {
        client.database("admin").run_command(command).await
    }

    async fn read_replset(client: &Client) -> mongodb::error::Result<Option<Document>> {
        client
            .database("local")
            .collection::<Document>("system.replset")
            .find_one(doc! {})
            .await
    }
}

fn client_options(address: &str, timeout: Duration, credential: Option<Credential>) -> Result<ClientOptions> {
    let host = ServerAddress::parse(address)?;
    Ok(ClientOptions::builder()
        .hosts(vec![host])
        .direct_connection(true)
        .connect_timeout(timeout)
        .server_selection_timeout(timeout)
        .credential(credential)
        .app_name("mongo-runner".to_string())
        .build())
}

fn is_disconnect(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Io(io_error) => matches!(
            io_error.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
        ),
        ErrorKind::ConnectionPoolCleared { .. } => true,
        _ => false,
    }
}

fn is_timeout(e: &mongodb::error::Error) -> bool {
    matches!(e.kind.as_ref(), ErrorKind::Io(io_error) if io_error.kind() == io::ErrorKind::TimedOut)
}

fn classify(result: mongodb::error::Result<Document>) -> Result<CommandReply> {
    match result {
        Ok(reply) => Ok(CommandReply::Completed(reply)),
        Err(e) if is_disconnect(&e) => {
            debug!(error = %e, "Server dropped the connection while running the command");
            Ok(CommandReply::Disconnected)
        }
        Err(e) if is_timeout(&e) => Ok(CommandReply::TimedOut),
        Err(e) => Err(Error::Driver(e)),
    }
}

#[async_trait]
impl ServerConnection for MongoConnection {
    fn address(&self) -> String {
        self.address.clone()
    }

    #[tracing::instrument(skip(self), fields(address = %self.address))]
    async fn probe(&self) -> Probe {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Err(_) => return Probe::TimedOut,
            Ok(Err(e)) => return Probe::Unreachable(e.to_string()),
            Ok(Ok(_)) => {}
        }

        let ping = async { Self::admin_command(&self.anonymous, doc! { "ping": 1 }).await };
        match tokio::time::timeout(self.timeout, ping).await {
            Err(_) => Probe::TimedOut,
            Ok(Ok(_)) => Probe::Reachable,
            Ok(Err(e)) if is_timeout(&e) => Probe::TimedOut,
            Ok(Err(e)) => Probe::Unreachable(e.to_string()),
        }
    }

    #[tracing::instrument(skip(self, command), fields(address = %self.address))]
    async fn run_admin_command(&self, command: Document) -> Result<CommandReply> {
        debug!(?command, "Running admin command");
        match Self::admin_command(self.primary_client(), command.clone()).await {
            Err(e) if self.should_retry_anonymously(&e) => {
                warn!("Authentication failed on loopback connection, retrying without credentials");
                classify(Self::admin_command(&self.anonymous, command).await)
            }
            result => classify(result),
        }
    }

    async fn replica_set_config(&self) -> Result<Option<Document>> {
        match Self::read_replset(self.primary_client()).await {
            Err(e) if self.should_retry_anonymously(&e) => {
                Ok(Self::read_replset(&self.anonymous).await?)
            }
            result => Ok(result?),
        }
    }
}
