use crate::client::{CommandReply, Connector};
use crate::cluster::replset::{
    MemberConfig, ReplicaSetConfig, assign_member_ids, initiate_command, next_version,
    reconfig_command,
};
use crate::config::{Timeouts, validate_cluster, validate_server};
use crate::error::{Error, Result};
use crate::model::{Cluster, Member, Server};
use crate::repository::{Repository, UserProvisioner};
use crate::server::wait_for;
use mongodb::bson::Document;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A member definition together with the server it points to.
#[derive(Debug, Clone)]
pub struct ResolvedMember {
    /// The member definition.
    pub member: Member,
    /// The referenced server, if the reference resolved.
    pub server: Option<Server>,
}

impl ResolvedMember {
    /// `host:port` the member is known by in the replica set configuration.
    pub fn host(&self) -> Option<String> {
        self.member
            .host
            .clone()
            .or_else(|| self.server.as_ref().and_then(Server::address))
    }

    /// Whether the member may be elected primary.
    pub fn can_become_primary(&self) -> bool {
        self.member.can_become_primary()
    }

    /// Checks that the member can take part in a configuration.
    ///
    /// A member referencing a server needs that server to exist, to be valid
    /// and to have an address. A bare host member needs its host.
    pub fn validate(&self) -> Result<()> {
        match (&self.member.server, &self.server) {
            (Some(id), None) => Err(Error::Configuration(format!(
                "Invalid 'server' configuration in member. Server '{}' does not exist",
                id
            ))),
            (_, Some(server)) => {
                validate_server(server, Some(&self.member))?;
                if server.address.is_none() {
                    return Err(Error::Configuration(format!(
                        "Invalid member configuration for server '{}'. address property is not set",
                        server.id
                    )));
                }
                Ok(())
            }
            (None, None) if self.member.host.is_some() => Ok(()),
            (None, None) => Err(Error::Configuration(
                "Invalid member configuration. Either 'server' or 'host' must be set".to_string(),
            )),
        }
    }

    /// Whether [`ResolvedMember::validate`] passes. Failures are logged.
    pub fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Invalid replica set member");
                false
            }
        }
    }

    /// The member's entry in a replica set configuration.
    pub fn repl_config(&self) -> Result<MemberConfig> {
        self.validate()?;
        let host = self.host().ok_or_else(|| {
            Error::Configuration("Replica set member without a host".to_string())
        })?;

        let mut extra = Document::new();
        if let Some(priority) = self.member.priority {
            extra.insert("priority", priority);
        }
        if self.member.arbiter_only {
            extra.insert("arbiterOnly", true);
        }
        for (key, value) in &self.member.extra {
            extra.insert(key.clone(), mongodb::bson::to_bson(value)?);
        }
        Ok(MemberConfig::new(host, extra))
    }
}

/// Initializes and reconfigures replica sets.
#[derive(Clone)]
pub struct ReplicaSetOrchestrator {
    timeouts: Timeouts,
    repository: Arc<dyn Repository>,
    connector: Arc<dyn Connector>,
    provisioner: Arc<dyn UserProvisioner>,
}

impl ReplicaSetOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        timeouts: Timeouts,
        repository: Arc<dyn Repository>,
        connector: Arc<dyn Connector>,
        provisioner: Arc<dyn UserProvisioner>,
    ) -> Self {
        Self {
            timeouts,
            repository,
            connector,
            provisioner,
        }
    }

    /// Resolves every member's server reference.
    pub async fn resolve_members(&self, cluster: &Cluster) -> Result<Vec<ResolvedMember>> {
        let mut resolved = Vec::with_capacity(cluster.members.len());
        for member in &cluster.members {
            let server = match &member.server {
                Some(id) => self.repository.lookup_server(id).await?,
                None => None,
            };
            resolved.push(ResolvedMember {
                member: member.clone(),
                server,
            });
        }
        Ok(resolved)
    }

    /// Resolves the members, validates each of them and then the cluster as a whole.
    pub async fn validate(&self, cluster: &Cluster) -> Result<Vec<ResolvedMember>> {
        let members = self.resolve_members(cluster).await?;
        for member in &members {
            member.validate()?;
        }
        let servers: Vec<Server> = members.iter().filter_map(|m| m.server.clone()).collect();
        validate_cluster(cluster, &servers)?;
        Ok(members)
    }

    /// The validated cluster a server belongs to, if any.
    pub async fn cluster_for_server(&self, server: &Server) -> Result<Option<Cluster>> {
        match self.repository.cluster_for_server(&server.id).await? {
            Some(cluster) => {
                self.validate(&cluster).await?;
                Ok(Some(cluster))
            }
            None => Ok(None),
        }
    }

    async fn member_config_document(&self, member: &ResolvedMember) -> Option<Document> {
        let server = member.server.as_ref()?;
        let connection = match self.connector.connect(server) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(server_id = %server.id, error = %e, "Unable to connect to member");
                return None;
            }
        };
        if !connection.probe().await.is_reachable() {
            return None;
        }
        match connection.replica_set_config().await {
            Ok(config) => config,
            Err(e) => {
                debug!(server_id = %server.id, error = %e, "Unable to read replica set config");
                None
            }
        }
    }

    /// Current configuration, read from the first reachable member that has one.
    #[tracing::instrument(skip(self, cluster), fields(cluster_id = %cluster.id))]
    pub async fn read_config(&self, cluster: &Cluster) -> Result<Option<ReplicaSetConfig>> {
        for member in self.resolve_members(cluster).await? {
            if !member.is_valid() {
                continue;
            }
            if let Some(doc) = self.member_config_document(&member).await {
                return ReplicaSetConfig::from_document(&doc).map(Some);
            }
        }
        Ok(None)
    }

    /// Whether any reachable member holds a configuration.
    pub async fn is_initialized(&self, cluster: &Cluster) -> Result<bool> {
        Ok(self.read_config(cluster).await?.is_some())
    }

    async fn is_primary(&self, member: &ResolvedMember) -> bool {
        let Some(server) = member.server.as_ref() else {
            return false;
        };
        if member.validate().is_err() {
            return false;
        }
        let connection = match self.connector.connect(server) {
            Ok(connection) => connection,
            Err(_) => return false,
        };
        if !connection.probe().await.is_reachable() {
            return false;
        }
        match connection.is_primary().await {
            Ok(primary) => primary,
            Err(e) => {
                debug!(server_id = %server.id, error = %e, "isMaster failed");
                false
            }
        }
    }

    /// The member currently reporting itself primary.
    pub async fn primary_member(&self, cluster: &Cluster) -> Result<Option<ResolvedMember>> {
        for member in self.resolve_members(cluster).await? {
            if self.is_primary(&member).await {
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    async fn suggest_primary(&self, members: &[ResolvedMember]) -> Option<Server> {
        for member in members.iter().filter(|m| m.can_become_primary()) {
            let Some(server) = &member.server else {
                continue;
            };
            if let Ok(connection) = self.connector.connect(server) {
                if connection.probe().await.is_reachable() {
                    return Some(server.clone());
                }
            }
        }
        None
    }

    fn member_for<'a>(members: &'a [ResolvedMember], server: &Server) -> Result<&'a ResolvedMember> {
        members
            .iter()
            .find(|m| m.server.as_ref().is_some_and(|s| s.id == server.id))
            .ok_or_else(|| {
                Error::Configuration(format!("Server '{}' is not a member of the cluster", server.id))
            })
    }

    fn initial_config(
        cluster: &Cluster,
        members: &[ResolvedMember],
        only_for: Option<&Server>,
    ) -> Result<ReplicaSetConfig> {
        let mut member_configs = match only_for {
            Some(server) => vec![Self::member_for(members, server)?.repl_config()?],
            None => members
                .iter()
                .map(ResolvedMember::repl_config)
                .collect::<Result<Vec<_>>>()?,
        };
        assign_member_ids(&mut member_configs, None);
        Ok(ReplicaSetConfig {
            id: cluster.id.clone(),
            version: None,
            members: member_configs,
        })
    }

    /// Builds the command that would initialize the set, without sending it.
    pub async fn dry_run_initialize(&self, cluster: &Cluster, only_for: Option<&Server>) -> Result<Document> {
        let members = self.validate(cluster).await?;
        Ok(initiate_command(&Self::initial_config(cluster, &members, only_for)?))
    }

    /// Initializes the replica set.
    ///
    /// The primary is `preferred`, else `only_for`, else the first member that
    /// can become primary and is online. With `only_for` the initial
    /// configuration holds that single member.
    #[tracing::instrument(skip_all, fields(cluster_id = %cluster.id))]
    pub async fn initialize(
        &self,
        cluster: &Cluster,
        preferred: Option<&Server>,
        only_for: Option<&Server>,
    ) -> Result<()> {
        info!("Initializing replica set cluster");
        let members = self.validate(cluster).await?;

        let primary = match preferred.or(only_for) {
            Some(server) => server.clone(),
            None => self.suggest_primary(&members).await.ok_or_else(|| {
                Error::cluster(
                    "Unable to determine primary server. At least one member server has to be online",
                )
            })?,
        };
        info!(primary = %primary.id, "Selected primary server");

        self.initialize_with(cluster, &members, &primary, only_for)
            .await
            .map_err(|e| {
                Error::cluster_caused(
                    format!("Unable to initialize replica set cluster '{}'", cluster.id),
                    e,
                )
            })
    }

    async fn initialize_with(
        &self,
        cluster: &Cluster,
        members: &[ResolvedMember],
        primary: &Server,
        only_for: Option<&Server>,
    ) -> Result<()> {
        let command = initiate_command(&Self::initial_config(cluster, members, only_for)?);
        info!(?command, "Sending replica set initiate command");

        let connection = self.connector.connect(primary)?;
        match connection.run_admin_command(command).await? {
            CommandReply::Completed(reply) => debug!(?reply, "Initiate command completed"),
            CommandReply::TimedOut => warn!("Initiate command timed out; it may still complete"),
            CommandReply::Disconnected => debug!("Server dropped the connection during initiate"),
        }

        info!("Waiting for the replica set to initialize");
        let initialized = wait_for(
            self.timeouts.replica_set_init,
            self.timeouts.replica_poll_interval,
            || self.is_initialized(cluster),
        )
        .await?;
        if !initialized {
            return Err(Error::cluster(format!(
                "Timeout error: Initializing replica set '{}' took longer than expected. \
                 This does not necessarily mean that it failed but it could have failed",
                cluster.id
            )));
        }
        info!("Replica set initiated");

        let primary_member = Self::member_for(members, primary)?.clone();
        info!(server_id = %primary.id, "Waiting for the intended primary to become primary");
        let elected = wait_for(
            self.timeouts.primary_election,
            self.timeouts.replica_poll_interval,
            || {
                let member = primary_member.clone();
                async move { Ok(self.is_primary(&member).await) }
            },
        )
        .await?;
        if !elected {
            return Err(Error::cluster(format!(
                "Timeout error: Waiting for server '{}' to become primary took longer than expected",
                primary.id
            )));
        }

        info!(server_id = %primary.id, "Server is primary now; provisioning users");
        let added = self.provisioner.ensure(primary).await?;
        debug!(added, "Users provisioned");

        if let Some(config) = self.read_config(cluster).await? {
            info!(config = ?config.to_document(), "New replica set configuration");
        }
        Ok(())
    }

    async fn reconfig_document(
        &self,
        cluster: &Cluster,
        members: &[ResolvedMember],
        add: Option<&Server>,
    ) -> Result<Document> {
        let current = self.read_config(cluster).await?;
        let mut member_configs = match add {
            Some(server) => {
                let current = current.as_ref().ok_or_else(|| {
                    Error::cluster(format!("Replica set cluster '{}' is not initialized", cluster.id))
                })?;
                let mut configs = current.members.clone();
                configs.push(Self::member_for(members, server)?.repl_config()?);
                configs
            }
            None => members
                .iter()
                .map(ResolvedMember::repl_config)
                .collect::<Result<Vec<_>>>()?,
        };
        assign_member_ids(&mut member_configs, current.as_ref());
        if let Some(current) = &current {
            info!(config = ?current.to_document(), "Current replica set configuration");
        }

        Ok(reconfig_command(&ReplicaSetConfig {
            id: cluster.id.clone(),
            version: Some(next_version(current.as_ref())),
            members: member_configs,
        }))
    }

    /// Builds the command `configure` would send, without sending it.
    pub async fn dry_run_configure(&self, cluster: &Cluster) -> Result<Document> {
        let members = self.validate(cluster).await?;
        if !self.is_initialized(cluster).await? {
            return Ok(initiate_command(&Self::initial_config(cluster, &members, None)?));
        }
        self.reconfig_document(cluster, &members, None).await
    }

    /// Brings the set's configuration in line with the cluster definition,
    /// initializing it first if needed.
    pub async fn configure(&self, cluster: &Cluster, preferred: Option<&Server>) -> Result<()> {
        if !self.is_initialized(cluster).await? {
            return self.initialize(cluster, preferred, None).await;
        }
        self.reconfigure(cluster, None).await
    }

    /// Adds one server to an initialized set.
    pub async fn add_member(&self, cluster: &Cluster, server: &Server) -> Result<()> {
        self.reconfigure(cluster, Some(server)).await
    }

    /// Sends a reconfiguration to the current primary.
    ///
    /// With `add` the new configuration is the current one plus that server,
    /// otherwise every defined member. Member ids are reused by host and the
    /// version is bumped.
    #[tracing::instrument(skip_all, fields(cluster_id = %cluster.id))]
    pub async fn reconfigure(&self, cluster: &Cluster, add: Option<&Server>) -> Result<()> {
        let members = self.validate(cluster).await?;
        let primary = self.primary_member(cluster).await?.ok_or_else(|| {
            Error::cluster(format!(
                "Unable to determine primary server for replica set cluster '{}'",
                cluster.id
            ))
        })?;
        let Some(primary_server) = primary.server.as_ref() else {
            return Err(Error::cluster("Primary member has no server definition"));
        };
        info!(primary = %primary_server.id, "Re-configuring replica set cluster");

        let send = async {
            let command = self.reconfig_document(cluster, &members, add).await?;
            info!(?command, "Executing reconfiguration on the current primary");
            let connection = self.connector.connect(primary_server)?;
            match connection.run_admin_command(command).await? {
                CommandReply::Completed(_) | CommandReply::Disconnected => Ok(()),
                CommandReply::TimedOut => Err(Error::Command(
                    "Reconfiguration command timed out".to_string(),
                )),
            }
        };
        send.await.map_err(|e| {
            Error::cluster_caused(
                format!("Unable to reconfigure replica set cluster '{}'", cluster.id),
                e,
            )
        })?;

        info!("Re-configuration ran successfully");
        if let Some(config) = self.read_config(cluster).await? {
            info!(config = ?config.to_document(), "New replica set configuration");
        }
        Ok(())
    }

    /// Whether a server's host appears in the set's current configuration.
    pub async fn is_member_configured(&self, cluster: &Cluster, server: &Server) -> Result<bool> {
        let members = self.resolve_members(cluster).await?;
        let host = Self::member_for(&members, server)?.host();
        let Some(host) = host else {
            return Ok(false);
        };
        Ok(self
            .read_config(cluster)
            .await?
            .is_some_and(|config| config.member_for_host(&host).is_some()))
    }
}
