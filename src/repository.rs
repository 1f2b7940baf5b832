//! Lookup of server and cluster definitions, plus the user provisioning hook.
//!
//! How definitions are stored is up to the embedding application; the library
//! only needs read access through [`Repository`]. [`InMemoryRepository`] covers
//! tests and programs that build their definitions in code.

use crate::error::Result;
use crate::model::{Cluster, Server};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Read access to server and cluster definitions.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Looks up a server by id.
    async fn lookup_server(&self, id: &str) -> Result<Option<Server>>;

    /// Looks up a cluster by id.
    async fn lookup_cluster(&self, id: &str) -> Result<Option<Cluster>>;

    /// All known servers.
    async fn all_servers(&self) -> Result<Vec<Server>>;

    /// All known clusters.
    async fn all_clusters(&self) -> Result<Vec<Cluster>>;

    /// The cluster a server is a member of, if any.
    async fn cluster_for_server(&self, server_id: &str) -> Result<Option<Cluster>> {
        Ok(self
            .all_clusters()
            .await?
            .into_iter()
            .find(|cluster| cluster.has_member_server(server_id)))
    }
}

/// Creates database users on a running server.
///
/// Called after a server starts and after a replica set is initialized.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    /// Makes sure the server's configured users exist. Returns how many were added.
    async fn ensure(&self, server: &Server) -> Result<usize>;
}

/// Provisioner that never creates anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

#[async_trait]
impl UserProvisioner for NoopProvisioner {
    async fn ensure(&self, _server: &Server) -> Result<usize> {
        Ok(0)
    }
}

/// Repository holding definitions in memory.
///
/// ```
/// use mongo_runner::model::{Cluster, Member, Server};
/// use mongo_runner::repository::InMemoryRepository;
///
/// let repository = InMemoryRepository::new()
///     .with_server(Server::new("a", "/data/a"))
///     .with_cluster(Cluster {
///         id: "rs0".to_string(),
///         description: None,
///         members: vec![Member::for_server("a")],
///         repl_key: None,
///     });
/// # let _ = repository;
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryRepository {
    servers: BTreeMap<String, Server>,
    clusters: BTreeMap<String, Cluster>,
}

impl InMemoryRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a server.
    pub fn with_server(mut self, server: Server) -> Self {
        self.servers.insert(server.id.clone(), server);
        self
    }

    /// Adds or replaces a cluster.
    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.clusters.insert(cluster.id.clone(), cluster);
        self
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn lookup_server(&self, id: &str) -> Result<Option<Server>> {
        Ok(self.servers.get(id).cloned())
    }

    async fn lookup_cluster(&self, id: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters.get(id).cloned())
    }

    async fn all_servers(&self) -> Result<Vec<Server>> {
        Ok(self.servers.values().cloned().collect())
    }

    async fn all_clusters(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.values().cloned().collect())
    }
}
