use crate::error::{Error, Result};
use crate::executable::MongoVersion;
use crate::model::{Cluster, MIN_SUPPORTED_VERSION, Member, Server};

/// Validates a server definition.
///
/// `membership` is the server's member entry when it belongs to a cluster;
/// arbiters are checked for local users instead of admin users. Every
/// problem found is reported in the one error.
pub fn validate_server(server: &Server, membership: Option<&Member>) -> Result<()> {
    let mut problems = Vec::new();

    if server.options.dbpath.is_none() {
        problems.push("no dbpath configured".to_string());
    }

    match server.declared_version() {
        Ok(Some(version)) => {
            let minimum = MIN_SUPPORTED_VERSION.parse::<MongoVersion>()?;
            if version < minimum {
                problems.push(format!(
                    "unsupported mongoVersion '{}', minimum supported version is {}",
                    version, MIN_SUPPORTED_VERSION
                ));
            }
        }
        Ok(None) => {}
        Err(_) => problems.push(format!(
            "invalid mongoVersion '{}'",
            server.version.as_deref().unwrap_or_default()
        )),
    }

    if server.is_auth() {
        let is_arbiter = membership.is_some_and(|m| m.arbiter_only);
        if is_arbiter && server.db_users("local").is_empty() {
            problems.push("arbiter with auth enabled but no local users".to_string());
        } else if !is_arbiter && server.admin_users().is_empty() {
            problems.push("auth enabled but no admin users".to_string());
        }
    }

    if problems.is_empty() {
        return Ok(());
    }
    Err(Error::Configuration(format!(
        "Invalid server '{}': {}",
        server.id,
        problems.join("; ")
    )))
}

/// Validates a cluster definition against the servers backing its members.
///
/// A cluster needs a replication key as soon as one member needs it.
pub fn validate_cluster(cluster: &Cluster, member_servers: &[Server]) -> Result<()> {
    let needs_key = member_servers
        .iter()
        .any(|server| server.needs_repl_key(cluster.has_member_server(&server.id)));

    if needs_key && cluster.repl_key.as_deref().is_none_or(str::is_empty) {
        return Err(Error::Configuration(format!(
            "Cluster '{}' has members with auth enabled but no replKey",
            cluster.id
        )));
    }

    Ok(())
}
