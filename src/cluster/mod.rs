/// Replica set orchestration.
///
/// This module turns cluster definitions into replica set configuration
/// documents and drives them onto running members: initialization of a new
/// set, reconfiguration of an existing one, and incremental member addition.
/// Commands that make the primary drop its connections are treated as sent.
///
/// # Components
///
/// * `replset` - Configuration documents, member id allocation and versioning
/// * `orchestrator` - Member resolution, primary discovery and the init/reconfig flows
///
/// # Examples
///
/// ```
/// use mongo_runner::cluster::{MemberConfig, assign_member_ids};
/// use mongodb::bson::Document;
///
/// let mut members = vec![
///     MemberConfig::new("a:27017", Document::new()),
///     MemberConfig::new("b:27017", Document::new()),
/// ];
/// assign_member_ids(&mut members, None);
/// assert_eq!(members[1].id, Some(1));
/// ```
mod orchestrator;
mod replset;

pub use orchestrator::{ReplicaSetOrchestrator, ResolvedMember};
pub use replset::{
    MemberConfig, ReplicaSetConfig, assign_member_ids, initiate_command, next_version,
    reconfig_command,
};
