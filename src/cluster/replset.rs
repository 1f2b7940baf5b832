use crate::error::{Error, Result};
use mongodb::bson::{Bson, Document, doc};

/// One entry of a replica set configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberConfig {
    /// Member id, assigned when the configuration is built.
    pub id: Option<i32>,
    /// `host:port` of the member.
    pub host: String,
    /// Any other member fields (`priority`, `arbiterOnly`, `votes`, ...).
    pub extra: Document,
}

impl MemberConfig {
    /// Member entry without an id.
    pub fn new(host: impl Into<String>, extra: Document) -> Self {
        Self {
            id: None,
            host: host.into(),
            extra,
        }
    }

    /// Reads a member entry from a configuration document.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let host = doc
            .get_str("host")
            .map_err(|_| Error::Serialization("Replica set member without a host".to_string()))?
            .to_string();
        let id = match doc.get("_id") {
            Some(value) => {
                let id = as_i64(value)?;
                Some(i32::try_from(id).map_err(|_| {
                    Error::Serialization(format!("Member id {} out of range", id))
                })?)
            }
            None => None,
        };
        let mut extra = doc.clone();
        extra.remove("_id");
        extra.remove("host");
        Ok(Self { id, host, extra })
    }

    /// Renders the member entry.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        if let Some(id) = self.id {
            doc.insert("_id", id);
        }
        doc.insert("host", self.host.clone());
        for (key, value) in &self.extra {
            doc.insert(key.clone(), value.clone());
        }
        doc
    }
}

/// A replica set configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSetConfig {
    /// Replica set name.
    pub id: String,
    /// Configuration version, absent for an initial configuration.
    pub version: Option<i64>,
    /// Members of the set.
    pub members: Vec<MemberConfig>,
}

impl ReplicaSetConfig {
    /// Reads a configuration as stored in `local.system.replset`.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let id = doc
            .get_str("_id")
            .map_err(|_| Error::Serialization("Replica set config without an _id".to_string()))?
            .to_string();
        let version = doc.get("version").map(as_i64).transpose()?;
        let members = match doc.get_array("members") {
            Ok(members) => members
                .iter()
                .map(|m| match m {
                    Bson::Document(m) => MemberConfig::from_document(m),
                    other => Err(Error::Serialization(format!(
                        "Unexpected replica set member entry {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            Err(_) => Vec::new(),
        };
        Ok(Self {
            id,
            version,
            members,
        })
    }

    /// Renders the configuration document.
    pub fn to_document(&self) -> Document {
        let mut doc = doc! { "_id": self.id.clone() };
        if let Some(version) = self.version {
            doc.insert("version", version);
        }
        let members: Vec<Bson> = self
            .members
            .iter()
            .map(|m| Bson::Document(m.to_document()))
            .collect();
        doc.insert("members", members);
        doc
    }

    /// Member entry for a host, compared as plain strings.
    pub fn member_for_host(&self, host: &str) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.host == host)
    }

    /// Highest member id in use.
    pub fn max_member_id(&self) -> Option<i32> {
        self.members.iter().filter_map(|m| m.id).max()
    }
}

/// Assigns ids to members that lack one.
///
/// A member whose host appears in `current` keeps the id it has there. Other
/// members get fresh ids above the highest id in `current`, counting from 0
/// when there is no current configuration.
pub fn assign_member_ids(members: &mut [MemberConfig], current: Option<&ReplicaSetConfig>) {
    let mut next_id = current
        .and_then(ReplicaSetConfig::max_member_id)
        .map(|max| max + 1)
        .unwrap_or(0);

    for member in members.iter_mut().filter(|m| m.id.is_none()) {
        let existing = current
            .and_then(|c| c.member_for_host(&member.host))
            .and_then(|m| m.id);
        member.id = Some(existing.unwrap_or_else(|| {
            let id = next_id;
            next_id += 1;
            id
        }));
    }
}

/// Version for a new configuration replacing `current`.
pub fn next_version(current: Option<&ReplicaSetConfig>) -> i64 {
    current.and_then(|c| c.version).map(|v| v + 1).unwrap_or(1)
}

/// `replSetInitiate` command for a configuration.
pub fn initiate_command(config: &ReplicaSetConfig) -> Document {
    doc! { "replSetInitiate": config.to_document() }
}

/// `replSetReconfig` command for a configuration.
pub fn reconfig_command(config: &ReplicaSetConfig) -> Document {
    doc! { "replSetReconfig": config.to_document() }
}

fn as_i64(value: &Bson) -> Result<i64> {
    match value {
        Bson::Int32(v) => Ok(i64::from(*v)),
        Bson::Int64(v) => Ok(*v),
        Bson::Double(v) if v.fract() == 0.0 => Ok(*v as i64),
        other => Err(Error::Serialization(format!("Expected an integer, got {}", other))),
    }
}
