//! Cloud control-plane models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ServerId = u64;

/// VM lifecycle state as reported by the vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    Migrating,
    Rebuilding,
    #[serde(other)]
    Unknown,
}

/// The parts of a server object the orchestrator cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub status: ServerStatus,
    pub public_ipv4: Option<String>,
}

impl ServerInfo {
    /// Running and reachable at a public address
    pub fn is_healthy(&self) -> bool {
        self.status == ServerStatus::Running && self.public_ipv4.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLookup {
    Found(ServerInfo),
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
}

impl DeleteOutcome {
    pub fn was_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted)
    }
}

/// Everything needed to request a VM
#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: String,
    pub user_data: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub start_after_create: bool,
}

// wire shapes

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub server: ServerObject,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerObject {
    pub id: ServerId,
    pub status: ServerStatus,
    #[serde(default)]
    pub public_net: Option<PublicNet>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4Address>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Ipv4Address {
    pub ip: String,
}

impl From<ServerObject> for ServerInfo {
    fn from(server: ServerObject) -> Self {
        let public_ipv4 = server
            .public_net
            .and_then(|net| net.ipv4)
            .map(|v4| v4.ip)
            .filter(|ip| !ip.is_empty() && ip != "0.0.0.0");
        ServerInfo {
            id: server.id,
            status: server.status,
            public_ipv4,
        }
    }
}
