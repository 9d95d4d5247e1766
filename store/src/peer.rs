//! Cluster membership as seen by the store node.
//!
//! The coordination code only needs the [`PeerDirectory`] contract: a fresh
//! list of addresses for a role on every call, and a serializable snapshot for
//! `/_clusterstate`. [`StaticPeers`] implements it from configuration and can
//! be updated at runtime.

use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerType {
    /// Accepts writes from clients and replicates them to stores.
    Ingest,
    /// Stores segments and answers queries.
    Store,
    /// Both of the above.
    IngestStore,
}

impl PeerType {
    /// Returns true if a peer of this type serves the given role.
    pub fn serves(self, role: PeerType) -> bool {
        self == role || self == PeerType::IngestStore
    }
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerType::Ingest => "ingest",
            PeerType::Store => "store",
            PeerType::IngestStore => "ingeststore",
        };
        f.write_str(name)
    }
}

impl FromStr for PeerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(PeerType::Ingest),
            "store" => Ok(PeerType::Store),
            "ingeststore" => Ok(PeerType::IngestStore),
            _ => Err(Error::InvalidInput(format!("unknown peer type: {}", s))),
        }
    }
}

/// Source of current cluster membership.
///
/// Implementations must be cheap to call: the scatter-gather path asks for a
/// fresh snapshot on every query and the stream multiplexer on every refresh.
pub trait PeerDirectory: Send + Sync {
    /// Returns the addresses (`host:port`) of peers serving `role`.
    fn current(&self, role: PeerType) -> Vec<String>;

    /// Returns a snapshot of the membership state.
    fn state(&self) -> serde_json::Value;
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub addr: String,
    #[serde(rename = "type")]
    pub peer_type: PeerType,
}

impl Peer {
    pub fn new(addr: impl Into<String>, peer_type: PeerType) -> Self {
        Self {
            addr: addr.into(),
            peer_type,
        }
    }
}

/// Membership taken from configuration.
///
/// The local node is always a member. Other members can be added and removed
/// while the node runs.
#[derive(Debug)]
pub struct StaticPeers {
    local: Peer,
    members: RwLock<Vec<Peer>>,
}

#[derive(Serialize)]
struct StaticPeersState<'a> {
    local: &'a Peer,
    members: &'a [Peer],
}

impl StaticPeers {
    pub fn new(local: Peer, peers: impl IntoIterator<Item = Peer>) -> Self {
        let directory = Self {
            members: RwLock::new(vec![local.clone()]),
            local,
        };
        for peer in peers {
            directory.join(peer);
        }
        directory
    }

    /// Adds a member, replacing any member with the same address.
    pub fn join(&self, peer: Peer) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        members.retain(|m| m.addr != peer.addr);
        tracing::info!(peer = %peer.addr, peer_type = %peer.peer_type, "peer joined");
        members.push(peer);
    }

    /// Removes a member. The local node cannot leave.
    pub fn leave(&self, addr: &str) {
        if addr == self.local.addr {
            return;
        }
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        let before = members.len();
        members.retain(|m| m.addr != addr);
        if members.len() < before {
            tracing::info!(peer = %addr, "peer left");
        }
    }
}

impl PeerDirectory for StaticPeers {
    fn current(&self, role: PeerType) -> Vec<String> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.peer_type.serves(role))
            .map(|m| m.addr.clone())
            .collect()
    }

    fn state(&self) -> serde_json::Value {
        let members = self.members.read().unwrap_or_else(|e| e.into_inner());
        let state = StaticPeersState {
            local: &self.local,
            members: &members,
        };
        serde_json::to_value(state).unwrap_or(serde_json::Value::Null)
    }
}
