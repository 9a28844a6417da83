//! Wire types exchanged between mesh nodes and exposed through the HTTP
//! surfaces. Everything here is plain data; the routing semantics live in the
//! `rib` crate.
//!
//! All JSON field names are camelCase, matching what the peers put on the
//! wire (`nodePath`, `envoyPort`, `peerName`, ...).

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Application protocol label carried by a data channel.
///
/// The label set is open ended; nodes forward labels they do not recognize
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    HttpGraphql,
    HttpGql,
    HttpGrpc,
    Tcp,
    Other(String),
}

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Http => "http",
            Self::HttpGraphql => "http:graphql",
            Self::HttpGql => "http:gql",
            Self::HttpGrpc => "http:grpc",
            Self::Tcp => "tcp",
            Self::Other(label) => label,
        }
    }

    /// Whether traffic on this channel speaks GraphQL, in either of the two
    /// label spellings found on the wire.
    pub fn is_graphql(&self) -> bool {
        matches!(self, Self::HttpGraphql | Self::HttpGql)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "http" => Self::Http,
            "http:graphql" => Self::HttpGraphql,
            "http:gql" => Self::HttpGql,
            "http:grpc" => Self::HttpGrpc,
            "tcp" => Self::Tcp,
            other => Self::Other(other.to_string()),
        })
    }
}

impl Serialize for Protocol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("protocol parsing is infallible"))
    }
}

/// Identity-plus-reachability record a node advertises about itself and
/// stores about its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Fully qualified node name, e.g. `node-a.example.local`.
    pub name: String,
    /// URL the node's control plane listens on.
    pub endpoint: String,
    /// Domain suffixes the node claims membership in.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Credential presented when dialing this peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_token: Option<String>,
    /// Externally routable name, if the node is reachable from outside the
    /// overlay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    /// Address of the node's data-plane proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_address: Option<String>,
}

/// Lifecycle state of a peering session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Initializing,
    Connected,
    Degraded,
}

/// A peer as tracked by the routing table: the wire record plus the local
/// view of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    #[serde(flatten)]
    pub info: PeerInfo,
    pub connection_status: ConnectionStatus,
    /// Seconds-resolution timestamp of the last message from this peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_received: Option<u64>,
}

/// A service originated by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChannelDefinition {
    /// Unique per node.
    pub name: String,
    pub protocol: Protocol,
    /// Upstream URL of the service.
    pub endpoint: String,
    /// Listener port for inbound traffic on the advertising node's proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envoy_port: Option<u16>,
}

/// A service learned from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRoute {
    #[serde(flatten)]
    pub channel: DataChannelDefinition,
    /// Next hop toward the service.
    pub peer: PeerInfo,
    pub peer_name: String,
    /// Node names the route has traversed, latest hop first.
    pub node_path: Vec<String>,
}

/// Reference to a route by name, as carried in withdrawals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRef {
    pub name: String,
}

/// One advertisement or withdrawal inside an [`UpdateMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RouteUpdate {
    Add {
        route: DataChannelDefinition,
        node_path: Vec<String>,
    },
    Remove {
        route: RouteRef,
    },
}

/// Batch of route changes sent between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub updates: Vec<RouteUpdate>,
}

/// Generic call outcome envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(error: impl ToString) -> Self {
        Self {
            ok: false,
            error: Some(error.to_string()),
        }
    }
}

/// Response to an `open`: the callee returns its own advertised record so the
/// dialing side can merge fresh reachability fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a `close` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseRequest {
    pub peer: PeerInfo,
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of an `update` call: the sender's identity plus the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub peer: PeerInfo,
    #[serde(flatten)]
    pub message: UpdateMessage,
}

/// Route listing returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteList {
    pub local: Vec<DataChannelDefinition>,
    pub internal: Vec<InternalRoute>,
}
