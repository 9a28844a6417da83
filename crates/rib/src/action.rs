use proto::{DataChannelDefinition, PeerInfo, UpdateMessage};

/// The only way state changes: a tagged command fed through the action queue.
///
/// `LocalPeer*`/`LocalRoute*` originate from operators; the `Protocol*`
/// variants are produced by inbound peer calls and by the periodic tick.
#[derive(Debug, Clone)]
pub enum Action {
    LocalPeerCreate(PeerInfo),
    LocalPeerUpdate(PeerInfo),
    LocalPeerDelete { name: String },
    LocalRouteCreate(DataChannelDefinition),
    LocalRouteDelete(DataChannelDefinition),
    ProtocolOpen(PeerInfo),
    ProtocolConnected(PeerInfo),
    ProtocolClose {
        peer: PeerInfo,
        code: u32,
        reason: Option<String>,
    },
    ProtocolUpdate {
        peer: PeerInfo,
        message: UpdateMessage,
    },
    ProtocolKeepalive(PeerInfo),
    Tick,
}

impl Action {
    /// Stable label presented to the authorization capability and used in
    /// logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::LocalPeerCreate(_) => "peer.create",
            Self::LocalPeerUpdate(_) => "peer.update",
            Self::LocalPeerDelete { .. } => "peer.delete",
            Self::LocalRouteCreate(_) => "route.create",
            Self::LocalRouteDelete(_) => "route.delete",
            Self::ProtocolOpen(_) => "protocol.open",
            Self::ProtocolConnected(_) => "protocol.connected",
            Self::ProtocolClose { .. } => "protocol.close",
            Self::ProtocolUpdate { .. } => "protocol.update",
            Self::ProtocolKeepalive(_) => "protocol.keepalive",
            Self::Tick => "protocol.tick",
        }
    }
}
