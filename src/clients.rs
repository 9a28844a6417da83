//! Capability-scoped client surfaces. A caller acquires one by presenting a
//! token; every call is gated against the authorization capability before it
//! reaches the action queue.

use proto::{DataChannelDefinition, PeerInfo, PeerRecord, RouteList, UpdateMessage};
use rib::Action;

use crate::bus::{Bus, BusError};

/// Peer management: who this node peers with.
pub struct NetworkClient {
    bus: Bus,
    token: Option<String>,
}

impl NetworkClient {
    pub(crate) fn new(bus: Bus, token: Option<String>) -> Self {
        Self { bus, token }
    }

    async fn run(&self, action: Action) -> Result<(), BusError> {
        self.bus.authorize(self.token.as_deref(), action.tag()).await?;
        self.bus.dispatch(action).await
    }

    pub async fn add_peer(&self, peer: PeerInfo) -> Result<(), BusError> {
        self.run(Action::LocalPeerCreate(peer)).await
    }

    pub async fn update_peer(&self, peer: PeerInfo) -> Result<(), BusError> {
        self.run(Action::LocalPeerUpdate(peer)).await
    }

    pub async fn remove_peer(&self, name: &str) -> Result<(), BusError> {
        self.run(Action::LocalPeerDelete {
            name: name.to_string(),
        })
        .await
    }

    pub async fn list_peers(&self) -> Result<Vec<PeerRecord>, BusError> {
        self.bus.authorize(self.token.as_deref(), "peer.list").await?;
        Ok(self.bus.snapshot().table.peers_sorted())
    }
}

/// Route management: the services this node originates and has learned.
pub struct DataChannelClient {
    bus: Bus,
    token: Option<String>,
}

impl DataChannelClient {
    pub(crate) fn new(bus: Bus, token: Option<String>) -> Self {
        Self { bus, token }
    }

    async fn run(&self, action: Action) -> Result<(), BusError> {
        self.bus.authorize(self.token.as_deref(), action.tag()).await?;
        self.bus.dispatch(action).await
    }

    pub async fn add_route(&self, channel: DataChannelDefinition) -> Result<(), BusError> {
        self.run(Action::LocalRouteCreate(channel)).await
    }

    pub async fn remove_route(&self, channel: DataChannelDefinition) -> Result<(), BusError> {
        self.run(Action::LocalRouteDelete(channel)).await
    }

    pub async fn list_routes(&self) -> Result<RouteList, BusError> {
        self.bus.authorize(self.token.as_deref(), "route.list").await?;

        let snapshot = self.bus.snapshot();
        Ok(RouteList {
            local: snapshot.table.local_sorted(),
            internal: snapshot.table.internal_sorted(),
        })
    }
}

/// The peer-facing protocol surface, normally invoked by another node's
/// transport.
pub struct IbgpClient {
    bus: Bus,
    token: Option<String>,
}

impl IbgpClient {
    pub(crate) fn new(bus: Bus, token: Option<String>) -> Self {
        Self { bus, token }
    }

    async fn run(&self, action: Action) -> Result<(), BusError> {
        self.bus.authorize(self.token.as_deref(), action.tag()).await?;
        self.bus.dispatch(action).await
    }

    /// Handles an inbound session open and answers with this node's own
    /// advertised identity.
    pub async fn open(&self, peer: PeerInfo) -> Result<PeerInfo, BusError> {
        self.run(Action::ProtocolOpen(peer)).await?;
        Ok(self.bus.node_info())
    }

    pub async fn close(
        &self,
        peer: PeerInfo,
        code: u32,
        reason: Option<String>,
    ) -> Result<(), BusError> {
        self.run(Action::ProtocolClose { peer, code, reason }).await
    }

    pub async fn update(&self, peer: PeerInfo, message: UpdateMessage) -> Result<(), BusError> {
        self.run(Action::ProtocolUpdate { peer, message }).await
    }

    pub async fn keepalive(&self, peer: PeerInfo) -> Result<(), BusError> {
        self.run(Action::ProtocolKeepalive(peer)).await
    }
}
