use ahash::AHashMap;
use proto::{ConnectionStatus, DataChannelDefinition, InternalRoute, PeerRecord};

/// Key of a learned route: `(route name, name of the peer it came from)`.
pub type RouteKey = (String, String);

/// Allocator key for the local egress listener of a learned route.
pub fn egress_key(name: &str, peer_name: &str) -> String {
    format!("egress_{name}_via_{peer_name}")
}

/// The authoritative in-memory routing state.
///
/// Locally originated channels are keyed by name; learned routes by
/// `(name, peerName)`, so the same service can be reachable through several
/// peers at once. The table is plain data: it is cloned by `plan`, swapped by
/// `commit`, and never mutated anywhere else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    pub local: AHashMap<String, DataChannelDefinition>,
    pub peers: AHashMap<String, PeerRecord>,
    pub internal: AHashMap<RouteKey, InternalRoute>,
}

impl RouteTable {
    pub fn local_sorted(&self) -> Vec<DataChannelDefinition> {
        let mut routes: Vec<_> = self.local.values().cloned().collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }

    pub fn internal_sorted(&self) -> Vec<InternalRoute> {
        let mut routes: Vec<_> = self.internal.values().cloned().collect();
        routes.sort_by(|a, b| (&a.channel.name, &a.peer_name).cmp(&(&b.channel.name, &b.peer_name)));
        routes
    }

    pub fn peers_sorted(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        peers
    }

    /// Peers with an established session, in name order.
    pub fn connected_peers(&self) -> Vec<&PeerRecord> {
        let mut peers: Vec<_> = self
            .peers
            .values()
            .filter(|p| p.connection_status == ConnectionStatus::Connected)
            .collect();
        peers.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        peers
    }

    /// Removes every learned route that came from `peer_name` and returns the
    /// dropped routes in name order.
    pub fn remove_peer_routes(&mut self, peer_name: &str) -> Vec<InternalRoute> {
        let mut dropped: Vec<InternalRoute> = Vec::new();
        self.internal.retain(|(_, via), route| {
            if via == peer_name {
                dropped.push(route.clone());
                false
            } else {
                true
            }
        });

        dropped.sort_by(|a, b| a.channel.name.cmp(&b.channel.name));
        dropped
    }
}
