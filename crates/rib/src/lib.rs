//! Routing information base for the mesh control plane.
//!
//! The RIB owns the route table and nothing else: every action is first
//! [`plan`](Rib::plan)ned against the current state without side effects,
//! then [`commit`](Rib::commit)ted as an atomic swap. Planning derives the
//! messages that must go out to peers; delivering them is the caller's
//! problem. The only piece of the outside world that commits touch is the
//! listener [`PortAllocator`], reconciled on the same single-writer segment
//! so that allocations always describe the committed table.

pub mod action;
pub mod plan;
pub mod ports;
pub mod table;

use ahash::AHashSet;
use proto::{PeerInfo, RouteUpdate};

pub use self::{
    action::Action,
    plan::{CLOSE_DECONFIGURED, Plan, Propagation},
    ports::{PortAllocator, PortRange},
    table::{RouteTable, egress_key},
};

/// This node's identity as carried in the route table and advertised to
/// peers.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub endpoint: String,
    pub domains: Vec<String>,
    pub public_address: Option<String>,
    pub envoy_address: Option<String>,
}

impl Node {
    /// The wire record this node advertises about itself. Credentials are
    /// never part of it; tokens travel in transport headers.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            domains: self.domains.clone(),
            peer_token: None,
            public_address: self.public_address.clone(),
            envoy_address: self.envoy_address.clone(),
        }
    }
}

/// Precondition failures surfaced by [`Rib::plan`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RibError {
    #[error("peer `{0}` already exists")]
    PeerExists(String),
    #[error("peer `{0}` not found")]
    PeerNotFound(String),
    #[error("peer `{0}` is not configured on this node")]
    PeerNotConfigured(String),
    #[error("route `{0}` already exists")]
    RouteExists(String),
    #[error("route `{0}` not found")]
    RouteNotFound(String),
}

/// Result of a committed action.
#[derive(Debug)]
pub struct Committed {
    /// Messages to deliver, one target peer each, with listener ports already
    /// rewritten to this node's allocations.
    pub propagations: Vec<Propagation>,
    /// Whether the committed table differs from the previous one in a way
    /// the data plane can observe (routes, ports, peer reachability).
    pub data_plane_dirty: bool,
}

pub struct Rib {
    node: Node,
    hold_time: u64,
    state: RouteTable,
}

impl Rib {
    pub fn new(node: Node, hold_time: u64) -> Self {
        Self {
            node,
            hold_time,
            state: RouteTable::default(),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Read-only view of the committed table.
    pub fn state(&self) -> &RouteTable {
        &self.state
    }

    /// Computes the table that would result from `action` and the messages to
    /// emit, without touching the committed state.
    pub fn plan(&self, action: &Action, now: u64) -> Result<Plan, RibError> {
        plan::plan(&self.node, self.hold_time, &self.state, action, now)
    }

    /// Swaps in the planned table. With an allocator, listener bindings are
    /// reconciled against the new table first: local channels without an
    /// operator-fixed port get one (key = route name), every learned route
    /// gets an egress binding (key = `egress_{name}_via_{peer}`), and
    /// bindings whose route is gone are released. Outbound advertisements are
    /// then rewritten to carry this node's listener ports instead of the
    /// upstream ones.
    pub fn commit(&mut self, plan: Plan, allocator: Option<&mut PortAllocator>) -> Committed {
        let Plan {
            mut state,
            mut propagations,
        } = plan;

        let mut ports_changed = false;
        if let Some(allocator) = allocator {
            let before = allocator.allocations();
            reconcile_ports(&mut state, allocator);
            rewrite_advertised_ports(&mut propagations, &state, allocator);
            ports_changed = before != allocator.allocations();
        }

        let data_plane_dirty = ports_changed
            || state.local != self.state.local
            || state.internal != self.state.internal
            || reachability(&state) != reachability(&self.state);

        self.state = state;

        Committed {
            propagations,
            data_plane_dirty,
        }
    }
}

fn reconcile_ports(state: &mut RouteTable, allocator: &mut PortAllocator) {
    let mut desired = AHashSet::new();
    for (name, route) in &state.local {
        // A port set by the operator is not allocator-owned and keeps its
        // value; everything else belongs to the pool.
        if route.envoy_port.is_none() || allocator.port_of(name) == route.envoy_port {
            desired.insert(name.clone());
        }
    }

    for (name, via) in state.internal.keys() {
        desired.insert(egress_key(name, via));
    }

    for key in allocator.allocations().into_keys() {
        if !desired.contains(&key) {
            allocator.release(&key);
        }
    }

    let mut names: Vec<_> = state.local.keys().cloned().collect();
    names.sort();
    for name in names {
        if let Some(route) = state.local.get_mut(&name) {
            if route.envoy_port.is_none() {
                route.envoy_port = allocator.allocate(&name);
            }
        }
    }

    let mut keys: Vec<_> = state.internal.keys().cloned().collect();
    keys.sort();
    for (name, via) in keys {
        allocator.allocate(&egress_key(&name, &via));
    }
}

/// Advertised routes must name the listener on *this* node: local channels
/// carry their local binding, relayed routes carry the egress binding toward
/// the hop they were learned from (the second entry of the advertised path).
/// Withdrawals pass through untouched.
fn rewrite_advertised_ports(
    propagations: &mut [Propagation],
    state: &RouteTable,
    allocator: &PortAllocator,
) {
    for propagation in propagations {
        let Propagation::Update { message, .. } = propagation else {
            continue;
        };

        for update in &mut message.updates {
            let RouteUpdate::Add { route, node_path } = update else {
                continue;
            };

            route.envoy_port = if node_path.len() <= 1 {
                state.local.get(&route.name).and_then(|r| r.envoy_port)
            } else {
                allocator.port_of(&egress_key(&route.name, &node_path[1]))
            };
        }
    }
}

/// Projection of the peer set the data plane cares about: who the peers are
/// and where their proxies live. Liveness timestamps and session states are
/// control-plane-only and excluded.
fn reachability(state: &RouteTable) -> Vec<(String, String, Option<String>, Option<String>)> {
    let mut peers: Vec<_> = state
        .peers
        .values()
        .map(|p| {
            (
                p.info.name.clone(),
                p.info.endpoint.clone(),
                p.info.envoy_address.clone(),
                p.info.public_address.clone(),
            )
        })
        .collect();
    peers.sort();
    peers
}

#[cfg(test)]
mod tests {
    use proto::{
        ConnectionStatus, DataChannelDefinition, PeerRecord, Protocol, RouteRef, UpdateMessage,
    };

    use super::*;

    fn node() -> Node {
        Node {
            name: "a.x.io".into(),
            endpoint: "http://a:3100".into(),
            domains: vec!["x.io".into()],
            public_address: None,
            envoy_address: None,
        }
    }

    fn peer_info(name: &str) -> PeerInfo {
        PeerInfo {
            name: name.into(),
            endpoint: format!("http://{name}:3100"),
            domains: vec!["x.io".into()],
            peer_token: None,
            public_address: None,
            envoy_address: None,
        }
    }

    fn channel(name: &str) -> DataChannelDefinition {
        DataChannelDefinition {
            name: name.into(),
            protocol: Protocol::Http,
            endpoint: format!("http://{name}:8080"),
            envoy_port: None,
        }
    }

    fn rib_with_connected_peers(peers: &[&str]) -> Rib {
        let mut rib = Rib::new(node(), 90);
        for name in peers {
            rib.state.peers.insert(
                name.to_string(),
                PeerRecord {
                    info: peer_info(name),
                    connection_status: ConnectionStatus::Connected,
                    last_message_received: Some(0),
                },
            );
        }
        rib
    }

    fn apply(rib: &mut Rib, allocator: &mut PortAllocator, action: Action) -> Committed {
        let plan = rib.plan(&action, 1).unwrap();
        rib.commit(plan, Some(allocator))
    }

    #[test]
    fn local_routes_get_ascending_ports_and_exhaustion_is_non_fatal() {
        let mut rib = rib_with_connected_peers(&[]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10000)]);

        let first = apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("one")));
        assert!(first.data_plane_dirty);
        assert_eq!(rib.state().local["one"].envoy_port, Some(10000));

        let second = apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("two")));
        assert!(second.data_plane_dirty);
        assert_eq!(rib.state().local["two"].envoy_port, None);
        assert_eq!(allocator.allocated(), 1);
    }

    #[test]
    fn route_delete_restores_the_allocator() {
        let mut rib = rib_with_connected_peers(&[]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("svc")));
        assert_eq!(allocator.port_of("svc"), Some(10000));

        apply(&mut rib, &mut allocator, Action::LocalRouteDelete(channel("svc")));
        assert!(rib.state().local.is_empty());
        assert!(allocator.is_empty());

        // The lowest port is handed out again.
        apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("other")));
        assert_eq!(rib.state().local["other"].envoy_port, Some(10000));
    }

    #[test]
    fn duplicate_route_create_fails_and_keeps_the_binding() {
        let mut rib = rib_with_connected_peers(&[]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("svc")));
        assert!(rib.plan(&Action::LocalRouteCreate(channel("svc")), 2).is_err());

        // A no-op-equivalent action leaves the assignment untouched.
        apply(&mut rib, &mut allocator, Action::Tick);
        assert_eq!(rib.state().local["svc"].envoy_port, Some(10000));
    }

    #[test]
    fn operator_fixed_ports_are_not_reallocated() {
        let mut rib = rib_with_connected_peers(&[]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        let mut fixed = channel("svc");
        fixed.envoy_port = Some(15001);
        apply(&mut rib, &mut allocator, Action::LocalRouteCreate(fixed));

        assert_eq!(rib.state().local["svc"].envoy_port, Some(15001));
        assert!(allocator.is_empty());
    }

    #[test]
    fn relayed_advertisements_carry_the_egress_port() {
        let mut rib = rib_with_connected_peers(&["b.x.io", "c.x.io"]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        let mut advertised = channel("books");
        advertised.envoy_port = Some(5000);

        let committed = apply(
            &mut rib,
            &mut allocator,
            Action::ProtocolUpdate {
                peer: peer_info("b.x.io"),
                message: UpdateMessage {
                    updates: vec![RouteUpdate::Add {
                        route: advertised,
                        node_path: vec!["b.x.io".into()],
                    }],
                },
            },
        );

        // Stored as received; the local listener lives in the allocator.
        let stored = &rib.state().internal[&("books".to_string(), "b.x.io".to_string())];
        assert_eq!(stored.channel.envoy_port, Some(5000));
        let egress = allocator.port_of("egress_books_via_b.x.io").unwrap();
        assert!((10000..=10100).contains(&egress));

        assert_eq!(committed.propagations.len(), 1);
        match &committed.propagations[0] {
            Propagation::Update { target, message } => {
                assert_eq!(target.name, "c.x.io");
                assert_eq!(
                    message.updates,
                    vec![RouteUpdate::Add {
                        route: DataChannelDefinition {
                            envoy_port: Some(egress),
                            ..channel("books")
                        },
                        node_path: vec!["a.x.io".into(), "b.x.io".into()],
                    }]
                );
            }
            other => panic!("unexpected propagation: {other:?}"),
        }
    }

    #[test]
    fn withdrawals_pass_through_unchanged_and_release_the_egress_binding() {
        let mut rib = rib_with_connected_peers(&["b.x.io", "c.x.io"]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        apply(
            &mut rib,
            &mut allocator,
            Action::ProtocolUpdate {
                peer: peer_info("b.x.io"),
                message: UpdateMessage {
                    updates: vec![RouteUpdate::Add {
                        route: channel("books"),
                        node_path: vec!["b.x.io".into()],
                    }],
                },
            },
        );
        assert_eq!(allocator.allocated(), 1);

        let committed = apply(
            &mut rib,
            &mut allocator,
            Action::ProtocolUpdate {
                peer: peer_info("b.x.io"),
                message: UpdateMessage {
                    updates: vec![RouteUpdate::Remove {
                        route: RouteRef {
                            name: "books".into(),
                        },
                    }],
                },
            },
        );

        assert!(allocator.is_empty());
        match &committed.propagations[0] {
            Propagation::Update { target, message } => {
                assert_eq!(target.name, "c.x.io");
                assert_eq!(
                    message.updates,
                    vec![RouteUpdate::Remove {
                        route: RouteRef {
                            name: "books".into()
                        }
                    }]
                );
            }
            other => panic!("unexpected propagation: {other:?}"),
        }
    }

    #[test]
    fn every_allocation_maps_to_a_committed_route() {
        let mut rib = rib_with_connected_peers(&["b.x.io"]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("svc")));
        apply(
            &mut rib,
            &mut allocator,
            Action::ProtocolUpdate {
                peer: peer_info("b.x.io"),
                message: UpdateMessage {
                    updates: vec![RouteUpdate::Add {
                        route: channel("books"),
                        node_path: vec!["b.x.io".into()],
                    }],
                },
            },
        );
        apply(
            &mut rib,
            &mut allocator,
            Action::LocalPeerDelete {
                name: "b.x.io".into(),
            },
        );

        for key in allocator.allocations().into_keys() {
            let known = rib.state().local.contains_key(&key)
                || rib
                    .state()
                    .internal
                    .keys()
                    .any(|(name, via)| egress_key(name, via) == key);
            assert!(known, "stale allocation {key}");
        }
        assert_eq!(allocator.allocated(), 1);
    }

    #[test]
    fn keepalive_commits_are_not_data_plane_dirty() {
        let mut rib = rib_with_connected_peers(&["b.x.io"]);
        let mut allocator = PortAllocator::new(vec![PortRange::new(10000, 10100)]);

        let committed = apply(&mut rib, &mut allocator, Action::ProtocolKeepalive(peer_info("b.x.io")));
        assert!(!committed.data_plane_dirty);

        let committed = apply(&mut rib, &mut allocator, Action::LocalRouteCreate(channel("svc")));
        assert!(committed.data_plane_dirty);
    }
}
