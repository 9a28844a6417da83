use proto::{
    ConnectionStatus, InternalRoute, PeerInfo, PeerRecord, RouteRef, RouteUpdate, UpdateMessage,
};

use crate::{
    Node, RibError,
    action::Action,
    table::RouteTable,
};

/// Close code sent to a peer that is being deconfigured.
pub const CLOSE_DECONFIGURED: u32 = 1000;

/// An outbound message derived by `plan`, to be delivered post-commit to one
/// specific peer. The RIB itself never performs I/O.
#[derive(Debug, Clone)]
pub enum Propagation {
    Open {
        target: PeerInfo,
    },
    Close {
        target: PeerInfo,
        code: u32,
        reason: String,
    },
    Update {
        target: PeerInfo,
        message: UpdateMessage,
    },
    Keepalive {
        target: PeerInfo,
    },
}

impl Propagation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Close { .. } => "close",
            Self::Update { .. } => "update",
            Self::Keepalive { .. } => "keepalive",
        }
    }

    pub fn target(&self) -> &PeerInfo {
        match self {
            Self::Open { target }
            | Self::Close { target, .. }
            | Self::Update { target, .. }
            | Self::Keepalive { target } => target,
        }
    }
}

/// The state that would result from an action, plus the messages it must
/// emit. Produced by `plan`, consumed by `commit`; nothing is applied until
/// then.
#[derive(Debug)]
pub struct Plan {
    pub(crate) state: RouteTable,
    pub(crate) propagations: Vec<Propagation>,
}

pub(crate) fn plan(
    node: &Node,
    hold_time: u64,
    current: &RouteTable,
    action: &Action,
    now: u64,
) -> Result<Plan, RibError> {
    let mut state = current.clone();
    let mut propagations = Vec::new();

    match action {
        Action::LocalPeerCreate(info) => {
            if state.peers.contains_key(&info.name) {
                return Err(RibError::PeerExists(info.name.clone()));
            }

            state.peers.insert(
                info.name.clone(),
                PeerRecord {
                    info: info.clone(),
                    connection_status: ConnectionStatus::Initializing,
                    last_message_received: None,
                },
            );

            propagations.push(Propagation::Open {
                target: info.clone(),
            });
        }
        Action::LocalPeerUpdate(info) => {
            let record = state
                .peers
                .get_mut(&info.name)
                .ok_or_else(|| RibError::PeerNotFound(info.name.clone()))?;

            record.info = info.clone();
            record.connection_status = ConnectionStatus::Initializing;
            record.last_message_received = None;

            propagations.push(Propagation::Open {
                target: info.clone(),
            });
        }
        Action::LocalPeerDelete { name } => {
            let record = state
                .peers
                .remove(name)
                .ok_or_else(|| RibError::PeerNotFound(name.clone()))?;

            let dropped = state.remove_peer_routes(name);

            propagations.push(Propagation::Close {
                target: record.info,
                code: CLOSE_DECONFIGURED,
                reason: "peer deconfigured".to_string(),
            });
            propagations.extend(withdrawals(&state, &dropped, None));
        }
        Action::LocalRouteCreate(channel) => {
            if state.local.contains_key(&channel.name) {
                return Err(RibError::RouteExists(channel.name.clone()));
            }

            state.local.insert(channel.name.clone(), channel.clone());

            for peer in state.connected_peers() {
                propagations.push(Propagation::Update {
                    target: peer.info.clone(),
                    message: UpdateMessage {
                        updates: vec![RouteUpdate::Add {
                            route: channel.clone(),
                            node_path: vec![node.name.clone()],
                        }],
                    },
                });
            }
        }
        Action::LocalRouteDelete(channel) => {
            if state.local.remove(&channel.name).is_none() {
                return Err(RibError::RouteNotFound(channel.name.clone()));
            }

            for peer in state.connected_peers() {
                propagations.push(Propagation::Update {
                    target: peer.info.clone(),
                    message: UpdateMessage {
                        updates: vec![RouteUpdate::Remove {
                            route: RouteRef {
                                name: channel.name.clone(),
                            },
                        }],
                    },
                });
            }
        }
        Action::ProtocolOpen(info) => {
            let record = state
                .peers
                .get_mut(&info.name)
                .ok_or_else(|| RibError::PeerNotConfigured(info.name.clone()))?;

            merge_advertised(record, info);
            record.connection_status = ConnectionStatus::Connected;
            record.last_message_received = Some(now);

            let target = record.info.clone();
            propagations.extend(full_sync(node, &state, &target));
        }
        Action::ProtocolConnected(info) => {
            // The peer may have been deconfigured between our open and its
            // answer; that is not an error, just a stale notification.
            if let Some(record) = state.peers.get_mut(&info.name) {
                merge_advertised(record, info);
                record.connection_status = ConnectionStatus::Connected;
                record.last_message_received = Some(now);

                let target = record.info.clone();
                propagations.extend(full_sync(node, &state, &target));
            }
        }
        Action::ProtocolClose { peer, .. } => {
            // A close from a peer we no longer track is a stale no-op.
            if let Some(record) = state.peers.get_mut(&peer.name) {
                record.connection_status = ConnectionStatus::Degraded;

                let dropped = state.remove_peer_routes(&peer.name);
                propagations.extend(withdrawals(&state, &dropped, Some(&peer.name)));
            }
        }
        Action::ProtocolUpdate { peer, message } => {
            propagations = ingest_update(node, &mut state, peer, message, now)?;
        }
        Action::ProtocolKeepalive(info) => {
            // Keep-alives race benignly with peer deletion.
            if let Some(record) = state.peers.get_mut(&info.name) {
                record.last_message_received = Some(now);
            }
        }
        Action::Tick => {
            propagations = tick(node, hold_time, &mut state, now);
        }
    }

    Ok(Plan {
        state,
        propagations,
    })
}

/// Merges the reachability fields a peer advertised about itself into its
/// stored record, preserving locally known credentials and configuration.
fn merge_advertised(record: &mut PeerRecord, info: &PeerInfo) {
    if info.public_address.is_some() {
        record.info.public_address = info.public_address.clone();
    }

    if info.envoy_address.is_some() {
        record.info.envoy_address = info.envoy_address.clone();
    }
}

/// Full routing-table sync sent when a peering session is (re)established.
///
/// Learned routes whose path already contains the target are excluded: the
/// target either originated them or has a better copy, and echoing them back
/// would only be dropped by its loop filter anyway.
fn full_sync(node: &Node, state: &RouteTable, target: &PeerInfo) -> Option<Propagation> {
    let mut updates = Vec::new();

    for route in state.local_sorted() {
        updates.push(RouteUpdate::Add {
            route,
            node_path: vec![node.name.clone()],
        });
    }

    for route in state.internal_sorted() {
        if route.node_path.iter().any(|hop| hop == &target.name) {
            continue;
        }

        updates.push(RouteUpdate::Add {
            node_path: prepend(node, &route.node_path),
            route: route.channel,
        });
    }

    if updates.is_empty() {
        return None;
    }

    Some(Propagation::Update {
        target: target.clone(),
        message: UpdateMessage { updates },
    })
}

/// Withdrawal messages for dropped routes, one per remaining connected peer.
fn withdrawals(
    state: &RouteTable,
    dropped: &[InternalRoute],
    exclude: Option<&str>,
) -> Vec<Propagation> {
    if dropped.is_empty() {
        return Vec::new();
    }

    let mut names: Vec<&str> = dropped.iter().map(|r| r.channel.name.as_str()).collect();
    names.dedup();

    let mut propagations = Vec::new();
    for peer in state.connected_peers() {
        if exclude == Some(peer.info.name.as_str()) {
            continue;
        }

        propagations.push(Propagation::Update {
            target: peer.info.clone(),
            message: UpdateMessage {
                updates: names
                    .iter()
                    .map(|name| RouteUpdate::Remove {
                        route: RouteRef {
                            name: name.to_string(),
                        },
                    })
                    .collect(),
            },
        });
    }

    propagations
}

fn ingest_update(
    node: &Node,
    state: &mut RouteTable,
    peer: &PeerInfo,
    message: &UpdateMessage,
    now: u64,
) -> Result<Vec<Propagation>, RibError> {
    let record = state
        .peers
        .get_mut(&peer.name)
        .ok_or_else(|| RibError::PeerNotConfigured(peer.name.clone()))?;

    record.last_message_received = Some(now);
    let via = record.info.clone();

    let mut accepted_adds = Vec::new();
    let mut accepted_removes = Vec::new();

    for update in &message.updates {
        match update {
            RouteUpdate::Add { route, node_path } => {
                // Path-vector loop check: a route that already crossed this
                // node is dropped silently.
                if node_path.iter().any(|hop| hop == &node.name) {
                    continue;
                }

                state.internal.insert(
                    (route.name.clone(), via.name.clone()),
                    InternalRoute {
                        channel: route.clone(),
                        peer: via.clone(),
                        peer_name: via.name.clone(),
                        node_path: node_path.clone(),
                    },
                );

                accepted_adds.push((route.clone(), node_path.clone()));
            }
            RouteUpdate::Remove { route } => {
                // Only forward withdrawals of routes we actually held; a
                // remove for an unknown key is a successful no-op.
                if state
                    .internal
                    .remove(&(route.name.clone(), via.name.clone()))
                    .is_some()
                {
                    accepted_removes.push(route.name.clone());
                }
            }
        }
    }

    let mut propagations = Vec::new();
    for target in state.connected_peers() {
        if target.info.name == via.name {
            continue;
        }

        let mut updates = Vec::new();
        for (route, node_path) in &accepted_adds {
            if node_path.iter().any(|hop| hop == &target.info.name) {
                continue;
            }

            updates.push(RouteUpdate::Add {
                route: route.clone(),
                node_path: prepend(node, node_path),
            });
        }

        for name in &accepted_removes {
            updates.push(RouteUpdate::Remove {
                route: RouteRef { name: name.clone() },
            });
        }

        if !updates.is_empty() {
            propagations.push(Propagation::Update {
                target: target.info.clone(),
                message: UpdateMessage { updates },
            });
        }
    }

    Ok(propagations)
}

fn tick(node: &Node, hold_time: u64, state: &mut RouteTable, now: u64) -> Vec<Propagation> {
    let mut expired = Vec::new();
    for record in state.peers.values_mut() {
        if record.connection_status != ConnectionStatus::Connected {
            continue;
        }

        if let Some(last) = record.last_message_received {
            if now.saturating_sub(last) > hold_time {
                record.connection_status = ConnectionStatus::Degraded;
                expired.push(record.info.name.clone());
            }
        }
    }

    expired.sort();

    let mut dropped = Vec::new();
    for name in &expired {
        dropped.extend(state.remove_peer_routes(name));
    }
    dropped.sort_by(|a, b| a.channel.name.cmp(&b.channel.name));

    let mut propagations = withdrawals(state, &dropped, None);

    // Reconnect attempts. A peer stuck in initializing lost its first open
    // and is retried the same way a degraded one is.
    for record in state.peers_sorted() {
        if matches!(
            record.connection_status,
            ConnectionStatus::Degraded | ConnectionStatus::Initializing
        ) {
            propagations.push(Propagation::Open {
                target: record.info.clone(),
            });
        }
    }

    // Keep-alive pacing: stay well inside the peer's hold timer.
    for record in state.peers_sorted() {
        if record.connection_status != ConnectionStatus::Connected {
            continue;
        }

        let stale = match record.last_message_received {
            Some(last) => now.saturating_sub(last) > hold_time / 3,
            None => true,
        };

        if stale {
            propagations.push(Propagation::Keepalive {
                target: record.info.clone(),
            });
        }
    }

    propagations
}

fn prepend(node: &Node, node_path: &[String]) -> Vec<String> {
    let mut path = Vec::with_capacity(node_path.len() + 1);
    path.push(node.name.clone());
    path.extend(node_path.iter().cloned());
    path
}
