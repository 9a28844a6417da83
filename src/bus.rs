use std::{
    collections::BTreeMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use proto::PeerInfo;
use rib::{Action, Committed, PortAllocator, Rib, RibError, RouteTable, egress_key};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    auth::{AuthError, AuthGate},
    clients::{DataChannelClient, IbgpClient, NetworkClient},
    config::Config,
    gateway::{self, GatewayClient},
    proxy::ProxyClient,
    transport::{PeerTransport, RPC_ROUTE_NAME, SessionFactory, resolve_endpoint},
};

/// Immutable view of the committed table and the listener bindings that
/// describe it. Handed out to readers; a new one is published on every
/// commit.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub table: RouteTable,
    pub allocations: BTreeMap<String, u16>,
}

impl Snapshot {
    pub fn egress_port(&self, name: &str, peer_name: &str) -> Option<u16> {
        self.allocations.get(&egress_key(name, peer_name)).copied()
    }

    /// Local listener toward `peer_name`'s published control-plane RPC
    /// route, if the peer advertised one and a binding exists.
    pub fn rpc_egress_port(&self, peer_name: &str) -> Option<u16> {
        self.table
            .internal
            .contains_key(&(RPC_ROUTE_NAME.to_string(), peer_name.to_string()))
            .then(|| self.egress_port(RPC_ROUTE_NAME, peer_name))
            .flatten()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Rib(#[from] RibError),
    #[error("orchestrator is stopped")]
    Stopped,
}

struct Job {
    action: Action,
    reply: Option<oneshot::Sender<Result<(), RibError>>>,
}

pub(crate) struct BusInner {
    node: PeerInfo,
    auth: AuthGate,
    transport: PeerTransport,
    proxy: Option<ProxyClient>,
    gateway: Option<GatewayClient>,
    queue: mpsc::UnboundedSender<Job>,
    snapshot: RwLock<Arc<Snapshot>>,
    last_post_commit: Mutex<Option<JoinHandle<()>>>,
    tick: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl BusInner {
    /// Enqueues without waiting for the outcome; used by the tick timer and
    /// by post-commit follow-ups, which have nobody to report to.
    fn dispatch_detached(&self, action: Action) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let _ = self.queue.send(Job {
            action,
            reply: None,
        });
    }
}

/// The composition root: every externally observable event funnels through
/// its queue into one pipeline, `plan -> commit -> post-commit`, with the
/// commit segment owned by a single worker task.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(config: Arc<Config>, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        let node = config.node()?;
        let rib = Rib::new(node.clone(), config.hold_time);
        let allocator = config
            .envoy
            .as_ref()
            .map(|envoy| PortAllocator::new(envoy.port_range.clone()));

        let (queue, jobs) = mpsc::unbounded_channel();

        let inner = Arc::new(BusInner {
            node: node.peer_info(),
            auth: AuthGate::new(&config)?,
            transport: PeerTransport::new(factory, config.auth.node_token.clone()),
            proxy: config
                .envoy
                .as_ref()
                .map(|envoy| ProxyClient::new(envoy, config.tls.clone()))
                .transpose()?,
            gateway: config
                .gateway
                .as_ref()
                .map(GatewayClient::new)
                .transpose()?,
            queue,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            last_post_commit: Mutex::new(None),
            tick: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        tokio::spawn(worker(rib, allocator, jobs, Arc::downgrade(&inner)));

        let tick = tokio::spawn(tick_loop(Arc::downgrade(&inner), config.tick_interval()));
        *inner.tick.lock() = Some(tick);

        log::info!(
            "orchestrator started: node={}, domains={:?}",
            inner.node.name,
            inner.node.domains
        );

        Ok(Self { inner })
    }

    /// This node's advertised identity.
    pub fn node_info(&self) -> PeerInfo {
        self.inner.node.clone()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn network_client(&self, token: Option<String>) -> NetworkClient {
        NetworkClient::new(self.clone(), token)
    }

    pub fn data_channel(&self, token: Option<String>) -> DataChannelClient {
        DataChannelClient::new(self.clone(), token)
    }

    pub fn ibgp_client(&self, token: Option<String>) -> IbgpClient {
        IbgpClient::new(self.clone(), token)
    }

    /// Stops the tick timer and refuses further dispatches. In-flight
    /// post-commit work is left to finish.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        if let Some(tick) = self.inner.tick.lock().take() {
            tick.abort();
        }

        log::info!("orchestrator stopped: node={}", self.inner.node.name);
    }

    /// Awaits the most recently spawned post-commit task. Meant for tests
    /// that need a propagation round to have settled.
    pub async fn settled(&self) {
        loop {
            let handle = self.inner.last_post_commit.lock().take();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    pub(crate) async fn authorize(&self, token: Option<&str>, action: &str) -> Result<(), BusError> {
        self.inner.auth.validate(token, action).await?;
        Ok(())
    }

    pub(crate) async fn dispatch(&self, action: Action) -> Result<(), BusError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(BusError::Stopped);
        }

        let (reply, outcome) = oneshot::channel();
        self.inner
            .queue
            .send(Job {
                action,
                reply: Some(reply),
            })
            .map_err(|_| BusError::Stopped)?;

        match outcome.await {
            Ok(result) => result.map_err(BusError::Rib),
            Err(_) => Err(BusError::Stopped),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_secs())
        .unwrap_or(0)
}

/// The single writer. Plans and commits strictly in queue order; nothing
/// else ever touches the RIB or the allocator.
async fn worker(
    mut rib: Rib,
    mut allocator: Option<PortAllocator>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    inner: Weak<BusInner>,
) {
    while let Some(Job { action, reply }) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match rib.plan(&action, unix_now()) {
            Err(error) => {
                log::warn!("action rejected: action={}, error={error}", action.tag());

                if let Some(reply) = reply {
                    let _ = reply.send(Err(error));
                }
            }
            Ok(plan) => {
                let committed = rib.commit(plan, allocator.as_mut());

                if committed.data_plane_dirty {
                    warn_on_exhaustion(&rib, allocator.as_ref());
                }

                let snapshot = Arc::new(Snapshot {
                    table: rib.state().clone(),
                    allocations: allocator
                        .as_ref()
                        .map(|a| a.allocations())
                        .unwrap_or_default(),
                });
                *inner.snapshot.write() = snapshot.clone();

                log::debug!(
                    "action committed: action={}, propagations={}",
                    action.tag(),
                    committed.propagations.len()
                );

                let handle = tokio::spawn(post_commit(inner.clone(), snapshot, committed));
                *inner.last_post_commit.lock() = Some(handle);

                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }
}

fn warn_on_exhaustion(rib: &Rib, allocator: Option<&PortAllocator>) {
    if allocator.is_none() {
        return;
    }

    for route in rib.state().local.values() {
        if route.envoy_port.is_none() {
            log::warn!("listener pool exhausted: route={}", route.name);
        }
    }
}

/// The side-effect stage, detached from the serial segment: fan the derived
/// messages out to peers, then reconcile the data plane. Every sub-step logs
/// its failures and nothing here rolls state back; the next commit pushes
/// the full picture again.
async fn post_commit(inner: Arc<BusInner>, snapshot: Arc<Snapshot>, committed: Committed) {
    let Committed {
        propagations,
        data_plane_dirty,
    } = committed;

    if !propagations.is_empty() {
        let targets: Vec<PeerInfo> = propagations.iter().map(|p| p.target().clone()).collect();

        let jobs = propagations
            .into_iter()
            .map(|propagation| {
                let egress = snapshot.rpc_egress_port(&propagation.target().name);
                (resolve_endpoint(propagation.target(), egress), propagation)
            })
            .collect();

        for (delivery, target) in inner
            .transport
            .fan_out(&inner.node, jobs)
            .await
            .into_iter()
            .zip(targets)
        {
            match delivery.result {
                Ok(remote) => {
                    log::debug!(
                        "propagation delivered: kind={}, peer={}",
                        delivery.kind,
                        delivery.target
                    );

                    // A successful open means the peer accepted us; record
                    // the session with whatever identity it advertised back.
                    if delivery.kind == "open" {
                        inner.dispatch_detached(Action::ProtocolConnected(
                            remote.unwrap_or(target),
                        ));
                    }
                }
                Err(error) => {
                    log::warn!(
                        "propagation failed: kind={}, peer={}, error={error}",
                        delivery.kind,
                        delivery.target
                    );
                }
            }
        }
    }

    if data_plane_dirty {
        if let Some(proxy) = &inner.proxy {
            if let Err(error) = proxy.update_routes(&snapshot).await {
                log::warn!("data-plane push failed: error={error}");
            }
        }

        if let Some(gateway_client) = &inner.gateway {
            let services = gateway::graphql_services(&snapshot);
            if !services.is_empty() {
                if let Err(error) = gateway_client.update_config(services).await {
                    log::warn!("gateway sync failed: error={error}");
                }
            }
        }
    }
}

async fn tick_loop(inner: Weak<BusInner>, interval_secs: u64) {
    let mut interval = time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // The first tick of a tokio interval fires immediately; the mesh has
    // nothing to do that early.
    interval.tick().await;

    loop {
        interval.tick().await;

        let Some(inner) = inner.upgrade() else {
            break;
        };

        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }

        inner.dispatch_detached(Action::Tick);
    }
}
