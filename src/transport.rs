use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{Ack, CloseRequest, OpenResponse, PeerInfo, UpdateMessage, UpdateRequest};
use reqwest::{Client, ClientBuilder};
use rib::Propagation;
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinSet;

/// Name of the data channel a node advertises for its own control-plane RPC.
/// When a peer published it, control traffic can transit the data plane
/// instead of dialing the peer directly.
pub const RPC_ROUTE_NAME: &str = "orchestrator-rpc";

/// One end of a cached peering session. The remote side exposes the same
/// protocol surface this node serves.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn open(&self, token: Option<&str>, peer: &PeerInfo) -> Result<OpenResponse>;
    async fn close(&self, token: Option<&str>, request: &CloseRequest) -> Result<Ack>;
    async fn update(&self, token: Option<&str>, peer: &PeerInfo, message: &UpdateMessage)
    -> Result<Ack>;
    async fn keepalive(&self, token: Option<&str>, peer: &PeerInfo) -> Result<Ack>;
}

/// Creates sessions for endpoints. Swapped out in tests for an in-memory
/// registry; production uses [`HttpSessionFactory`].
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(&self, endpoint: &str) -> Result<Arc<dyn PeerSession>>;
}

pub struct HttpSessionFactory {
    client: Client,
}

impl HttpSessionFactory {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: ClientBuilder::new()
                .timeout(Duration::from_secs(5))
                .build()?,
        })
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn open_session(&self, endpoint: &str) -> Result<Arc<dyn PeerSession>> {
        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }))
    }
}

struct HttpSession {
    client: Client,
    endpoint: String,
}

impl HttpSession {
    /// Posts a protocol message and decodes the body regardless of status:
    /// the remote side reports domain failures inside the envelope.
    async fn post<B, R>(&self, path: &str, token: Option<&str>, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut request = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(body);

        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        Ok(request.send().await?.json().await?)
    }
}

#[async_trait]
impl PeerSession for HttpSession {
    async fn open(&self, token: Option<&str>, peer: &PeerInfo) -> Result<OpenResponse> {
        self.post("/protocol/open", token, peer).await
    }

    async fn close(&self, token: Option<&str>, request: &CloseRequest) -> Result<Ack> {
        self.post("/protocol/close", token, request).await
    }

    async fn update(
        &self,
        token: Option<&str>,
        peer: &PeerInfo,
        message: &UpdateMessage,
    ) -> Result<Ack> {
        self.post(
            "/protocol/update",
            token,
            &UpdateRequest {
                peer: peer.clone(),
                message: message.clone(),
            },
        )
        .await
    }

    async fn keepalive(&self, token: Option<&str>, peer: &PeerInfo) -> Result<Ack> {
        self.post("/protocol/keepalive", token, peer).await
    }
}

/// Outcome of delivering one propagation to one peer.
#[derive(Debug)]
pub struct Delivery {
    pub target: String,
    pub kind: &'static str,
    /// `Ok` carries the remote's advertised identity for successful opens.
    pub result: Result<Option<PeerInfo>, String>,
}

/// Connection pool plus concurrent fan-out.
///
/// Sessions are created lazily per endpoint and cached for the process
/// lifetime; they are never evicted at this layer. Fan-out failures are
/// isolated per target and never abort the batch.
#[derive(Clone)]
pub struct PeerTransport {
    factory: Arc<dyn SessionFactory>,
    pool: Arc<Mutex<AHashMap<String, Arc<dyn PeerSession>>>>,
    node_token: Option<String>,
}

impl PeerTransport {
    pub fn new(factory: Arc<dyn SessionFactory>, node_token: Option<String>) -> Self {
        Self {
            factory,
            pool: Arc::new(Mutex::new(AHashMap::new())),
            node_token,
        }
    }

    /// Idempotent cache fetch.
    pub async fn session(&self, endpoint: &str) -> Result<Arc<dyn PeerSession>> {
        if let Some(session) = self.pool.lock().get(endpoint) {
            return Ok(session.clone());
        }

        let session = self.factory.open_session(endpoint).await?;
        Ok(self
            .pool
            .lock()
            .entry(endpoint.to_string())
            .or_insert(session)
            .clone())
    }

    /// Delivers every propagation concurrently; one entry per input, in
    /// input order, each settled independently.
    pub async fn fan_out(
        &self,
        node: &PeerInfo,
        jobs: Vec<(String, Propagation)>,
    ) -> Vec<Delivery> {
        let mut set = JoinSet::new();
        for (index, (endpoint, propagation)) in jobs.into_iter().enumerate() {
            let transport = self.clone();
            let node = node.clone();

            set.spawn(async move {
                let delivery = transport.deliver(&endpoint, &node, &propagation).await;
                (index, delivery)
            });
        }

        let mut deliveries: Vec<(usize, Delivery)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => deliveries.push(entry),
                Err(e) => log::error!("fan-out worker panicked: {e}"),
            }
        }

        deliveries.sort_by_key(|(index, _)| *index);
        deliveries.into_iter().map(|(_, d)| d).collect()
    }

    async fn deliver(
        &self,
        endpoint: &str,
        node: &PeerInfo,
        propagation: &Propagation,
    ) -> Delivery {
        let target = propagation.target();
        let token = target
            .peer_token
            .clone()
            .or_else(|| self.node_token.clone());

        let result = self
            .call(endpoint, token.as_deref(), node, propagation)
            .await
            .map_err(|e| e.to_string());

        Delivery {
            target: target.name.clone(),
            kind: propagation.kind(),
            result,
        }
    }

    async fn call(
        &self,
        endpoint: &str,
        token: Option<&str>,
        node: &PeerInfo,
        propagation: &Propagation,
    ) -> Result<Option<PeerInfo>> {
        let session = self.session(endpoint).await?;

        match propagation {
            Propagation::Open { .. } => {
                let response = session.open(token, node).await?;
                if !response.ok {
                    return Err(anyhow!(
                        response.error.unwrap_or_else(|| "open rejected".to_string())
                    ));
                }

                Ok(response.peer)
            }
            Propagation::Close { code, reason, .. } => {
                let ack = session
                    .close(
                        token,
                        &CloseRequest {
                            peer: node.clone(),
                            code: *code,
                            reason: Some(reason.clone()),
                        },
                    )
                    .await?;
                ack_to_result(ack)
            }
            Propagation::Update { message, .. } => {
                let ack = session.update(token, node, message).await?;
                ack_to_result(ack)
            }
            Propagation::Keepalive { .. } => {
                let ack = session.keepalive(token, node).await?;
                ack_to_result(ack)
            }
        }
    }
}

fn ack_to_result(ack: Ack) -> Result<Option<PeerInfo>> {
    if ack.ok {
        Ok(None)
    } else {
        Err(anyhow!(ack.error.unwrap_or_else(|| "rejected".to_string())))
    }
}

/// Control-plane endpoint selection: prefer the local egress listener of the
/// peer's published RPC route when the peer is publicly addressable, so the
/// call transits the data plane; fall back to the direct endpoint.
pub fn resolve_endpoint(target: &PeerInfo, rpc_egress_port: Option<u16>) -> String {
    match rpc_egress_port {
        Some(port) if target.public_address.is_some() => format!("http://127.0.0.1:{port}"),
        _ => target.endpoint.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakySession {
        fail: bool,
    }

    #[async_trait]
    impl PeerSession for FlakySession {
        async fn open(&self, _: Option<&str>, _: &PeerInfo) -> Result<OpenResponse> {
            unimplemented!()
        }

        async fn close(&self, _: Option<&str>, _: &CloseRequest) -> Result<Ack> {
            unimplemented!()
        }

        async fn update(&self, _: Option<&str>, _: &PeerInfo, _: &UpdateMessage) -> Result<Ack> {
            if self.fail {
                Err(anyhow!("connection refused"))
            } else {
                Ok(Ack::ok())
            }
        }

        async fn keepalive(&self, _: Option<&str>, _: &PeerInfo) -> Result<Ack> {
            Ok(Ack::ok())
        }
    }

    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn open_session(&self, endpoint: &str) -> Result<Arc<dyn PeerSession>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FlakySession {
                fail: endpoint.contains("down"),
            }))
        }
    }

    fn peer(name: &str, endpoint: &str) -> PeerInfo {
        PeerInfo {
            name: name.into(),
            endpoint: endpoint.into(),
            domains: vec!["x.io".into()],
            peer_token: None,
            public_address: None,
            envoy_address: None,
        }
    }

    #[tokio::test]
    async fn sessions_are_cached_per_endpoint() {
        let factory = Arc::new(CountingFactory {
            opened: AtomicUsize::new(0),
        });
        let transport = PeerTransport::new(factory.clone(), None);

        transport.session("http://b:3100").await.unwrap();
        transport.session("http://b:3100").await.unwrap();
        transport.session("http://c:3100").await.unwrap();

        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fan_out_isolates_failures_per_target() {
        let transport = PeerTransport::new(
            Arc::new(CountingFactory {
                opened: AtomicUsize::new(0),
            }),
            None,
        );

        let node = peer("a.x.io", "http://a:3100");
        let message = UpdateMessage { updates: vec![] };
        let jobs = vec![
            (
                "http://down:3100".to_string(),
                Propagation::Update {
                    target: peer("b.x.io", "http://down:3100"),
                    message: message.clone(),
                },
            ),
            (
                "http://c:3100".to_string(),
                Propagation::Update {
                    target: peer("c.x.io", "http://c:3100"),
                    message,
                },
            ),
        ];

        let deliveries = transport.fan_out(&node, jobs).await;

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].target, "b.x.io");
        assert!(deliveries[0].result.is_err());
        assert_eq!(deliveries[1].target, "c.x.io");
        assert!(deliveries[1].result.is_ok());
    }

    #[test]
    fn endpoint_resolution_prefers_the_egress_listener() {
        let mut target = peer("b.x.io", "http://b:3100");
        assert_eq!(resolve_endpoint(&target, Some(10004)), "http://b:3100");

        target.public_address = Some("b.example.com".into());
        assert_eq!(resolve_endpoint(&target, Some(10004)), "http://127.0.0.1:10004");
        assert_eq!(resolve_endpoint(&target, None), "http://b:3100");
    }
}
