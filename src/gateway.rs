use std::time::Duration;

use anyhow::{Result, anyhow};
use proto::Ack;
use reqwest::{Client, ClientBuilder};
use serde::Serialize;

use crate::{bus::Snapshot, config::Gateway, proxy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayService {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
struct GatewayConfig {
    services: Vec<GatewayService>,
}

/// The GraphQL-speaking channels of the mesh, as the gateway should dial
/// them: locally originated services by their upstream URL, learned services
/// through the local egress listener. Learned routes without an egress
/// binding are skipped; they become dialable after the next allocation
/// succeeds.
pub fn graphql_services(snapshot: &Snapshot) -> Vec<GatewayService> {
    let mut services = Vec::new();

    for route in snapshot.table.local_sorted() {
        if route.protocol.is_graphql() {
            services.push(GatewayService {
                name: route.name,
                url: route.endpoint,
            });
        }
    }

    for route in proxy::preferred(snapshot.table.internal_sorted()) {
        if !route.channel.protocol.is_graphql() {
            continue;
        }

        if let Some(port) = snapshot.egress_port(&route.channel.name, &route.peer_name) {
            services.push(GatewayService {
                name: route.channel.name,
                url: format!("http://127.0.0.1:{port}"),
            });
        }
    }

    services.sort_by(|a, b| a.name.cmp(&b.name));
    services
}

pub struct GatewayClient {
    endpoint: String,
    client: Client,
}

impl GatewayClient {
    pub fn new(gateway: &Gateway) -> Result<Self> {
        Ok(Self {
            endpoint: gateway.endpoint.trim_end_matches('/').to_string(),
            client: ClientBuilder::new()
                .timeout(Duration::from_secs(5))
                .build()?,
        })
    }

    pub async fn update_config(&self, services: Vec<GatewayService>) -> Result<()> {
        let ack: Ack = self
            .client
            .post(format!("{}/config", self.endpoint))
            .json(&GatewayConfig { services })
            .send()
            .await?
            .json()
            .await?;

        if !ack.ok {
            return Err(anyhow!(
                ack.error.unwrap_or_else(|| "sync rejected".to_string())
            ));
        }

        Ok(())
    }
}
