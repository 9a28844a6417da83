use std::{collections::BTreeMap, time::Duration};

use anyhow::{Result, anyhow};
use proto::{Ack, DataChannelDefinition, InternalRoute};
use reqwest::{Client, ClientBuilder};
use serde::Serialize;

use crate::{
    bus::Snapshot,
    config::{Envoy, Tls},
};

/// Everything the external proxy configuration service needs to program the
/// data plane: originated channels, learned routes, the listener bindings
/// for both, and the TLS material to serve with.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPlaneConfig {
    pub local: Vec<DataChannelDefinition>,
    pub internal: Vec<InternalRoute>,
    pub port_allocations: BTreeMap<String, u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,
}

/// Orders learned routes so the preferred provider of each service name comes
/// first: shortest path, ties broken by the lexicographically smallest peer.
pub fn preference_order(mut routes: Vec<InternalRoute>) -> Vec<InternalRoute> {
    routes.sort_by(|a, b| {
        (&a.channel.name, a.node_path.len(), &a.peer_name).cmp(&(
            &b.channel.name,
            b.node_path.len(),
            &b.peer_name,
        ))
    });
    routes
}

/// The winning provider per service name, out of [`preference_order`].
pub fn preferred(routes: Vec<InternalRoute>) -> Vec<InternalRoute> {
    let mut routes = preference_order(routes);
    routes.dedup_by(|next, kept| next.channel.name == kept.channel.name);
    routes
}

pub struct ProxyClient {
    endpoint: String,
    tls: Option<Tls>,
    client: Client,
}

impl ProxyClient {
    pub fn new(envoy: &Envoy, tls: Option<Tls>) -> Result<Self> {
        Ok(Self {
            endpoint: envoy.endpoint.trim_end_matches('/').to_string(),
            tls,
            client: ClientBuilder::new()
                .timeout(Duration::from_secs(5))
                .build()?,
        })
    }

    pub fn payload(&self, snapshot: &Snapshot) -> DataPlaneConfig {
        DataPlaneConfig {
            local: snapshot.table.local_sorted(),
            internal: preference_order(snapshot.table.internal_sorted()),
            port_allocations: snapshot.allocations.clone(),
            tls: self.tls.clone(),
        }
    }

    /// Pushes the complete data-plane view. Failures are the caller's to log;
    /// state is never rolled back on a failed push, the next one carries the
    /// full picture again.
    pub async fn update_routes(&self, snapshot: &Snapshot) -> Result<()> {
        let ack: Ack = self
            .client
            .post(format!("{}/routes", self.endpoint))
            .json(&self.payload(snapshot))
            .send()
            .await?
            .json()
            .await?;

        if !ack.ok {
            return Err(anyhow!(
                ack.error.unwrap_or_else(|| "push rejected".to_string())
            ));
        }

        Ok(())
    }
}
