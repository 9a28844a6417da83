use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::{Result, ensure};
use clap::Parser;
use rib::{Node, PortRange};
use serde::{Deserialize, Serialize};

/// Identity of this node.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    ///
    /// Fully qualified node name.
    ///
    /// Must end with one of the configured domains; this is how a node
    /// proves membership of the overlay it claims to belong to.
    ///
    pub name: String,
    ///
    /// URL this node's control plane can be dialed on by its peers.
    ///
    pub endpoint: String,
    ///
    /// Domain suffixes the node belongs to. At least one is required.
    ///
    pub domains: Vec<String>,
    ///
    /// Externally routable name advertised to peers, for the case where the
    /// node is reachable from outside the overlay.
    ///
    #[serde(default)]
    pub public_address: Option<String>,
    ///
    /// Data-plane proxy address advertised to peers.
    ///
    #[serde(default)]
    pub envoy_address: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    ///
    /// HTTP surface bind address.
    ///
    /// Serves both the operator API and the peer-facing protocol routes.
    ///
    #[serde(default = "Api::bind")]
    pub listen: SocketAddr,
}

impl Api {
    fn bind() -> SocketAddr {
        "127.0.0.1:3100".parse().unwrap()
    }
}

impl Default for Api {
    fn default() -> Self {
        Self { listen: Self::bind() }
    }
}

/// Data-plane proxy configuration. Present = pushes enabled.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Envoy {
    ///
    /// Endpoint of the proxy configuration service.
    ///
    pub endpoint: String,
    ///
    /// Inclusive listener port ranges used for route listeners, e.g.
    /// `["10000..10100"]`. A bare port number is a single-port range.
    ///
    #[serde(default = "Envoy::port_range")]
    pub port_range: Vec<PortRange>,
}

impl Envoy {
    fn port_range() -> Vec<PortRange> {
        vec![PortRange::default()]
    }
}

/// GraphQL gateway adapter. Present = service-list sync enabled.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Gateway {
    pub endpoint: String,
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// Token validation service. When unset, every call is allowed; this is
    /// the development mode.
    ///
    #[serde(default)]
    pub endpoint: Option<String>,
    ///
    /// Default credential presented to peers that have no per-peer token.
    ///
    #[serde(default)]
    pub node_token: Option<String>,
}

/// TLS material forwarded verbatim to the data-plane proxy. The control
/// plane never terminates TLS itself.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    pub cert_chain: String,
    pub private_key: String,
    #[serde(default)]
    pub ca_bundle: Option<String>,
    #[serde(default)]
    pub require_client_cert: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    ///
    /// Maximum interval in seconds without a peer message before the peer is
    /// declared degraded and its routes are withdrawn.
    ///
    #[serde(default = "Config::hold_time")]
    pub hold_time: u64,
    ///
    /// Cadence of the periodic tick in seconds. Defaults to a third of the
    /// hold time so two keep-alives can be lost before a peer expires.
    ///
    #[serde(default)]
    pub tick_interval: Option<u64>,
    pub node: NodeConfig,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub envoy: Option<Envoy>,
    #[serde(default)]
    pub gateway: Option<Gateway>,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub tls: Option<Tls>,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    fn hold_time() -> u64 {
        90
    }

    pub fn tick_interval(&self) -> u64 {
        self.tick_interval.unwrap_or((self.hold_time / 3).max(1))
    }

    /// Checks the node's domain membership and returns its routing identity.
    pub fn node(&self) -> Result<Node> {
        ensure!(
            !self.node.domains.is_empty(),
            "node `{}` has no domains configured",
            self.node.name
        );
        ensure!(
            self.node.domains.iter().any(|d| self.node.name.ends_with(d)),
            "node name `{}` does not belong to any configured domain",
            self.node.name
        );

        Ok(Node {
            name: self.node.name.clone(),
            endpoint: self.node.endpoint.clone(),
            domains: self.node.domains.clone(),
            public_address: self.node.public_address.clone(),
            envoy_address: self.node.envoy_address.clone(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: mesh-server --config /etc/mesh-rs/config.toml
    ///
    #[arg(long, short)]
    config: String,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(toml::from_str::<Self>(&read_to_string(
            &Cli::parse().config,
        )?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Config {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(
            r#"
            [node]
            name = "node-a.example.local"
            endpoint = "http://127.0.0.1:3100"
            domains = ["example.local"]
            "#,
        );

        assert_eq!(config.hold_time, 90);
        assert_eq!(config.tick_interval(), 30);
        assert!(config.envoy.is_none());
        assert!(config.auth.endpoint.is_none());
        config.node().unwrap();
    }

    #[test]
    fn node_must_belong_to_a_configured_domain() {
        let config = parse(
            r#"
            [node]
            name = "node-a.other.io"
            endpoint = "http://127.0.0.1:3100"
            domains = ["example.local"]
            "#,
        );

        assert!(config.node().is_err());
    }

    #[test]
    fn port_ranges_accept_ranges_and_single_ports() {
        let config = parse(
            r#"
            [node]
            name = "node-a.example.local"
            endpoint = "http://127.0.0.1:3100"
            domains = ["example.local"]

            [envoy]
            endpoint = "http://127.0.0.1:9901"
            port-range = ["10000..10100", "20000"]
            "#,
        );

        let envoy = config.envoy.unwrap();
        assert_eq!(
            envoy.port_range,
            vec![PortRange::new(10000, 10100), PortRange::new(20000, 20000)]
        );
    }
}
