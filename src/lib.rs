pub mod api;
pub mod auth;
pub mod bus;
pub mod clients;
pub mod config;
pub mod gateway;
pub mod proxy;
pub mod transport;

use std::sync::Arc;

use self::{bus::Bus, config::Config, transport::HttpSessionFactory};

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!(
    "mesh-rs.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the crate directly and boot a whole
/// node, a function is opened to replace the main function and start the
/// server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let factory = Arc::new(HttpSessionFactory::new()?);
    let bus = Bus::new(config.clone(), factory)?;

    api::start_server(config, bus).await
}
