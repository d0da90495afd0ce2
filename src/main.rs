use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use turnstile::config::Config;
use turnstile::proxy::{Backend, FrontDoor};
use turnstile::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load().context("loading configuration")?;
    let port = cfg.listen_port()?;
    let registry = Arc::new(cfg.build_registry().context("building backend registry")?);

    for backend in registry.backends() {
        tracing::info!(backend = backend.address(), "Registered backend");
    }

    let front_door = Arc::new(FrontDoor::new(registry));

    tracing::info!("serving requests at 'localhost:{}'", port);

    tokio::select! {
        res = server::listener::run(&cfg.listen_addr, front_door) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
