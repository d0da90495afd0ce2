use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use crate::http::connection::Connection;
use crate::proxy::{Backend, FrontDoor};

/// Binds `listen_addr` and serves forever.
pub async fn run<B: Backend>(listen_addr: &str, front_door: Arc<FrontDoor<B>>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    serve(listener, front_door).await
}

/// Accepts connections on an already bound listener, one task per client.
pub async fn serve<B: Backend>(listener: TcpListener, front_door: Arc<FrontDoor<B>>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                // Usually fd exhaustion; back off instead of spinning
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        tracing::debug!(%peer, "Accepted connection");

        let front_door = Arc::clone(&front_door);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, front_door);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
