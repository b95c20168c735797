//! TCP listener and accept loop (`§4.6`).

use std::net::SocketAddr;
use std::sync::Arc;

use frostbox_common::CoreError;
use frostbox_store::DataStore;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::handle_connection;

/// Binds a dual-stack-capable listener: `IPV6_V6ONLY` is cleared so a single
/// IPv6 bind also accepts IPv4 clients (`§4.6`).
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, CoreError> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, None).map_err(CoreError::io)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(false).map_err(CoreError::io)?;
    }
    socket.set_reuse_address(true).map_err(CoreError::io)?;
    socket.set_nonblocking(true).map_err(CoreError::io)?;
    socket.bind(&addr.into()).map_err(CoreError::io)?;
    socket.listen(1024).map_err(CoreError::io)?;
    TcpListener::from_std(socket.into()).map_err(CoreError::io)
}

/// Runs the accept loop until `shutdown` fires. Each accepted connection is
/// handled on its own task; the listener itself is dropped (closing the
/// socket) once this future returns.
#[instrument(skip(listener, store, config, shutdown))]
pub async fn serve(
    listener: TcpListener,
    store: Arc<DataStore>,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<()>,
) {
    info!(local_addr = ?listener.local_addr().ok(), "accept loop started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("accept loop observing shutdown");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "accepted connection");
                        let store = Arc::clone(&store);
                        let config = Arc::clone(&config);
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_connection(stream, store, config, shutdown));
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                }
            }
        }
    }
}
