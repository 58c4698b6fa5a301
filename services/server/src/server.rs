//! TCP listener and process-wide server state.
//!
//! One task per accepted connection plus this accept loop. The `watch`
//! shutdown channel stops the accept loop and wakes every connection task
//! at its next read.

use std::net::SocketAddr;
use std::sync::Arc;

use chat_protocol::WireProtocol;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::session;
use crate::storage::MessageStore;

/// Shared state every connection task hangs off.
pub struct ServerState {
    pub registry: Mutex<Registry>,
    pub store: Arc<dyn MessageStore>,
    pub protocol: Arc<dyn WireProtocol>,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the accept loop; every connection task exits at its next read.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl ChatServer {
    pub async fn bind(
        config: &ServerConfig,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        info!(%addr, protocol = ?config.protocol, "server listening");
        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(ServerState {
            registry: Mutex::new(Registry::new()),
            store,
            protocol: Arc::from(config.protocol.create()),
            shutdown,
        });
        Ok(ChatServer { listener, state })
    }

    /// The bound address (useful when port 0 was requested).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Accept loop; returns after `begin_shutdown`.
    pub async fn run(self) {
        let mut shutdown_rx = self.state.subscribe_shutdown();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            debug!(%peer, "client connected");
                            let state = Arc::clone(&self.state);
                            tokio::spawn(session::run(state, stream, peer));
                        }
                        Err(e) => warn!(error = %e, "accept error"),
                    }
                }
            }
        }
        info!("accept loop stopped");
    }
}
