//! SSH server listener
//!
//! Accepts incoming connections and spawns a supervisor for each client.

use std::net::SocketAddr;
use std::sync::Arc;

use nsb_core::{BridgeConfig, BridgeError};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::relay::SocketDialer;
use crate::server::handler::ServerConfig;
use crate::supervisor::ConnectionSupervisor;

/// SSH server bound to the listen address
pub struct BridgeServer {
    /// Bound TCP listener
    listener: TcpListener,
    /// Supervisor shared by all connections
    supervisor: Arc<ConnectionSupervisor>,
}

impl BridgeServer {
    /// Bind the configured listen address.
    ///
    /// Failing to bind is fatal for the process.
    pub async fn bind(config: &BridgeConfig, host_key: KeyPair) -> Result<Self, BridgeError> {
        config.validate()?;

        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| BridgeError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;

        let server_config = ServerConfig::new(host_key);
        let dialer = Arc::new(SocketDialer::new(&config.socket_path));

        Ok(Self {
            listener,
            supervisor: Arc::new(ConnectionSupervisor::new(server_config.ssh_config, dialer)),
        })
    }

    /// Address the server is actually listening on
    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled.
    ///
    /// Accept errors are logged and the loop continues. Cancellation only
    /// stops accepting; connections already running are left alone.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BridgeError> {
        tracing::info!("SSH server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                // Check for shutdown
                _ = cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                // Accept new connections
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn a supervisor for a new connection
    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            match supervisor.run(socket, peer_addr).await {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}

/// Generate the ephemeral host key.
///
/// A new Ed25519 key is created on every start and never written to disk.
pub fn generate_host_key() -> Result<KeyPair, BridgeError> {
    KeyPair::generate_ed25519()
        .ok_or_else(|| BridgeError::HostKey("Failed to generate Ed25519 key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = BridgeConfig::new("127.0.0.1:0", "/tmp/nsb-test.sock");
        let server = BridgeServer::bind(&config, generate_host_key().unwrap())
            .await
            .unwrap();

        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();

        let config = BridgeConfig::new(address, "");
        let result = BridgeServer::bind(&config, generate_host_key().unwrap()).await;
        assert!(matches!(result, Err(BridgeError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_invalid_listen_address_is_error() {
        let config = BridgeConfig::new("nowhere", "");
        let result = BridgeServer::bind(&config, generate_host_key().unwrap()).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let config = BridgeConfig::new("127.0.0.1:0", "");
        let server = BridgeServer::bind(&config, generate_host_key().unwrap())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(server.run(cancel).await.is_ok());
    }
}
