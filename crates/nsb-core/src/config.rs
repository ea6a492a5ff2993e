//! Bridge configuration
//!
//! The configuration is built once at startup from command-line flags and
//! then shared read-only with every connection.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Address the SSH endpoint listens on when none is given
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:2022";

/// The only exec command the bridge honours
pub const ALLOWED_COMMAND: &str = "nix-daemon --stdio";

/// Configuration for the bridge daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Address to bind the SSH server to (`host:port`)
    pub listen_address: String,

    /// Unix socket every accepted exec request is relayed to
    pub socket_path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            socket_path: PathBuf::new(),
        }
    }
}

impl BridgeConfig {
    /// Create a configuration for the given listen address and socket path
    pub fn new(listen_address: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            listen_address: listen_address.into(),
            socket_path: socket_path.into(),
        }
    }

    /// Check that the configuration can be used to start the server.
    ///
    /// An empty socket path is accepted here. It makes every dial fail,
    /// which is reported per exec request rather than at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidListenAddress(self.listen_address.clone());

        let (host, port) = self.listen_address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }

        Ok(())
    }
}
