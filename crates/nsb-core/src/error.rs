//! Core error types for nix-ssh-bridge

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Host identity could not be generated
    #[error("Host key error: {0}")]
    HostKey(String),

    /// Listen address could not be bound
    #[error("Failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// SSH handshake with a client failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The target Unix socket could not be reached
    #[error("Failed to dial {}: {source}", path.display())]
    Dial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The SSH session ended with a transport error
    #[error("Session error: {0}")]
    Session(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Listen address is empty or not a `host:port` pair
    #[error("Invalid listen address {0:?}: expected host:port")]
    InvalidListenAddress(String),
}

/// Reasons an exec request is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Payload too short to hold the length prefix
    #[error("Exec payload truncated: {len} bytes")]
    Truncated { len: usize },

    /// Length prefix disagrees with the bytes that follow it
    #[error("Exec payload declares {declared} bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Command is not the allowed daemon invocation
    #[error("Command not allowed: {command:?}")]
    NotAllowed { command: String },
}
