//! nsb-core: Core configuration and validation for nix-ssh-bridge
//!
//! This crate holds the pieces of the bridge that do not touch the network:
//! the immutable configuration value, the error taxonomy shared by the
//! server, and the exec-payload decoding used to enforce the single allowed
//! daemon invocation.

pub mod command;
pub mod config;
pub mod error;

pub use command::{decode_exec_payload, encode_exec_payload, validate_exec_payload};
pub use config::{BridgeConfig, ALLOWED_COMMAND, DEFAULT_LISTEN_ADDRESS};
pub use error::{BridgeError, CommandError, ConfigError};
