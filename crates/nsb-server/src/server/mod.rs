//! SSH server implementation

mod handler;
mod listener;

pub use handler::{ServerConfig, SessionEvents, SessionHandler};
pub use listener::{generate_host_key, BridgeServer};
