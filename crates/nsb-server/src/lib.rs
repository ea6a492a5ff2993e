//! nsb-server: Passwordless SSH endpoint for a local daemon socket
//!
//! The server accepts SSH connections from any client, honours exactly one
//! exec command per session channel, and relays the channel's byte stream
//! to a fixed Unix domain socket. Clients that speak a daemon protocol over
//! `ssh host <command>` can reach a daemon that only listens locally.

pub mod channel;
pub mod relay;
pub mod server;
pub mod supervisor;

pub use relay::SocketDialer;
pub use server::{generate_host_key, BridgeServer, ServerConfig};
pub use supervisor::ConnectionSupervisor;
