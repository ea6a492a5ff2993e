//! Per-connection and per-channel supervision

mod channel;
mod connection;

pub use channel::supervise_channel;
pub use connection::{discard_global_requests, fan_out_channels, ConnectionSupervisor};
