//! Unix socket dialing and byte relaying
//!
//! Once an exec request is accepted, the channel and a freshly dialed
//! socket connection form a relay pair. Each direction runs in its own
//! task until its source reaches end-of-stream or fails.

use std::path::{Path, PathBuf};

use nsb_core::BridgeError;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use crate::channel::ChannelIo;

/// Opens connections to the configured daemon socket
#[derive(Debug, Clone)]
pub struct SocketDialer {
    path: PathBuf,
}

impl SocketDialer {
    /// Create a dialer for the given socket path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Socket path this dialer connects to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connect to the socket
    pub async fn dial(&self) -> Result<UnixStream, BridgeError> {
        UnixStream::connect(&self.path)
            .await
            .map_err(|source| BridgeError::Dial {
                path: self.path.clone(),
                source,
            })
    }
}

/// Tasks driving the two directions of a relay pair
pub struct RelayHandles {
    /// Channel to socket; yields the number of bytes copied
    pub to_socket: JoinHandle<u64>,
    /// Socket to channel; yields the number of bytes copied
    pub to_channel: JoinHandle<u64>,
}

/// Start relaying bytes between an accepted channel and a socket connection.
///
/// Both directions are spawned and run unsupervised; callers may drop the
/// returned handles. The socket is closed once both directions have ended.
pub fn spawn_relay(channel: ChannelIo, socket: UnixStream) -> RelayHandles {
    let (channel_reader, channel_writer) = tokio::io::split(channel);
    let (socket_reader, socket_writer) = socket.into_split();

    RelayHandles {
        to_socket: tokio::spawn(copy_direction(
            "channel->socket",
            channel_reader,
            socket_writer,
        )),
        to_channel: tokio::spawn(copy_direction(
            "socket->channel",
            socket_reader,
            channel_writer,
        )),
    }
}

/// Copy until the source ends, then pass the end-of-stream on
async fn copy_direction<R, W>(direction: &'static str, mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            tracing::debug!("Relay {} reached end of stream after {} bytes", direction, bytes);
            let _ = writer.shutdown().await;
            bytes
        }
        Err(e) => {
            tracing::debug!("Relay {} stopped: {}", direction, e);
            0
        }
    }
}
