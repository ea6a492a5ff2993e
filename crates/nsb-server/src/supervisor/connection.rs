//! Connection supervisor
//!
//! Runs one SSH connection: handshake, global-request draining, and one
//! channel task per channel-open. The connection is only released after
//! every channel task it spawned has finished.

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nsb_core::BridgeError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

use crate::channel::{ChannelTransport, GlobalRequest, NewChannel};
use crate::relay::SocketDialer;
use crate::server::{SessionEvents, SessionHandler};
use crate::supervisor::supervise_channel;

/// Supervises SSH connections against a shared, read-only configuration
pub struct ConnectionSupervisor {
    /// russh server configuration (host key, auth policy)
    ssh_config: Arc<russh::server::Config>,
    /// Dialer for the daemon socket
    dialer: Arc<SocketDialer>,
}

impl ConnectionSupervisor {
    /// Create a supervisor
    pub fn new(ssh_config: Arc<russh::server::Config>, dialer: Arc<SocketDialer>) -> Self {
        Self { ssh_config, dialer }
    }

    /// Run one accepted connection to completion
    pub async fn run<S>(&self, stream: S, peer_addr: SocketAddr) -> Result<(), BridgeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (handler, events) = SessionHandler::new(peer_addr);
        let SessionEvents {
            channels,
            globals,
            authenticated,
        } = events;

        let session = russh::server::run_stream(Arc::clone(&self.ssh_config), stream, handler)
            .await
            .map_err(|e| BridgeError::Handshake(e.to_string()))?;

        tokio::spawn(discard_global_requests(globals));

        let dialer = Arc::clone(&self.dialer);
        let (result, ()) = tokio::join!(
            session,
            fan_out_channels(channels, move |new_channel| {
                supervise_channel(new_channel, Arc::clone(&dialer))
            })
        );

        session_outcome(authenticated.load(Ordering::SeqCst), result)
    }
}

/// Classify how a connection ended.
///
/// Anything that ends the connection before the client authenticated is a
/// failed handshake, including a peer that simply goes away.
fn session_outcome<E: Display>(
    authenticated: bool,
    result: Result<(), E>,
) -> Result<(), BridgeError> {
    match (authenticated, result) {
        (true, Ok(())) => Ok(()),
        (true, Err(e)) => Err(BridgeError::Session(e.to_string())),
        (false, Ok(())) => Err(BridgeError::Handshake(
            "connection closed before authentication".to_string(),
        )),
        (false, Err(e)) => Err(BridgeError::Handshake(e.to_string())),
    }
}

/// Spawn a task per channel-open and wait for all of them.
///
/// Returns once the notification stream has ended and every spawned task
/// has completed. Task errors are logged and do not affect siblings.
pub async fn fan_out_channels<T, F, Fut>(
    mut channels: mpsc::UnboundedReceiver<NewChannel<T>>,
    mut handle_channel: F,
) where
    T: ChannelTransport,
    F: FnMut(NewChannel<T>) -> Fut,
    Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
{
    let tracker = TaskTracker::new();

    while let Some(new_channel) = channels.recv().await {
        let channel_type = new_channel.channel_type().to_string();
        tracing::debug!("New {} channel", channel_type);

        let task = handle_channel(new_channel);
        tracker.spawn(async move {
            if let Err(e) = task.await {
                tracing::error!("{} channel failed: {}", channel_type, e);
            }
        });
    }

    tracker.close();
    tracker.wait().await;
}

/// Drain connection-level requests until the connection goes away
pub async fn discard_global_requests(mut globals: mpsc::UnboundedReceiver<GlobalRequest>) {
    while let Some(request) = globals.recv().await {
        tracing::debug!("Discarding global request {:?}", request.request_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::DuplexStream;

    #[tokio::test]
    async fn test_fan_out_waits_for_slow_channels() {
        let (tx, rx) = mpsc::unbounded_channel::<NewChannel<DuplexStream>>();
        let finished = Arc::new(AtomicUsize::new(0));

        let mut peers = Vec::new();
        for _ in 0..3 {
            let (transport, peer) = tokio::io::duplex(64);
            let (new_channel, _opening) = NewChannel::new("session", transport);
            tx.send(new_channel).unwrap();
            peers.push(peer);
        }
        drop(tx);

        let counter = Arc::clone(&finished);
        fan_out_channels(rx, move |new_channel| {
            let counter = Arc::clone(&counter);
            async move {
                let _ = new_channel.accept();
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failing_channels() {
        let (tx, rx) = mpsc::unbounded_channel::<NewChannel<DuplexStream>>();
        let finished = Arc::new(AtomicUsize::new(0));

        for channel_type in ["fail", "session", "session"] {
            let (transport, _peer) = tokio::io::duplex(64);
            let (new_channel, _opening) = NewChannel::new(channel_type, transport);
            tx.send(new_channel).unwrap();
        }
        drop(tx);

        let counter = Arc::clone(&finished);
        fan_out_channels(rx, move |new_channel| {
            let counter = Arc::clone(&counter);
            let fail = new_channel.channel_type() == "fail";
            async move {
                if fail {
                    return Err(BridgeError::Session("boom".to_string()));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_session_outcome_before_auth_is_handshake() {
        assert!(matches!(
            session_outcome(false, Err("kex failed")),
            Err(BridgeError::Handshake(msg)) if msg == "kex failed"
        ));
        assert!(matches!(
            session_outcome::<&str>(false, Ok(())),
            Err(BridgeError::Handshake(_))
        ));
    }

    #[test]
    fn test_session_outcome_after_auth() {
        assert!(session_outcome::<&str>(true, Ok(())).is_ok());
        assert!(matches!(
            session_outcome(true, Err("reset")),
            Err(BridgeError::Session(msg)) if msg == "reset"
        ));
    }

    #[tokio::test]
    async fn test_garbage_client_fails_handshake() {
        let host_key = crate::server::generate_host_key().unwrap();
        let supervisor = ConnectionSupervisor::new(
            crate::server::ServerConfig::new(host_key).ssh_config,
            Arc::new(SocketDialer::new("")),
        );

        let (server_side, mut client_side) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = client_side.write_all(b"SSH-2.0-garbage\r\n").await;
            let _ = client_side.write_all(&[0xff; 64]).await;
            let _ = client_side.shutdown().await;
            // Hold the read side open until the server gives up
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.run(server_side, "127.0.0.1:40000".parse().unwrap()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(BridgeError::Handshake(_))));
        client.abort();
    }

    #[tokio::test]
    async fn test_discard_global_requests_drains() {
        let (tx, rx) = mpsc::unbounded_channel();
        for request_type in ["tcpip-forward", "keepalive@openssh.com"] {
            tx.send(GlobalRequest {
                request_type: request_type.to_string(),
                want_reply: true,
            })
            .unwrap();
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), discard_global_requests(rx))
            .await
            .unwrap();
    }
}
