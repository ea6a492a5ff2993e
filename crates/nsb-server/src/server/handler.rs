//! russh handler for a single client connection
//!
//! Translates russh callbacks into the channel contract: channel-opens
//! become [`NewChannel`] notifications, channel requests become
//! [`ChannelRequest`]s, and connection-level requests are handed to the
//! drainer. Every decision is taken by the supervisors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet, Sig};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;

use nsb_core::encode_exec_payload;

use crate::channel::{ChannelRequest, GlobalRequest, NewChannel, Opened, RequestSender};

/// Receiving ends of a connection's notification streams.
///
/// Both streams end when the connection's handler is dropped.
pub struct SessionEvents {
    /// Channel-open notifications
    pub channels: mpsc::UnboundedReceiver<NewChannel<Channel<Msg>>>,
    /// Connection-level requests
    pub globals: mpsc::UnboundedReceiver<GlobalRequest>,
    /// Set once the client has authenticated
    pub authenticated: Arc<AtomicBool>,
}

/// Handler for a single SSH client connection
pub struct SessionHandler {
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Sender for channel-open notifications
    channels_tx: mpsc::UnboundedSender<NewChannel<Channel<Msg>>>,
    /// Sender for connection-level requests
    globals_tx: mpsc::UnboundedSender<GlobalRequest>,
    /// Request senders of accepted channels
    requests: HashMap<ChannelId, RequestSender>,
    /// Shared with [`SessionEvents::authenticated`]
    authenticated: Arc<AtomicBool>,
}

impl SessionHandler {
    /// Create a handler and the streams it feeds
    pub fn new(peer_addr: SocketAddr) -> (Self, SessionEvents) {
        let (channels_tx, channels) = mpsc::unbounded_channel();
        let (globals_tx, globals) = mpsc::unbounded_channel();
        let authenticated = Arc::new(AtomicBool::new(false));

        let handler = Self {
            peer_addr,
            channels_tx,
            globals_tx,
            requests: HashMap::new(),
            authenticated: Arc::clone(&authenticated),
        };

        let events = SessionEvents {
            channels,
            globals,
            authenticated,
        };
        (handler, events)
    }

    /// Every authentication attempt succeeds
    fn accept_auth(&self) -> Auth {
        self.authenticated.store(true, Ordering::SeqCst);
        Auth::Accept
    }

    /// Hand a channel-open to the supervisor and wait for its verdict
    async fn open_channel(&mut self, channel_type: &str, channel: Channel<Msg>) -> bool {
        let channel_id = channel.id();
        let (new_channel, opening) = NewChannel::new(channel_type, channel);

        if self.channels_tx.send(new_channel).is_err() {
            tracing::warn!("No supervisor for channel {:?} from {}", channel_id, self.peer_addr);
            return false;
        }

        match opening.wait().await {
            Opened::Accepted(requests) => {
                self.requests.insert(channel_id, requests);
                true
            }
            Opened::Rejected {
                reason,
                description,
            } => {
                tracing::debug!(
                    "Channel {:?} ({}) from {} rejected: {} ({:?})",
                    channel_id,
                    channel_type,
                    self.peer_addr,
                    description,
                    reason
                );
                false
            }
        }
    }

    /// Hand a channel request to the supervisor and relay its answer.
    ///
    /// russh only emits the success/failure message when the peer asked for
    /// a reply, so requests are forwarded as wanting one.
    async fn forward_request(
        &mut self,
        channel: ChannelId,
        request_type: &str,
        payload: Bytes,
        session: &mut Session,
    ) {
        let (request, reply) = ChannelRequest::new(request_type, payload, true);

        let sent = match self.requests.get(&channel) {
            Some(sender) => sender.send(request).is_ok(),
            None => false,
        };

        let success = if sent {
            reply.outcome().await.unwrap_or(false)
        } else {
            self.requests.remove(&channel);
            false
        };

        tracing::trace!(
            "{} request on {:?} answered: {}",
            request_type,
            channel,
            success
        );

        if success {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
    }

    /// Record a connection-level request; they are always refused
    fn discard_global(&self, request_type: &str) -> bool {
        let _ = self.globals_tx.send(GlobalRequest {
            request_type: request_type.to_string(),
            want_reply: true,
        });
        false
    }
}

/// Append an SSH string (length-prefixed bytes)
fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    /// Every client is accepted without credentials
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!("Accepting {} from {} without credentials", user, self.peer_addr);
        Ok(self.accept_auth())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        tracing::debug!("Accepting {} from {} (password ignored)", user, self.peer_addr);
        Ok(self.accept_auth())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(
            "Accepting {} from {} (key {} ignored)",
            user,
            self.peer_addr,
            public_key.fingerprint()
        );
        Ok(self.accept_auth())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open_channel("session", channel).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "direct-tcpip to {}:{} requested by {}",
            host_to_connect,
            port_to_connect,
            self.peer_addr
        );
        Ok(self.open_channel("direct-tcpip", channel).await)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "exec {:?} on {:?} from {}",
            String::from_utf8_lossy(data),
            channel,
            self.peer_addr
        );
        self.forward_request(channel, "exec", encode_exec_payload(data), session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, "shell", Bytes::new(), session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        self.forward_request(channel, "subsystem", payload.freeze(), session).await;
        Ok(())
    }

    /// Terminal modes are not carried in the forwarded payload
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, term.as_bytes());
        payload.put_u32(col_width);
        payload.put_u32(row_height);
        payload.put_u32(pix_width);
        payload.put_u32(pix_height);
        put_string(&mut payload, &[]);
        self.forward_request(channel, "pty-req", payload.freeze(), session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, variable_name.as_bytes());
        put_string(&mut payload, variable_value.as_bytes());
        self.forward_request(channel, "env", payload.freeze(), session).await;
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        single_connection: bool,
        x11_auth_protocol: &str,
        x11_auth_cookie: &str,
        x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        payload.put_u8(u8::from(single_connection));
        put_string(&mut payload, x11_auth_protocol.as_bytes());
        put_string(&mut payload, x11_auth_cookie.as_bytes());
        payload.put_u32(x11_screen_number);
        self.forward_request(channel, "x11-req", payload.freeze(), session).await;
        Ok(())
    }

    /// The reply goes out from here; russh's own follow-up for a `false`
    /// result only looks at the connection-level want-reply flag
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward_request(channel, "auth-agent-req@openssh.com", Bytes::new(), session)
            .await;
        Ok(false)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        payload.put_u32(col_width);
        payload.put_u32(row_height);
        payload.put_u32(pix_width);
        payload.put_u32(pix_height);
        self.forward_request(channel, "window-change", payload.freeze(), session).await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, format!("{:?}", signal).as_bytes());
        self.forward_request(channel, "signal", payload.freeze(), session).await;
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("tcpip-forward {}:{} from {}", address, port, self.peer_addr);
        Ok(self.discard_global("tcpip-forward"))
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "cancel-tcpip-forward {}:{} from {}",
            address,
            port,
            self.peer_addr
        );
        Ok(self.discard_global("cancel-tcpip-forward"))
    }

    /// Ends the channel's request stream
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.requests.remove(&channel);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        Ok(())
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a server configuration with the given host key.
    ///
    /// All authentication methods are offered and all of them succeed.
    /// Connections are never timed out for inactivity.
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = MethodSet::all();
        config.inactivity_timeout = None;
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_string() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, b"sftp");
        assert_eq!(&buf[..], b"\0\0\0\x04sftp");
    }

    #[test]
    fn test_server_config_accepts_everyone() {
        let key = russh_keys::key::KeyPair::generate_ed25519().unwrap();
        let config = ServerConfig::new(key);

        assert_eq!(config.ssh_config.keys.len(), 1);
        assert!(config.ssh_config.methods.contains(MethodSet::NONE));
        assert!(config.ssh_config.inactivity_timeout.is_none());
    }

    #[test]
    fn test_auth_marks_connection_authenticated() {
        let (handler, events) = SessionHandler::new("127.0.0.1:2022".parse().unwrap());
        assert!(!events.authenticated.load(Ordering::SeqCst));

        assert!(matches!(handler.accept_auth(), Auth::Accept));
        assert!(events.authenticated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_events_end_with_handler() {
        let (handler, mut events) = SessionHandler::new("127.0.0.1:2022".parse().unwrap());
        drop(handler);

        assert!(events.channels.recv().await.is_none());
        assert!(events.globals.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_discard_global_refuses() {
        let (handler, mut events) = SessionHandler::new("127.0.0.1:2022".parse().unwrap());

        assert!(!handler.discard_global("tcpip-forward"));
        let request = events.globals.recv().await.unwrap();
        assert_eq!(request.request_type, "tcpip-forward");
    }
}
