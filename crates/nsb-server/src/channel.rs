//! Channel contract between the SSH transport and the supervisors
//!
//! The supervisors never talk to the SSH library directly. The transport
//! adapter turns every channel-open into a [`NewChannel`] and every channel
//! request into a [`ChannelRequest`], then waits for the supervisor's
//! decision through the matching [`ChannelOpening`] or [`PendingReply`].

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot};

/// Channel type that carries exec requests
pub const SESSION_CHANNEL: &str = "session";

/// Request type that asks for a command to be executed
pub const EXEC_REQUEST: &str = "exec";

/// Bidirectional byte pipe of an accepted channel
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Boxed byte pipe handed to the relay
pub type ChannelIo = Box<dyn ByteStream>;

/// Transport-side object of an opened channel
pub trait ChannelTransport: Send + 'static {
    /// Turn the channel into a byte pipe once it has been accepted
    fn into_io(self) -> ChannelIo;
}

impl ChannelTransport for russh::Channel<russh::server::Msg> {
    fn into_io(self) -> ChannelIo {
        Box::new(self.into_stream())
    }
}

impl ChannelTransport for DuplexStream {
    fn into_io(self) -> ChannelIo {
        Box::new(self)
    }
}

/// Why a channel-open was refused.
///
/// Only logged: russh picks the reason code sent to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Refused without a supervisor decision
    AdministrativelyProhibited,
    /// Channel type the bridge does not serve
    UnknownChannelType,
}

/// Supervisor's answer to a channel-open
#[derive(Debug)]
enum Verdict {
    Accept,
    Reject {
        reason: RejectReason,
        description: String,
    },
}

/// A channel-open notification waiting for a verdict
pub struct NewChannel<T> {
    channel_type: String,
    transport: T,
    verdict_tx: oneshot::Sender<Verdict>,
    requests_rx: mpsc::UnboundedReceiver<ChannelRequest>,
}

impl<T: ChannelTransport> NewChannel<T> {
    /// Create a notification for a channel of the declared type.
    ///
    /// The returned [`ChannelOpening`] stays with the transport adapter.
    pub fn new(channel_type: impl Into<String>, transport: T) -> (Self, ChannelOpening) {
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let new_channel = Self {
            channel_type: channel_type.into(),
            transport,
            verdict_tx,
            requests_rx,
        };
        let opening = ChannelOpening {
            verdict_rx,
            requests_tx,
        };

        (new_channel, opening)
    }

    /// Channel type declared by the peer
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Accept the channel, yielding its byte pipe and its request stream
    pub fn accept(self) -> (ChannelIo, RequestStream) {
        let _ = self.verdict_tx.send(Verdict::Accept);
        (self.transport.into_io(), RequestStream(self.requests_rx))
    }

    /// Refuse the channel
    pub fn reject(self, reason: RejectReason, description: &str) {
        let _ = self.verdict_tx.send(Verdict::Reject {
            reason,
            description: description.to_string(),
        });
    }
}

/// Outcome of a channel-open as seen by the transport adapter
#[derive(Debug)]
pub enum Opened {
    /// Channel accepted; requests for it go through the sender
    Accepted(RequestSender),
    /// Channel refused
    Rejected {
        reason: RejectReason,
        description: String,
    },
}

/// Adapter-side half of a [`NewChannel`]
pub struct ChannelOpening {
    verdict_rx: oneshot::Receiver<Verdict>,
    requests_tx: mpsc::UnboundedSender<ChannelRequest>,
}

impl ChannelOpening {
    /// Wait for the supervisor to accept or reject the channel.
    ///
    /// A notification dropped without a verdict counts as a rejection.
    pub async fn wait(self) -> Opened {
        match self.verdict_rx.await {
            Ok(Verdict::Accept) => Opened::Accepted(RequestSender(self.requests_tx)),
            Ok(Verdict::Reject {
                reason,
                description,
            }) => Opened::Rejected {
                reason,
                description,
            },
            Err(_) => Opened::Rejected {
                reason: RejectReason::AdministrativelyProhibited,
                description: "channel dropped".to_string(),
            },
        }
    }
}

/// Feeds requests of one accepted channel to its supervisor, in order
#[derive(Debug, Clone)]
pub struct RequestSender(mpsc::UnboundedSender<ChannelRequest>);

impl RequestSender {
    /// Queue a request. Fails once the supervisor stopped reading.
    pub fn send(&self, request: ChannelRequest) -> Result<(), ChannelRequest> {
        self.0.send(request).map_err(|e| e.0)
    }
}

/// Requests of one accepted channel, in arrival order
pub struct RequestStream(mpsc::UnboundedReceiver<ChannelRequest>);

impl RequestStream {
    /// Next request, or `None` once the channel is closed
    pub async fn next(&mut self) -> Option<ChannelRequest> {
        self.0.recv().await
    }
}

/// A single request on an accepted channel
#[derive(Debug)]
pub struct ChannelRequest {
    request_type: String,
    payload: Bytes,
    want_reply: bool,
    reply_tx: oneshot::Sender<bool>,
}

impl ChannelRequest {
    /// Create a request; the [`PendingReply`] resolves once it is answered or dropped
    pub fn new(
        request_type: impl Into<String>,
        payload: Bytes,
        want_reply: bool,
    ) -> (Self, PendingReply) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Self {
            request_type: request_type.into(),
            payload,
            want_reply,
            reply_tx,
        };
        (request, PendingReply(reply_rx))
    }

    /// Request type tag, e.g. `exec`
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Raw request-specific payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the peer asked for a reply
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Answer the request
    pub fn reply(self, success: bool) {
        let _ = self.reply_tx.send(success);
    }
}

/// Adapter-side handle on a request's reply
#[derive(Debug)]
pub struct PendingReply(oneshot::Receiver<bool>);

impl PendingReply {
    /// The reply, or `None` if the request was dropped unanswered
    pub async fn outcome(self) -> Option<bool> {
        self.0.await.ok()
    }
}

/// A connection-level request; carries no meaning for the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    pub request_type: String,
    pub want_reply: bool,
}
