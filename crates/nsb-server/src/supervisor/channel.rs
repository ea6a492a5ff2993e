//! Channel supervisor
//!
//! Accepts session channels, refuses every other type, and walks the
//! request stream of an accepted channel in arrival order. Only the one
//! allowed exec command leads to a relay.

use std::sync::Arc;

use nsb_core::{validate_exec_payload, BridgeError};

use crate::channel::{
    ChannelRequest, ChannelTransport, NewChannel, RejectReason, EXEC_REQUEST, SESSION_CHANNEL,
};
use crate::relay::{spawn_relay, SocketDialer};

/// Handle one channel-open notification until its request stream ends.
///
/// Returns an error only when dialing the daemon socket failed; the channel
/// stops processing requests in that case.
pub async fn supervise_channel<T: ChannelTransport>(
    new_channel: NewChannel<T>,
    dialer: Arc<SocketDialer>,
) -> Result<(), BridgeError> {
    if new_channel.channel_type() != SESSION_CHANNEL {
        tracing::debug!("Rejecting channel of type {:?}", new_channel.channel_type());
        new_channel.reject(RejectReason::UnknownChannelType, "unknown channel type");
        return Ok(());
    }

    let (io, mut requests) = new_channel.accept();
    let mut io = Some(io);
    tracing::debug!("Session channel accepted");

    while let Some(request) = requests.next().await {
        if request.request_type() != EXEC_REQUEST {
            tracing::debug!("Refusing {:?} request", request.request_type());
            refuse(request);
            continue;
        }

        if let Err(e) = validate_exec_payload(request.payload()) {
            tracing::warn!("Refusing exec request: {}", e);
            refuse(request);
            continue;
        }

        if io.is_none() {
            tracing::warn!("Refusing exec request: channel is already relaying");
            refuse(request);
            continue;
        }

        let want_reply = request.want_reply();
        let socket = match dialer.dial().await {
            Ok(socket) => socket,
            Err(e) => {
                if want_reply {
                    request.reply(false);
                }
                return Err(e);
            }
        };

        if want_reply {
            request.reply(true);
        }

        if let Some(io) = io.take() {
            tracing::info!("Relaying channel to {}", dialer.path().display());
            spawn_relay(io, socket);
        }
    }

    tracing::debug!("Channel request stream ended");
    Ok(())
}

/// Answer negatively if the peer is waiting for an answer
fn refuse(request: ChannelRequest) {
    if request.want_reply() {
        request.reply(false);
    }
}
