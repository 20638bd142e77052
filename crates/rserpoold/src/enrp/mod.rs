//! Registrar networking: one UDP socket per protocol, the receive loops
//! feeding [`RegistrarState`], and the periodic announce and timer loops.
//!
//! The state sits behind a tokio mutex shared by every task. Replies are
//! encoded and sent after the lock is released.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use rserpool_core::wire::{Protocol, MAX_MESSAGE_SIZE};
use rserpool_core::{encode, RSerPoolMessage};
use rserpool_services::{Outgoing, RegistrarState};

pub mod announce;
pub mod listener;

pub type SharedRegistrar = Arc<Mutex<RegistrarState>>;

// ── Sockets ───────────────────────────────────────────────────────────────────

/// The ENRP and ASAP sockets. Outgoing messages leave through the socket of
/// their protocol.
#[derive(Clone)]
pub struct Sockets {
    pub enrp: Arc<UdpSocket>,
    pub asap: Arc<UdpSocket>,
}

impl Sockets {
    pub fn bind(enrp: SocketAddr, asap: SocketAddr) -> Result<Self> {
        Ok(Self {
            enrp: Arc::new(bind_udp(enrp).context("failed to bind ENRP socket")?),
            asap: Arc::new(bind_udp(asap).context("failed to bind ASAP socket")?),
        })
    }

    fn for_protocol(&self, protocol: Protocol) -> &UdpSocket {
        match protocol {
            Protocol::Enrp => &self.enrp,
            Protocol::Asap => &self.asap,
        }
    }

    /// Encode and send one message. Failures are logged and dropped.
    pub async fn send(&self, destination: SocketAddr, message: &RSerPoolMessage) {
        let encoded = match encode(message, MAX_MESSAGE_SIZE) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, message_type = ?message.message_type(), "failed to encode message");
                return;
            }
        };
        if !encoded.complete {
            tracing::debug!(entries = encoded.entries, "response truncated to fit one datagram");
        }
        let socket = self.for_protocol(message.message_type().protocol());
        match socket.send_to(&encoded.bytes, destination).await {
            Ok(n) => tracing::trace!(
                bytes = n,
                %destination,
                message_type = ?message.message_type(),
                "sent"
            ),
            Err(e) => tracing::warn!(error = %e, %destination, "send_to failed"),
        }
    }

    pub async fn send_all(&self, outgoing: Vec<Outgoing>) {
        for Outgoing { destination, message } in outgoing {
            self.send(destination, &message).await;
        }
    }
}

/// Create a non-blocking UDP socket bound to `address`.
fn bind_udp(address: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(SocketProtocol::UDP))
        .context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if address.is_ipv6() {
        socket.set_only_v6(false).context("IPV6_V6ONLY")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&address.into()).context("bind()")?;
    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}
