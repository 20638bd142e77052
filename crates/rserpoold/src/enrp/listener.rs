//! Datagram receive loop for one protocol.
//!
//! Each datagram is decoded with the PPID of the socket's protocol. Decoded
//! messages go to the registrar state; rejected ones are answered with an
//! error message when the codec says the sender should hear about it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use rserpool_core::time::now_micros;
use rserpool_core::wire::{Protocol, MAX_MESSAGE_SIZE};
use rserpool_core::{decode, DecodeFailure};

use super::{SharedRegistrar, Sockets};

pub struct Listener {
    socket: Arc<UdpSocket>,
    protocol: Protocol,
    state: SharedRegistrar,
    sockets: Sockets,
    shutdown: broadcast::Receiver<()>,
}

impl Listener {
    pub fn new(
        protocol: Protocol,
        state: SharedRegistrar,
        sockets: Sockets,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let socket = match protocol {
            Protocol::Enrp => sockets.enrp.clone(),
            Protocol::Asap => sockets.asap.clone(),
        };
        Self {
            socket,
            protocol,
            state,
            sockets,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        tracing::info!(protocol = ?self.protocol, addr = %self.socket.local_addr()?, "listener starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(protocol = ?self.protocol, "listener shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer_addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };
                    self.handle_datagram(&buf[..len], peer_addr).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], peer_addr: SocketAddr) {
        match decode(data, self.protocol.ppid(), Some(peer_addr)) {
            Ok(message) => {
                tracing::debug!(
                    peer = %peer_addr,
                    message_type = ?message.message_type(),
                    flags = message.flags,
                    "received"
                );
                let outgoing = self.state.lock().await.handle_message(message, peer_addr, now_micros());
                self.sockets.send_all(outgoing).await;
            }
            Err(failure) => self.reject(failure, data, peer_addr).await,
        }
    }

    async fn reject(&self, failure: DecodeFailure, data: &[u8], peer_addr: SocketAddr) {
        tracing::warn!(
            peer = %peer_addr,
            error = %failure,
            head = hex::encode(&data[..data.len().min(16)]),
            "rejected datagram"
        );
        let own = self.state.lock().await.identifier();
        if let Some(reply) = failure.error_reply(own) {
            self.sockets.send(peer_addr, &reply).await;
        }
    }
}
