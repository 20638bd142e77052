//! rserpool integration test harness.
//!
//! Most tests here run several registrars in one process on a simulated
//! network: every message a registrar emits is encoded, decoded again with
//! the PPID of its protocol and handed to the registrar listening at the
//! destination address. Messages to any other address land in that
//! address's inbox, which is how tests play the part of pool elements and
//! pool users. Time only moves when a test calls [`Network::advance`].
//!
//! The `udp` tests bind real loopback sockets and need no setup.
//!
//!   cargo test --test integration

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use rserpool_core::config::EnrpConfig;
use rserpool_core::time::millis;
use rserpool_core::wire::{MessageType, MAX_MESSAGE_SIZE};
use rserpool_core::{
    decode, encode, MessageBody, PolicyType, PoolElement, PoolHandle, PoolPolicySettings, RSerPoolMessage,
    RegistrarIdentifier, TransportAddressBlock, TransportProtocol,
};
use rserpool_services::{Outgoing, RegistrarState};

mod registrars;
mod udp;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Give up on a burst of traffic after this many deliveries.
const MAX_DELIVERIES: usize = 10_000;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn udp_block(address: SocketAddr) -> TransportAddressBlock {
    TransportAddressBlock::from_socket_addr(TransportProtocol::Udp, address, 0)
}

pub fn pool(name: &str) -> PoolHandle {
    PoolHandle::try_from(name).unwrap()
}

/// A round robin pool element offering its service on `port`.
pub fn element(identifier: u32, port: u16) -> PoolElement {
    PoolElement {
        identifier,
        home_registrar: 0,
        registration_life: 60_000,
        policy: PoolPolicySettings::new(PolicyType::RoundRobin),
        user_transport: udp_block(addr(port)),
        registrator_transport: None,
    }
}

pub fn registration(handle: &PoolHandle, element: PoolElement) -> RSerPoolMessage {
    RSerPoolMessage::new(MessageBody::Registration {
        handle: handle.clone(),
        element,
        error: None,
    })
}

pub fn resolution(handle: &PoolHandle) -> RSerPoolMessage {
    RSerPoolMessage::new(MessageBody::HandleResolution {
        handle: handle.clone(),
        items: None,
    })
}

/// Push a message through the codec the way a datagram would travel.
pub fn over_the_wire(message: &RSerPoolMessage, source: SocketAddr) -> Result<RSerPoolMessage> {
    let encoded = encode(message, MAX_MESSAGE_SIZE).context("encode")?;
    decode(&encoded.bytes, encoded.ppid, Some(source))
        .map_err(|failure| anyhow::anyhow!("decode failed: {failure}"))
}

/// One delivered datagram, for assertions on the traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub message_type: MessageType,
}

/// Registrars keyed by their ENRP address, plus inboxes for everybody else.
pub struct Network {
    config: EnrpConfig,
    now: u64,
    registrars: BTreeMap<SocketAddr, RegistrarState>,
    queue: VecDeque<(SocketAddr, Outgoing)>,
    inboxes: HashMap<SocketAddr, Vec<RSerPoolMessage>>,
    log: Vec<Delivery>,
}

impl Network {
    pub fn new(config: EnrpConfig) -> Self {
        Self {
            config,
            now: 0,
            registrars: BTreeMap::new(),
            queue: VecDeque::new(),
            inboxes: HashMap::new(),
            log: Vec::new(),
        }
    }

    /// Start a registrar at 127.0.0.1:`port`, with static peers at `peers`.
    pub fn add_registrar(&mut self, identifier: RegistrarIdentifier, port: u16, peers: &[u16]) -> SocketAddr {
        let address = addr(port);
        let mut state = RegistrarState::new(identifier, udp_block(address), &self.config);
        for peer in peers {
            state.add_static_peer(addr(*peer), self.now).unwrap();
        }
        self.registrars.insert(address, state);
        address
    }

    /// Take a registrar off the network. Its traffic piles up in an inbox.
    pub fn remove_registrar(&mut self, address: SocketAddr) -> Option<RegistrarState> {
        self.registrars.remove(&address)
    }

    pub fn registrar(&self, address: SocketAddr) -> &RegistrarState {
        &self.registrars[&address]
    }

    /// Send `message` from `from` to `to` and run the network until quiet.
    pub fn send(&mut self, from: SocketAddr, to: SocketAddr, message: RSerPoolMessage) -> Result<()> {
        self.queue.push_back((from, Outgoing { destination: to, message }));
        self.run()
    }

    /// Every registrar announces itself to its peers.
    pub fn announce_all(&mut self) -> Result<()> {
        for (address, state) in &self.registrars {
            self.queue
                .extend(state.announce().into_iter().map(|outgoing| (*address, outgoing)));
        }
        self.run()
    }

    /// Move the clock forward and fire every timer that fell due, on every
    /// registrar, before delivering anything.
    pub fn advance(&mut self, ms: u64) -> Result<()> {
        self.now += millis(ms);
        for (address, state) in &mut self.registrars {
            self.queue
                .extend(state.handle_timers(self.now).into_iter().map(|outgoing| (*address, outgoing)));
        }
        self.run()
    }

    /// Drain the messages delivered to a non-registrar address.
    pub fn take_inbox(&mut self, address: SocketAddr) -> Vec<RSerPoolMessage> {
        self.inboxes.remove(&address).unwrap_or_default()
    }

    /// How many messages of `message_type` have been delivered so far.
    pub fn delivered(&self, message_type: MessageType) -> usize {
        self.log.iter().filter(|d| d.message_type == message_type).count()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    fn run(&mut self) -> Result<()> {
        let mut deliveries = 0;
        while let Some((from, Outgoing { destination, message })) = self.queue.pop_front() {
            deliveries += 1;
            if deliveries > MAX_DELIVERIES {
                bail!("network did not settle after {MAX_DELIVERIES} deliveries");
            }
            let received = over_the_wire(&message, from)?;
            self.log.push(Delivery {
                from,
                to: destination,
                message_type: received.message_type(),
            });
            match self.registrars.get_mut(&destination) {
                Some(state) => {
                    let replies = state.handle_message(received, from, self.now);
                    self.queue
                        .extend(replies.into_iter().map(|outgoing| (destination, outgoing)));
                }
                None => self.inboxes.entry(destination).or_default().push(received),
            }
        }
        Ok(())
    }
}

/// Every registrar's peer checksums agree with its handlespace.
pub fn assert_consistent(network: &Network, address: SocketAddr) {
    let state = network.registrar(address);
    if let Err(mismatch) = state.peers().verify_checksums(state.handlespace()) {
        panic!("registrar at {address}: {mismatch}");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Every message the harness moves survives the codec unchanged.
#[test]
fn test_harness_round_trips_messages() {
    let handle = pool("EchoPool");
    let message = registration(&handle, element(7, 7000));
    let received = over_the_wire(&message, addr(9000)).unwrap();
    assert_eq!(received.body, message.body);
}

/// Traffic to an address nobody listens on ends up in its inbox.
#[test]
fn test_unknown_destinations_collect_messages() {
    let mut network = Network::new(EnrpConfig::default());
    let registrar = network.add_registrar(0x01, 3001, &[]);
    network
        .send(addr(9000), registrar, resolution(&pool("Nothing")))
        .unwrap();

    let inbox = network.take_inbox(addr(9000));
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].message_type(), MessageType::HandleResolutionResponse);
    assert!(network.take_inbox(addr(9000)).is_empty());
}
