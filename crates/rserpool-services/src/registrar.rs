//! Registrar state machine.
//!
//! [`RegistrarState`] owns the handlespace and the peer list and turns each
//! incoming ASAP or ENRP message, and each expired timer, into the messages
//! to send in response. It never touches a socket; the daemon feeds it
//! decoded messages and timestamps and sends whatever comes back.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rserpool_core::config::EnrpConfig;
use rserpool_core::message::{HandleTableEntry, OperationError, ResolutionOutcome, ServerInformation};
use rserpool_core::time::millis;
use rserpool_core::wire::{
    HandleUpdateAction, AHF_REGISTRATION_REJECT, EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY,
    EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND, EHF_HANDLE_TABLE_RESPONSE_REJECT, EHF_LIST_RESPONSE_REJECT,
    EHF_PRESENCE_REPLY_REQUIRED, MAX_HANDLE_RESOLUTION_ITEMS, UNDEFINED_REGISTRAR_IDENTIFIER,
};
use rserpool_core::{
    MessageBody, PoolElement, PoolElementIdentifier, PoolHandle, RSerPoolMessage, RegistrarIdentifier,
    RspError, TransportAddressBlock, TransportProtocol,
};

use crate::handlespace::{OwnershipChecksums, PoolHandlespace};
use crate::peer_list::{
    PeerHandle, PLNF_DYNAMIC, PLNF_FROM_PEER, PLNF_NEW, PLNF_STATIC, PLNS_HTSYNC, PLNT_MAX_TIME_LAST_HEARD,
    PLNT_MAX_TIME_NO_RESPONSE, PLNT_TAKEOVER_EXPIRY,
};
use crate::peer_list_management::PeerListManagement;
use crate::takeover::TakeoverProcess;

/// A message and where to send it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub destination: SocketAddr,
    pub message: RSerPoolMessage,
}

/// Per-peer synchronisation state, kept as the peer node's user data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSyncState {
    /// Last entry of the partial Handle Table Response sent to this peer.
    pub handle_table_cursor: Option<(PoolHandle, PoolElementIdentifier)>,
}

fn forget_sync_state(identifier: RegistrarIdentifier, state: PeerSyncState) {
    if state.handle_table_cursor.is_some() {
        tracing::debug!(peer = format_args!("${identifier:08x}"), "dropping unfinished handle table transfer");
    }
}

pub type Peers = PeerListManagement<PeerSyncState, fn(RegistrarIdentifier, PeerSyncState)>;

/// Timeouts in microseconds, derived from [`EnrpConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrarTimeouts {
    pub max_time_last_heard: u64,
    pub max_time_no_response: u64,
    pub takeover_expiry: u64,
    pub max_elements_per_handle_table_request: usize,
}

impl From<&EnrpConfig> for RegistrarTimeouts {
    fn from(config: &EnrpConfig) -> Self {
        Self {
            max_time_last_heard: millis(config.max_time_last_heard_ms),
            max_time_no_response: millis(config.max_time_no_response_ms),
            takeover_expiry: millis(config.takeover_expiry_ms),
            max_elements_per_handle_table_request: config.max_elements_per_handle_table_request.max(1),
        }
    }
}

pub struct RegistrarState {
    identifier: RegistrarIdentifier,
    /// ENRP transport announced to peers.
    transport: TransportAddressBlock,
    timeouts: RegistrarTimeouts,
    handlespace: PoolHandlespace,
    peers: Peers,
}

impl RegistrarState {
    pub fn new(identifier: RegistrarIdentifier, transport: TransportAddressBlock, config: &EnrpConfig) -> Self {
        Self {
            identifier,
            transport,
            timeouts: RegistrarTimeouts::from(config),
            handlespace: PoolHandlespace::new(),
            peers: PeerListManagement::new(identifier, forget_sync_state as fn(RegistrarIdentifier, PeerSyncState)),
        }
    }

    pub fn identifier(&self) -> RegistrarIdentifier {
        self.identifier
    }

    pub fn handlespace(&self) -> &PoolHandlespace {
        &self.handlespace
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Add a configured peer whose identifier is not known yet.
    pub fn add_static_peer(&mut self, address: SocketAddr, now: u64) -> Result<PeerHandle, RspError> {
        let block = TransportAddressBlock::from_socket_addr(TransportProtocol::Udp, address, 0);
        self.peers.register(0, PLNF_STATIC, &block, now, None)
    }

    /// Earliest pending handlespace or peer timer.
    pub fn next_deadline(&self) -> Option<u64> {
        [self.handlespace.next_timer_timestamp(), self.peers.next_timer_timestamp()]
            .into_iter()
            .flatten()
            .min()
    }

    // ── Outgoing helpers ─────────────────────────────────────────────────────

    fn server_information(&self) -> ServerInformation {
        ServerInformation {
            server_id: self.identifier,
            transport: self.transport.clone(),
        }
    }

    fn presence(&self, receiver: RegistrarIdentifier, flags: u8) -> RSerPoolMessage {
        RSerPoolMessage::new(MessageBody::Presence {
            sender: self.identifier,
            receiver,
            checksum: self.handlespace.ownership_checksum(self.identifier).finish(),
            server: self.server_information(),
        })
        .with_flags(flags)
    }

    fn peer_destination(&self, handle: PeerHandle) -> Option<SocketAddr> {
        self.peers.get(handle)?.address_block().socket_addrs().next()
    }

    /// One message per identified peer except `skip`, built by `body`.
    fn to_identified_peers(
        &self,
        skip: RegistrarIdentifier,
        body: impl Fn(RegistrarIdentifier) -> MessageBody,
    ) -> Vec<Outgoing> {
        self.peers
            .iter()
            .filter(|(_, node)| node.has_identifier() && node.identifier() != skip)
            .filter_map(|(handle, node)| {
                Some(Outgoing {
                    destination: self.peer_destination(handle)?,
                    message: RSerPoolMessage::new(body(node.identifier())),
                })
            })
            .collect()
    }

    fn handle_update(&self, action: HandleUpdateAction, handle: &PoolHandle, element: &PoolElement) -> Vec<Outgoing> {
        self.to_identified_peers(0, |receiver| MessageBody::HandleUpdate {
            sender: self.identifier,
            receiver,
            action,
            handle: handle.clone(),
            element: element.clone(),
        })
    }

    fn reply(destination: SocketAddr, message: RSerPoolMessage) -> Vec<Outgoing> {
        vec![Outgoing { destination, message }]
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// React to one decoded message from `source`.
    pub fn handle_message(&mut self, message: RSerPoolMessage, source: SocketAddr, now: u64) -> Vec<Outgoing> {
        if message.body.sender() == Some(self.identifier) {
            tracing::trace!("ignoring own message");
            return Vec::new();
        }
        let flags = message.flags;
        match message.body {
            // ── ASAP ──
            MessageBody::Registration { handle, element, .. } => self.registration(handle, element, source, now),
            MessageBody::Deregistration { handle, identifier } => self.deregistration(handle, identifier, source),
            MessageBody::HandleResolution { handle, items } => self.handle_resolution(handle, items, source),
            MessageBody::EndpointUnreachable { handle, identifier } => {
                tracing::debug!(%handle, identifier = format_args!("#{identifier:08x}"), "endpoint reported unreachable");
                Vec::new()
            }
            MessageBody::AsapError { error } => {
                tracing::warn!(%source, cause = %error.cause, "ASAP error received");
                Vec::new()
            }

            // ── ENRP ──
            MessageBody::Presence {
                sender,
                checksum,
                server,
                ..
            } => self.presence_received(sender, flags, checksum, server, source, now),
            MessageBody::ListRequest { sender, .. } => self.list_request(sender, source),
            MessageBody::ListResponse { servers, .. } => self.list_response(flags, servers, now),
            MessageBody::HandleTableRequest { sender, .. } => {
                self.handle_table_request_received(sender, flags, source)
            }
            MessageBody::HandleTableResponse { sender, pools, .. } => {
                self.handle_table_response(sender, flags, pools, source, now)
            }
            MessageBody::HandleUpdate {
                sender,
                action,
                handle,
                element,
                ..
            } => self.handle_update_received(sender, action, handle, element, now),
            MessageBody::InitTakeover { sender, target, .. } => self.init_takeover(sender, target, source),
            MessageBody::InitTakeoverAck { sender, target, .. } => self.init_takeover_ack(sender, target),
            MessageBody::TakeoverServer { sender, target, .. } => self.takeover_server(sender, target),
            MessageBody::EnrpError { sender, error, .. } => {
                tracing::warn!(peer = format_args!("${sender:08x}"), cause = %error.cause, "ENRP error received");
                Vec::new()
            }
            other => {
                tracing::debug!(message_type = ?other.message_type(), %source, "ignoring message");
                Vec::new()
            }
        }
    }

    // ── ASAP ─────────────────────────────────────────────────────────────────

    fn registration(
        &mut self,
        handle: PoolHandle,
        mut element: PoolElement,
        source: SocketAddr,
        now: u64,
    ) -> Vec<Outgoing> {
        let identifier = element.identifier;
        element.home_registrar = self.identifier;
        element.registrator_transport = Some(TransportAddressBlock::from_socket_addr(
            TransportProtocol::Udp,
            source,
            0,
        ));

        let result = self
            .handlespace
            .register_pool_element(&handle, element, now, &mut self.peers)
            .and_then(|_| self.handlespace.restart_pool_element_expiry(&handle, identifier));

        let (error, flags) = match result {
            Ok(_) => {
                tracing::info!(%handle, identifier = format_args!("#{identifier:08x}"), "pool element registered");
                (None, 0)
            }
            Err(cause) => {
                tracing::warn!(%handle, identifier = format_args!("#{identifier:08x}"), %cause, "registration rejected");
                (Some(OperationError::new(cause)), AHF_REGISTRATION_REJECT)
            }
        };
        let accepted = error.is_none();
        let mut out = Self::reply(
            source,
            RSerPoolMessage::new(MessageBody::RegistrationResponse {
                handle: handle.clone(),
                identifier,
                error,
            })
            .with_flags(flags),
        );
        if accepted {
            if let Some(node) = self.handlespace.find_pool_element(&handle, identifier) {
                out.extend(self.handle_update(HandleUpdateAction::AddPoolElement, &handle, &node.element));
            }
        }
        out
    }

    fn deregistration(
        &mut self,
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
        source: SocketAddr,
    ) -> Vec<Outgoing> {
        let result = self
            .handlespace
            .deregister_pool_element(&handle, identifier, &mut self.peers);
        let error = result.as_ref().err().map(|cause| OperationError::new(*cause));
        let mut out = Self::reply(
            source,
            RSerPoolMessage::new(MessageBody::DeregistrationResponse {
                handle: handle.clone(),
                identifier,
                error,
            }),
        );
        if let Ok(node) = result {
            tracing::info!(%handle, identifier = format_args!("#{identifier:08x}"), "pool element deregistered");
            out.extend(self.handle_update(HandleUpdateAction::DeletePoolElement, &handle, &node.element));
        }
        out
    }

    fn handle_resolution(&mut self, handle: PoolHandle, items: Option<u32>, source: SocketAddr) -> Vec<Outgoing> {
        let max = items.map_or(MAX_HANDLE_RESOLUTION_ITEMS, |items| {
            usize::try_from(items).map_or(MAX_HANDLE_RESOLUTION_ITEMS, |items| items.min(MAX_HANDLE_RESOLUTION_ITEMS))
        });
        let outcome = match self.handlespace.select(&handle, max) {
            Ok((policy, mut elements)) => {
                for element in &mut elements {
                    element.registrator_transport = None;
                }
                ResolutionOutcome::Resolved { policy, elements }
            }
            Err(cause) => {
                tracing::debug!(%handle, %cause, "handle resolution failed");
                ResolutionOutcome::Failed(OperationError::new(cause))
            }
        };
        Self::reply(
            source,
            RSerPoolMessage::new(MessageBody::HandleResolutionResponse { handle, outcome }),
        )
    }

    // ── ENRP ─────────────────────────────────────────────────────────────────

    fn presence_received(
        &mut self,
        sender: RegistrarIdentifier,
        flags: u8,
        checksum: u16,
        server: ServerInformation,
        source: SocketAddr,
        now: u64,
    ) -> Vec<Outgoing> {
        let transport = reachable_transport(&server.transport, source);
        let handle = match self
            .peers
            .register(sender, PLNF_DYNAMIC, &transport, now, Some(&self.handlespace))
        {
            Ok(handle) => handle,
            Err(cause) => {
                tracing::warn!(peer = format_args!("${sender:08x}"), %cause, "presence rejected");
                return Vec::new();
            }
        };
        self.peers
            .activate_timer(handle, PLNT_MAX_TIME_LAST_HEARD, now + self.timeouts.max_time_last_heard);

        let mut out = Vec::new();
        let mut is_new = false;
        let mut stale = false;
        if let Some(node) = self.peers.get_mut(handle) {
            is_new = node.is_new();
            node.flags &= !PLNF_NEW;
            node.takeover_registrar = UNDEFINED_REGISTRAR_IDENTIFIER;
            if node.takeover.take().is_some() {
                tracing::info!(peer = format_args!("${sender:08x}"), "peer is alive, takeover cancelled");
            }
            stale = node.ownership_checksum() != checksum && node.status & PLNS_HTSYNC == 0;
            if stale {
                node.status |= PLNS_HTSYNC;
            }
        }

        if is_new || flags & EHF_PRESENCE_REPLY_REQUIRED != 0 {
            out.push(Outgoing {
                destination: source,
                message: self.presence(sender, 0),
            });
        }
        if stale {
            tracing::debug!(peer = format_args!("${sender:08x}"), checksum = format_args!("${checksum:04x}"), "ownership checksum differs, requesting handle table");
            out.push(Outgoing {
                destination: source,
                message: self.handle_table_request(sender),
            });
        }
        out
    }

    fn handle_table_request(&self, receiver: RegistrarIdentifier) -> RSerPoolMessage {
        RSerPoolMessage::new(MessageBody::HandleTableRequest {
            sender: self.identifier,
            receiver,
        })
        .with_flags(EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY)
    }

    fn list_request(&self, sender: RegistrarIdentifier, source: SocketAddr) -> Vec<Outgoing> {
        let servers = self
            .peers
            .iter()
            .filter(|(_, node)| node.has_identifier() && node.identifier() != sender)
            .map(|(_, node)| ServerInformation {
                server_id: node.identifier(),
                transport: node.address_block().clone(),
            })
            .collect();
        Self::reply(
            source,
            RSerPoolMessage::new(MessageBody::ListResponse {
                sender: self.identifier,
                receiver: sender,
                servers,
            }),
        )
    }

    fn list_response(&mut self, flags: u8, servers: Vec<ServerInformation>, now: u64) -> Vec<Outgoing> {
        if flags & EHF_LIST_RESPONSE_REJECT != 0 {
            tracing::debug!("peer list request rejected");
            return Vec::new();
        }
        let mut out = Vec::new();
        for server in servers.iter().filter(|server| server.server_id != self.identifier) {
            let registered = self.peers.register(
                server.server_id,
                PLNF_DYNAMIC | PLNF_FROM_PEER,
                &server.transport,
                now,
                Some(&self.handlespace),
            );
            let handle = match registered {
                Ok(handle) => handle,
                Err(cause) => {
                    tracing::debug!(peer = format_args!("${:08x}", server.server_id), %cause, "listed peer not added");
                    continue;
                }
            };
            if self.peers.get(handle).is_some_and(|node| node.is_new() && node.timer().is_none()) {
                self.peers
                    .activate_timer(handle, PLNT_MAX_TIME_LAST_HEARD, now + self.timeouts.max_time_last_heard);
                if let Some(destination) = self.peer_destination(handle) {
                    out.push(Outgoing {
                        destination,
                        message: self.presence(server.server_id, EHF_PRESENCE_REPLY_REQUIRED),
                    });
                }
            }
        }
        out
    }

    fn handle_table_request_received(
        &mut self,
        sender: RegistrarIdentifier,
        flags: u8,
        source: SocketAddr,
    ) -> Vec<Outgoing> {
        let reject = || {
            Self::reply(
                source,
                RSerPoolMessage::new(MessageBody::HandleTableResponse {
                    sender: self.identifier,
                    receiver: sender,
                    pools: Vec::new(),
                })
                .with_flags(EHF_HANDLE_TABLE_RESPONSE_REJECT),
            )
        };
        let Some(peer) = self.peers.find(sender, None) else {
            tracing::debug!(peer = format_args!("${sender:08x}"), "handle table request from unknown peer");
            return reject();
        };

        let owner = (flags & EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY != 0).then_some(self.identifier);
        let cursor = self
            .peers
            .get(peer)
            .and_then(|node| node.user_data.as_ref())
            .and_then(|state| state.handle_table_cursor.clone());
        let max = self.timeouts.max_elements_per_handle_table_request;

        let table = self.handlespace.handle_table(
            owner,
            cursor.as_ref().map(|(handle, identifier)| (handle, *identifier)),
            max + 1,
        );
        let more = table.len() > max;
        let mut pools: Vec<HandleTableEntry> = Vec::new();
        let mut last = None;
        for (handle, node) in table.into_iter().take(max) {
            match pools.last_mut() {
                Some(entry) if entry.handle == *handle => entry.elements.push(node.element.clone()),
                _ => pools.push(HandleTableEntry {
                    handle: handle.clone(),
                    elements: vec![node.element.clone()],
                }),
            }
            last = Some((handle.clone(), node.identifier()));
        }

        if let Some(node) = self.peers.get_mut(peer) {
            node.user_data.get_or_insert_with(PeerSyncState::default).handle_table_cursor =
                if more { last } else { None };
        }
        let flags = if more { EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND } else { 0 };
        Self::reply(
            source,
            RSerPoolMessage::new(MessageBody::HandleTableResponse {
                sender: self.identifier,
                receiver: sender,
                pools,
            })
            .with_flags(flags),
        )
    }

    fn handle_table_response(
        &mut self,
        sender: RegistrarIdentifier,
        flags: u8,
        pools: Vec<HandleTableEntry>,
        source: SocketAddr,
        now: u64,
    ) -> Vec<Outgoing> {
        if flags & EHF_HANDLE_TABLE_RESPONSE_REJECT != 0 {
            tracing::debug!(peer = format_args!("${sender:08x}"), "handle table request rejected");
            return Vec::new();
        }
        let mut added = 0usize;
        for entry in pools {
            for element in entry.elements {
                if self.store_peer_element(&entry.handle, element, now) {
                    added += 1;
                }
            }
        }
        tracing::debug!(peer = format_args!("${sender:08x}"), elements = added, "handle table received");

        if flags & EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND != 0 {
            return Self::reply(source, self.handle_table_request(sender));
        }
        if let Some(node) = self.peers.find(sender, None).and_then(|peer| self.peers.get_mut(peer)) {
            node.status &= !PLNS_HTSYNC;
        }
        Vec::new()
    }

    /// Store an element learned from a peer. Returns whether it was accepted.
    fn store_peer_element(&mut self, handle: &PoolHandle, element: PoolElement, now: u64) -> bool {
        let identifier = element.identifier;
        let result = self
            .handlespace
            .register_pool_element(handle, element, now, &mut self.peers)
            .and_then(|_| self.handlespace.restart_pool_element_expiry(handle, identifier));
        if let Err(cause) = result {
            tracing::warn!(%handle, identifier = format_args!("#{identifier:08x}"), %cause, "peer pool element rejected");
            return false;
        }
        true
    }

    fn handle_update_received(
        &mut self,
        sender: RegistrarIdentifier,
        action: HandleUpdateAction,
        handle: PoolHandle,
        element: PoolElement,
        now: u64,
    ) -> Vec<Outgoing> {
        match action {
            HandleUpdateAction::AddPoolElement => {
                self.store_peer_element(&handle, element, now);
            }
            HandleUpdateAction::DeletePoolElement => {
                let identifier = element.identifier;
                if self
                    .handlespace
                    .deregister_pool_element(&handle, identifier, &mut self.peers)
                    .is_err()
                {
                    tracing::debug!(
                        peer = format_args!("${sender:08x}"),
                        %handle,
                        identifier = format_args!("#{identifier:08x}"),
                        "deleted pool element was not known"
                    );
                }
            }
        }
        Vec::new()
    }

    // ── Takeover ─────────────────────────────────────────────────────────────

    fn init_takeover(&mut self, sender: RegistrarIdentifier, target: RegistrarIdentifier, source: SocketAddr) -> Vec<Outgoing> {
        if target == self.identifier {
            tracing::warn!(peer = format_args!("${sender:08x}"), "peer tries to take us over");
            return Self::reply(source, self.presence(sender, EHF_PRESENCE_REPLY_REQUIRED));
        }

        // Competing takeovers of one target: the higher identifier wins.
        let competing = self
            .peers
            .find(target, None)
            .and_then(|handle| self.peers.get_mut(handle))
            .filter(|node| node.takeover.is_some());
        if let Some(node) = competing {
            if self.identifier > sender {
                tracing::debug!(
                    peer = format_args!("${sender:08x}"),
                    target = format_args!("${target:08x}"),
                    "ignoring competing takeover"
                );
                return Vec::new();
            }
            tracing::info!(target = format_args!("${target:08x}"), "abandoning takeover to higher peer");
            node.takeover = None;
        }
        if let Some(node) = self.peers.find(target, None).and_then(|handle| self.peers.get_mut(handle)) {
            node.takeover_registrar = sender;
        }

        tracing::info!(
            peer = format_args!("${sender:08x}"),
            target = format_args!("${target:08x}"),
            "acknowledging takeover"
        );
        Self::reply(
            source,
            RSerPoolMessage::new(MessageBody::InitTakeoverAck {
                sender: self.identifier,
                receiver: sender,
                target,
            }),
        )
    }

    fn init_takeover_ack(&mut self, sender: RegistrarIdentifier, target: RegistrarIdentifier) -> Vec<Outgoing> {
        let Some(handle) = self.peers.find(target, None) else {
            return Vec::new();
        };
        let complete = match self.peers.get_mut(handle).and_then(|node| node.takeover.as_mut()) {
            Some(takeover) => {
                let outstanding = takeover.acknowledge(sender);
                tracing::debug!(target = format_args!("${target:08x}"), outstanding, "takeover acknowledged");
                outstanding == 0
            }
            None => false,
        };
        if complete {
            self.finish_takeover(handle)
        } else {
            Vec::new()
        }
    }

    fn takeover_server(&mut self, sender: RegistrarIdentifier, target: RegistrarIdentifier) -> Vec<Outgoing> {
        if target == self.identifier {
            tracing::warn!(peer = format_args!("${sender:08x}"), "peer has taken over our pool elements");
            return Vec::new();
        }
        let moved = self.rehome(target, sender);
        tracing::info!(
            peer = format_args!("${sender:08x}"),
            target = format_args!("${target:08x}"),
            elements = moved,
            "registrar taken over by peer"
        );
        if let Some(handle) = self.peers.find(target, None) {
            let _ = self.peers.deregister_by_handle(handle);
        }
        Vec::new()
    }

    fn rehome(&mut self, from: RegistrarIdentifier, to: RegistrarIdentifier) -> usize {
        let owned = self.handlespace.owned_by(from);
        for (handle, identifier) in &owned {
            // Just listed, so present.
            let _ = self
                .handlespace
                .update_ownership(handle, *identifier, to, &mut self.peers);
        }
        owned.len()
    }

    /// Ask every other peer to agree to taking over `handle`'s registrar.
    fn begin_takeover(&mut self, handle: PeerHandle, now: u64) -> Vec<Outgoing> {
        let Some(node) = self.peers.get(handle) else {
            return Vec::new();
        };
        if !node.has_identifier() {
            self.peers
                .activate_timer(handle, PLNT_MAX_TIME_LAST_HEARD, now + self.timeouts.max_time_last_heard);
            return Vec::new();
        }
        let target = node.identifier();
        if node.takeover_registrar != UNDEFINED_REGISTRAR_IDENTIFIER {
            tracing::info!(
                target = format_args!("${target:08x}"),
                by = format_args!("${:08x}", node.takeover_registrar),
                "dead peer already being taken over, removing it"
            );
            let _ = self.peers.deregister_by_handle(handle);
            return Vec::new();
        }
        if self.handlespace.owned_by(target).is_empty() {
            tracing::info!(target = format_args!("${target:08x}"), "dead peer owns no pool elements, removing it");
            let _ = self.peers.deregister_by_handle(handle);
            return Vec::new();
        }
        let takeover = match TakeoverProcess::new(target, self.peers.peers()) {
            Ok(takeover) => takeover,
            Err(cause) => {
                tracing::warn!(target = format_args!("${target:08x}"), %cause, "cannot take over peer");
                let _ = self.peers.deregister_by_handle(handle);
                return Vec::new();
            }
        };
        if takeover.is_complete() {
            return self.finish_takeover(handle);
        }

        tracing::info!(
            target = format_args!("${target:08x}"),
            peers = takeover.outstanding().len(),
            "starting takeover"
        );
        let out = takeover
            .outstanding()
            .iter()
            .filter_map(|peer| {
                let destination = self.peer_destination(self.peers.find(*peer, None)?)?;
                Some(Outgoing {
                    destination,
                    message: RSerPoolMessage::new(MessageBody::InitTakeover {
                        sender: self.identifier,
                        receiver: *peer,
                        target,
                    }),
                })
            })
            .collect();
        if let Some(node) = self.peers.get_mut(handle) {
            node.takeover = Some(takeover);
        }
        self.peers
            .activate_timer(handle, PLNT_TAKEOVER_EXPIRY, now + self.timeouts.takeover_expiry);
        out
    }

    /// Adopt the target's pool elements and tell everyone.
    fn finish_takeover(&mut self, handle: PeerHandle) -> Vec<Outgoing> {
        let Some(target) = self.peers.get(handle).map(|node| node.identifier()) else {
            return Vec::new();
        };
        let moved = self.rehome(target, self.identifier);
        tracing::info!(target = format_args!("${target:08x}"), elements = moved, "takeover complete");
        let out = self.to_identified_peers(target, |receiver| MessageBody::TakeoverServer {
            sender: self.identifier,
            receiver,
            target,
        });
        let _ = self.peers.deregister_by_handle(handle);
        out
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Run every timer due at `now`.
    pub fn handle_timers(&mut self, now: u64) -> Vec<Outgoing> {
        let purged = self.handlespace.purge_expired_pool_elements(now, &mut self.peers);
        if purged > 0 {
            tracing::debug!(purged, "pool element registrations expired");
        }

        let mut out = Vec::new();
        for (handle, code) in self.peers.expired_timers(now) {
            match code {
                PLNT_MAX_TIME_LAST_HEARD => {
                    let Some(receiver) = self.peers.get(handle).map(|node| node.identifier()) else {
                        continue;
                    };
                    tracing::debug!(peer = format_args!("${receiver:08x}"), "peer silent, probing");
                    if let Some(destination) = self.peer_destination(handle) {
                        out.push(Outgoing {
                            destination,
                            message: self.presence(receiver, EHF_PRESENCE_REPLY_REQUIRED),
                        });
                    }
                    self.peers
                        .activate_timer(handle, PLNT_MAX_TIME_NO_RESPONSE, now + self.timeouts.max_time_no_response);
                }
                PLNT_MAX_TIME_NO_RESPONSE => out.extend(self.begin_takeover(handle, now)),
                PLNT_TAKEOVER_EXPIRY => {
                    if let Some(node) = self.peers.get_mut(handle) {
                        tracing::warn!(
                            target = format_args!("${:08x}", node.identifier()),
                            missing = node.takeover.as_ref().map_or(0, |t| t.outstanding().len()),
                            "takeover timed out"
                        );
                        node.takeover = None;
                    }
                    let _ = self.peers.deregister_by_handle(handle);
                }
                _ => self.peers.deactivate_timer(handle),
            }
        }
        out
    }

    /// Presence to every peer, identified or not.
    pub fn announce(&self) -> Vec<Outgoing> {
        self.peers
            .iter()
            .filter_map(|(handle, node)| {
                Some(Outgoing {
                    destination: self.peer_destination(handle)?,
                    message: self.presence(node.identifier(), 0),
                })
            })
            .collect()
    }
}

impl fmt::Display for RegistrarState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Registrar ${:08x} at {}", self.identifier, self.transport)?;
        write!(f, "{}{}", self.handlespace, self.peers)
    }
}

/// The peer's announced transport, with unspecified addresses replaced by
/// the datagram source.
fn reachable_transport(announced: &TransportAddressBlock, source: SocketAddr) -> TransportAddressBlock {
    if announced.addresses().iter().any(|address: &IpAddr| !address.is_unspecified()) {
        return announced.clone();
    }
    TransportAddressBlock::from_socket_addr(
        announced.protocol(),
        SocketAddr::new(source.ip(), announced.port()),
        announced.flags(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rserpool_core::{PolicyType, PoolPolicySettings};

    const OWN: RegistrarIdentifier = 0x10;

    fn addr(text: &str) -> SocketAddr {
        text.parse().unwrap()
    }

    fn udp(text: &str) -> TransportAddressBlock {
        TransportAddressBlock::from_socket_addr(TransportProtocol::Udp, addr(text), 0)
    }

    fn registrar() -> RegistrarState {
        RegistrarState::new(OWN, udp("10.0.0.1:3864"), &EnrpConfig::default())
    }

    fn presence_from(sender: RegistrarIdentifier, port: u16, checksum: u16, flags: u8) -> RSerPoolMessage {
        RSerPoolMessage::new(MessageBody::Presence {
            sender,
            receiver: OWN,
            checksum,
            server: ServerInformation {
                server_id: sender,
                transport: udp(&format!("10.0.0.2:{port}")),
            },
        })
        .with_flags(flags)
    }

    fn element(identifier: u32) -> PoolElement {
        PoolElement {
            identifier,
            home_registrar: 0,
            registration_life: 30_000,
            policy: PoolPolicySettings::new(PolicyType::RoundRobin),
            user_transport: udp("10.0.1.1:7"),
            registrator_transport: None,
        }
    }

    fn registration(identifier: u32) -> RSerPoolMessage {
        RSerPoolMessage::new(MessageBody::Registration {
            handle: PoolHandle::try_from("EchoPool").unwrap(),
            element: element(identifier),
            error: None,
        })
    }

    fn peer_element(identifier: u32, home: RegistrarIdentifier) -> PoolElement {
        PoolElement {
            home_registrar: home,
            registrator_transport: Some(udp("10.0.1.9:3863")),
            ..element(identifier)
        }
    }

    fn peer_update(home: RegistrarIdentifier, identifier: u32) -> RSerPoolMessage {
        RSerPoolMessage::new(MessageBody::HandleUpdate {
            sender: home,
            receiver: OWN,
            action: HandleUpdateAction::AddPoolElement,
            handle: PoolHandle::try_from("EchoPool").unwrap(),
            element: peer_element(identifier, home),
        })
    }

    #[test]
    fn new_peer_gets_presence_reply() {
        let mut registrar = registrar();
        let empty = rserpool_core::ChecksumAccumulator::INITIAL.finish();
        let out = registrar.handle_message(presence_from(0x20, 3864, empty, 0), addr("10.0.0.2:3864"), 0);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message.body, MessageBody::Presence { receiver: 0x20, .. }));
        assert_eq!(registrar.peers().len(), 1);

        // Known peer, matching checksum, no reply wanted.
        let out = registrar.handle_message(presence_from(0x20, 3864, empty, 0), addr("10.0.0.2:3864"), 10);
        assert!(out.is_empty());

        let out = registrar.handle_message(
            presence_from(0x20, 3864, empty, EHF_PRESENCE_REPLY_REQUIRED),
            addr("10.0.0.2:3864"),
            20,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn checksum_mismatch_requests_handle_table() {
        let mut registrar = registrar();
        let out = registrar.handle_message(presence_from(0x20, 3864, 0x1234, 0), addr("10.0.0.2:3864"), 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].message.flags, EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY);
        assert!(matches!(out[1].message.body, MessageBody::HandleTableRequest { receiver: 0x20, .. }));

        // One request at a time.
        let out = registrar.handle_message(presence_from(0x20, 3864, 0x1234, 0), addr("10.0.0.2:3864"), 5);
        assert!(out.is_empty());
    }

    #[test]
    fn registration_is_answered_and_propagated() {
        let mut registrar = registrar();
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);

        let out = registrar.handle_message(registration(7), addr("10.0.1.1:9000"), 100);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].destination, addr("10.0.1.1:9000"));
        assert!(matches!(
            out[0].message.body,
            MessageBody::RegistrationResponse { identifier: 7, error: None, .. }
        ));
        match &out[1].message.body {
            MessageBody::HandleUpdate { action, element, receiver, .. } => {
                assert_eq!(*action, HandleUpdateAction::AddPoolElement);
                assert_eq!(*receiver, 0x20);
                assert_eq!(element.home_registrar, OWN);
                assert_eq!(element.registrator_transport, Some(udp("10.0.1.1:9000")));
            }
            other => panic!("unexpected {other:?}"),
        }
        // The peer's last-heard timer comes before the registration life.
        assert_eq!(registrar.next_deadline(), Some(millis(5_000)));

        let resolution = RSerPoolMessage::new(MessageBody::HandleResolution {
            handle: PoolHandle::try_from("EchoPool").unwrap(),
            items: None,
        });
        let out = registrar.handle_message(resolution, addr("10.0.2.2:5000"), 200);
        match &out[0].message.body {
            MessageBody::HandleResolutionResponse {
                outcome: ResolutionOutcome::Resolved { elements, .. },
                ..
            } => {
                assert_eq!(elements.len(), 1);
                assert_eq!(elements[0].registrator_transport, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn incompatible_registration_is_rejected() {
        let mut registrar = registrar();
        registrar.handle_message(registration(1), addr("10.0.1.1:9000"), 0);
        let mut least_used = registration(2);
        if let MessageBody::Registration { element, .. } = &mut least_used.body {
            element.policy = PoolPolicySettings::loaded(PolicyType::LeastUsed, 0, 0);
        }
        let out = registrar.handle_message(least_used, addr("10.0.1.2:9000"), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.flags, AHF_REGISTRATION_REJECT);
        match &out[0].message.body {
            MessageBody::RegistrationResponse { error: Some(error), .. } => {
                assert_eq!(error.cause, RspError::IncompatiblePoolPolicy)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn handle_table_is_sent_in_parts() {
        let config = EnrpConfig {
            max_elements_per_handle_table_request: 2,
            ..EnrpConfig::default()
        };
        let mut registrar = RegistrarState::new(OWN, udp("10.0.0.1:3864"), &config);
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);
        for identifier in 1..=3 {
            registrar.handle_message(registration(identifier), addr("10.0.1.1:9000"), 0);
        }
        let request = RSerPoolMessage::new(MessageBody::HandleTableRequest {
            sender: 0x20,
            receiver: OWN,
        })
        .with_flags(EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY);

        let first = registrar.handle_message(request.clone(), addr("10.0.0.2:3864"), 10);
        assert_eq!(first[0].message.flags, EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND);
        let second = registrar.handle_message(request.clone(), addr("10.0.0.2:3864"), 20);
        assert_eq!(second[0].message.flags, 0);

        let identifiers = |out: &[Outgoing]| -> Vec<u32> {
            match &out[0].message.body {
                MessageBody::HandleTableResponse { pools, .. } => {
                    pools.iter().flat_map(|p| p.elements.iter().map(|e| e.identifier)).collect()
                }
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(identifiers(&first), vec![1, 2]);
        assert_eq!(identifiers(&second), vec![3]);

        let unknown = RSerPoolMessage::new(MessageBody::HandleTableRequest {
            sender: 0x99,
            receiver: OWN,
        });
        let out = registrar.handle_message(unknown, addr("10.0.0.9:3864"), 30);
        assert_eq!(out[0].message.flags, EHF_HANDLE_TABLE_RESPONSE_REJECT);
    }

    #[test]
    fn handle_table_response_fills_peer_ownership() {
        let mut registrar = registrar();
        registrar.handle_message(presence_from(0x20, 3864, 0x1234, 0), addr("10.0.0.2:3864"), 0);
        let response = RSerPoolMessage::new(MessageBody::HandleTableResponse {
            sender: 0x20,
            receiver: OWN,
            pools: vec![HandleTableEntry {
                handle: PoolHandle::try_from("EchoPool").unwrap(),
                elements: vec![peer_element(1, 0x20), peer_element(2, 0x20)],
            }],
        });
        assert!(registrar.handle_message(response, addr("10.0.0.2:3864"), 10).is_empty());
        assert_eq!(registrar.handlespace().pool_element_count(), 2);

        let expected = registrar.handlespace().ownership_checksum(0x20);
        assert_eq!(registrar.peers().verify_checksums(registrar.handlespace()), Ok(()));
        let out = registrar.handle_message(
            presence_from(0x20, 3864, expected.finish(), 0),
            addr("10.0.0.2:3864"),
            20,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn handle_update_adds_and_deletes() {
        let mut registrar = registrar();
        let update = |action| {
            RSerPoolMessage::new(MessageBody::HandleUpdate {
                sender: 0x20,
                receiver: OWN,
                action,
                handle: PoolHandle::try_from("EchoPool").unwrap(),
                element: peer_element(5, 0x20),
            })
        };
        registrar.handle_message(update(HandleUpdateAction::AddPoolElement), addr("10.0.0.2:3864"), 0);
        assert_eq!(registrar.handlespace().pool_element_count(), 1);
        registrar.handle_message(update(HandleUpdateAction::DeletePoolElement), addr("10.0.0.2:3864"), 0);
        assert_eq!(registrar.handlespace().pool_element_count(), 0);
    }

    #[test]
    fn silent_peer_is_taken_over() {
        let mut registrar = registrar();
        let timeouts = RegistrarTimeouts::from(&EnrpConfig::default());
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);
        registrar.handle_message(presence_from(0x30, 3865, 0xffff, 0), addr("10.0.0.2:3865"), 0);
        registrar.handle_message(
            RSerPoolMessage::new(MessageBody::HandleUpdate {
                sender: 0x20,
                receiver: OWN,
                action: HandleUpdateAction::AddPoolElement,
                handle: PoolHandle::try_from("EchoPool").unwrap(),
                element: peer_element(5, 0x20),
            }),
            addr("10.0.0.2:3864"),
            0,
        );

        // Both peers go quiet: each is probed.
        let t1 = timeouts.max_time_last_heard;
        let probes = registrar.handle_timers(t1);
        assert_eq!(probes.len(), 2);
        assert!(probes.iter().all(|o| o.message.flags == EHF_PRESENCE_REPLY_REQUIRED));

        // 0x30 answers, 0x20 does not.
        registrar.handle_message(presence_from(0x30, 3865, 0xffff, 0), addr("10.0.0.2:3865"), t1 + 1);
        let t2 = t1 + timeouts.max_time_no_response;
        let out = registrar.handle_timers(t2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, addr("10.0.0.2:3865"));
        assert!(matches!(
            out[0].message.body,
            MessageBody::InitTakeover { receiver: 0x30, target: 0x20, .. }
        ));

        let ack = RSerPoolMessage::new(MessageBody::InitTakeoverAck {
            sender: 0x30,
            receiver: OWN,
            target: 0x20,
        });
        let out = registrar.handle_message(ack, addr("10.0.0.2:3865"), t2 + 1);
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0].message.body,
            MessageBody::TakeoverServer { receiver: 0x30, target: 0x20, .. }
        ));
        assert!(registrar.peers().find(0x20, None).is_none());
        assert_eq!(registrar.handlespace().owned_by(OWN).len(), 1);
    }

    #[test]
    fn takeover_of_ourselves_is_refuted() {
        let mut registrar = registrar();
        let message = RSerPoolMessage::new(MessageBody::InitTakeover {
            sender: 0x20,
            receiver: OWN,
            target: OWN,
        });
        let out = registrar.handle_message(message, addr("10.0.0.2:3864"), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.flags, EHF_PRESENCE_REPLY_REQUIRED);

        let other = RSerPoolMessage::new(MessageBody::InitTakeover {
            sender: 0x20,
            receiver: OWN,
            target: 0x30,
        });
        let out = registrar.handle_message(other, addr("10.0.0.2:3864"), 0);
        assert!(matches!(out[0].message.body, MessageBody::InitTakeoverAck { target: 0x30, .. }));
    }

    #[test]
    fn competing_takeover_goes_to_the_higher_identifier() {
        let mut registrar = registrar();
        let timeouts = RegistrarTimeouts::from(&EnrpConfig::default());
        registrar.handle_message(presence_from(0x08, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);
        registrar.handle_message(presence_from(0x20, 3865, 0xffff, 0), addr("10.0.0.2:3865"), 0);
        registrar.handle_message(presence_from(0x30, 3866, 0xffff, 0), addr("10.0.0.2:3866"), 0);
        registrar.handle_message(peer_update(0x30, 5), addr("10.0.0.2:3866"), 0);

        // Only 0x30 falls silent.
        let t1 = timeouts.max_time_last_heard;
        registrar.handle_timers(t1);
        registrar.handle_message(presence_from(0x08, 3864, 0xffff, 0), addr("10.0.0.2:3864"), t1 + 1);
        registrar.handle_message(presence_from(0x20, 3865, 0xffff, 0), addr("10.0.0.2:3865"), t1 + 1);
        let out = registrar.handle_timers(t1 + timeouts.max_time_no_response);
        assert_eq!(out.len(), 2);
        let target = registrar.peers().find(0x30, None).unwrap();
        assert!(registrar.peers().get(target).unwrap().takeover.is_some());

        let contest = |sender| {
            RSerPoolMessage::new(MessageBody::InitTakeover {
                sender,
                receiver: OWN,
                target: 0x30,
            })
        };
        // A lower peer is ignored while ours runs.
        assert!(registrar.handle_message(contest(0x08), addr("10.0.0.2:3864"), t1 + 2).is_empty());
        assert!(registrar.peers().get(target).unwrap().takeover.is_some());

        // A higher peer wins and is acknowledged.
        let out = registrar.handle_message(contest(0x20), addr("10.0.0.2:3865"), t1 + 3);
        assert!(matches!(out[0].message.body, MessageBody::InitTakeoverAck { receiver: 0x20, target: 0x30, .. }));
        let node = registrar.peers().get(target).unwrap();
        assert!(node.takeover.is_none());
        assert_eq!(node.takeover_registrar, 0x20);
    }

    #[test]
    fn silent_peer_without_elements_is_dropped() {
        let mut registrar = registrar();
        let timeouts = RegistrarTimeouts::from(&EnrpConfig::default());
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);
        registrar.handle_message(presence_from(0x30, 3865, 0xffff, 0), addr("10.0.0.2:3865"), 0);

        let t1 = timeouts.max_time_last_heard;
        registrar.handle_timers(t1);
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), t1 + 1);
        let out = registrar.handle_timers(t1 + timeouts.max_time_no_response);
        assert!(out.is_empty());
        assert!(registrar.peers().find(0x30, None).is_none());
        assert!(registrar.peers().find(0x20, None).is_some());
    }

    #[test]
    fn peer_claimed_by_another_registrar_is_dropped() {
        let mut registrar = registrar();
        let timeouts = RegistrarTimeouts::from(&EnrpConfig::default());
        registrar.handle_message(presence_from(0x30, 3865, 0xffff, 0), addr("10.0.0.2:3865"), 0);
        registrar.handle_message(presence_from(0x40, 3866, 0xffff, 0), addr("10.0.0.2:3866"), 0);
        registrar.handle_message(peer_update(0x30, 5), addr("10.0.0.2:3865"), 0);

        let t1 = timeouts.max_time_last_heard;
        registrar.handle_timers(t1);
        registrar.handle_message(presence_from(0x40, 3866, 0xffff, 0), addr("10.0.0.2:3866"), t1 + 1);
        let claim = RSerPoolMessage::new(MessageBody::InitTakeover {
            sender: 0x40,
            receiver: OWN,
            target: 0x30,
        });
        let out = registrar.handle_message(claim, addr("10.0.0.2:3866"), t1 + 2);
        assert!(matches!(out[0].message.body, MessageBody::InitTakeoverAck { receiver: 0x40, target: 0x30, .. }));

        let out = registrar.handle_timers(t1 + timeouts.max_time_no_response);
        assert!(out.is_empty());
        assert!(registrar.peers().find(0x30, None).is_none());
        // The claimant's TakeoverServer still finds the elements.
        assert_eq!(registrar.handlespace().owned_by(0x30).len(), 1);
    }

    #[test]
    fn takeover_server_rehomes_target_elements() {
        let mut registrar = registrar();
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);
        registrar.handle_message(presence_from(0x30, 3865, 0xffff, 0), addr("10.0.0.2:3865"), 0);
        registrar.handle_message(
            RSerPoolMessage::new(MessageBody::HandleUpdate {
                sender: 0x20,
                receiver: OWN,
                action: HandleUpdateAction::AddPoolElement,
                handle: PoolHandle::try_from("EchoPool").unwrap(),
                element: peer_element(5, 0x20),
            }),
            addr("10.0.0.2:3864"),
            0,
        );
        let message = RSerPoolMessage::new(MessageBody::TakeoverServer {
            sender: 0x30,
            receiver: OWN,
            target: 0x20,
        });
        registrar.handle_message(message, addr("10.0.0.2:3865"), 10);
        assert_eq!(registrar.handlespace().owned_by(0x30).len(), 1);
        assert!(registrar.peers().find(0x20, None).is_none());
        assert_eq!(registrar.peers().verify_checksums(registrar.handlespace()), Ok(()));
    }

    #[test]
    fn static_peer_is_announced_and_resolved() {
        let mut registrar = registrar();
        registrar.add_static_peer(addr("10.0.0.2:3864"), 0).unwrap();
        let out = registrar.announce();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].message.body, MessageBody::Presence { receiver: 0, .. }));

        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 5);
        assert_eq!(registrar.peers().len(), 1);
        assert!(registrar.peers().find(0x20, None).is_some());
    }

    #[test]
    fn list_exchange_introduces_peers() {
        let mut registrar = registrar();
        registrar.handle_message(presence_from(0x20, 3864, 0xffff, 0), addr("10.0.0.2:3864"), 0);
        let request = RSerPoolMessage::new(MessageBody::ListRequest {
            sender: 0x30,
            receiver: OWN,
        });
        let out = registrar.handle_message(request, addr("10.0.0.3:3864"), 0);
        match &out[0].message.body {
            MessageBody::ListResponse { servers, .. } => {
                assert_eq!(servers.len(), 1);
                assert_eq!(servers[0].server_id, 0x20);
            }
            other => panic!("unexpected {other:?}"),
        }

        let response = RSerPoolMessage::new(MessageBody::ListResponse {
            sender: 0x20,
            receiver: OWN,
            servers: vec![
                ServerInformation {
                    server_id: 0x40,
                    transport: udp("10.0.0.4:3864"),
                },
                ServerInformation {
                    server_id: OWN,
                    transport: udp("10.0.0.1:3864"),
                },
            ],
        });
        let out = registrar.handle_message(response, addr("10.0.0.2:3864"), 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, addr("10.0.0.4:3864"));
        assert_eq!(registrar.peers().len(), 2);
    }

    #[test]
    fn unspecified_announced_address_falls_back_to_source() {
        let announced = udp("0.0.0.0:3864");
        let reachable = reachable_transport(&announced, addr("192.168.1.5:40000"));
        assert_eq!(reachable, udp("192.168.1.5:3864"));
        assert_eq!(reachable_transport(&udp("10.0.0.2:3864"), addr("192.168.1.5:1")), udp("10.0.0.2:3864"));
    }
}
