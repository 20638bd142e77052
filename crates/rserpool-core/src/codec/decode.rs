use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use zerocopy::byteorder::network_endian::U32;
use zerocopy::FromBytes;

use crate::buffer::{padding, MessageCursor};
use crate::error::RspError;
use crate::message::{
    HandleTableEntry, MessageBody, OperationError, RSerPoolMessage, ResolutionOutcome,
    ServerInformation,
};
use crate::policy::{decode_policy, PoolPolicySettings};
use crate::pool_element::{PoolElement, RegistrarIdentifier};
use crate::pool_handle::PoolHandle;
use crate::transport::{is_link_local, TransportAddressBlock, TransportProtocol, TABF_CONTROLCHANNEL};
use crate::wire::{
    ErrorCauseHeader, HandleUpdateAction, HandleUpdateFields, MessageHeader, MessageType,
    ParameterType, PoolElementFields, Protocol, ServerFields, ServerInfoFields, TargetFields,
    TlvAction, TlvHeader, TransportFields, EHF_HANDLE_TABLE_RESPONSE_REJECT,
    EHF_LIST_RESPONSE_REJECT, HEADER_SIZE, MAX_HANDLE_RESOLUTION_ITEMS,
    UNDEFINED_REGISTRAR_IDENTIFIER, UTP_DATA_PLUS_CONTROL,
};

const TRANSPORTS: [ParameterType; 3] = [
    ParameterType::SctpTransport,
    ParameterType::TcpTransport,
    ParameterType::UdpTransport,
];

const ADDRESSES: [ParameterType; 2] = [ParameterType::Ipv4Address, ParameterType::Ipv6Address];

/// Why a datagram was rejected, with snapshots of what was being parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode message at byte {position}: {error}")]
pub struct DecodeFailure {
    pub error: RspError,
    /// `None` when the PPID was not ASAP or ENRP.
    pub protocol: Option<Protocol>,
    pub message_type: Option<MessageType>,
    /// Cursor position when parsing stopped.
    pub position: usize,
    /// The message as declared by its header, or the whole datagram.
    pub offending_message: Bytes,
    /// The innermost parameter being parsed, if any.
    pub offending_parameter: Option<Bytes>,
    /// Sender of an ENRP message, once its server parameter was read.
    pub peer: Option<RegistrarIdentifier>,
}

impl DecodeFailure {
    /// The Error message to answer the sender with, if the failure is to be
    /// reported at all.
    pub fn error_reply(&self, own_identifier: RegistrarIdentifier) -> Option<RSerPoolMessage> {
        if self.error == RspError::UnrecognizedParameterSilent {
            return None;
        }
        let data = self
            .offending_parameter
            .clone()
            .unwrap_or_else(|| self.offending_message.clone());
        let error = OperationError::with_data(self.error, data);
        let body = match self.protocol? {
            Protocol::Asap => MessageBody::AsapError { error },
            Protocol::Enrp => MessageBody::EnrpError {
                sender: own_identifier,
                receiver: self.peer.unwrap_or(UNDEFINED_REGISTRAR_IDENTIFIER),
                error,
            },
        };
        Some(RSerPoolMessage::new(body))
    }
}

/// Decode one datagram received with `ppid`.
///
/// `source` is the address the datagram came from; a Server Announce without
/// transport parameters is attributed to it.
pub fn decode(data: &[u8], ppid: u32, source: Option<SocketAddr>) -> Result<RSerPoolMessage, DecodeFailure> {
    let protocol = Protocol::from_ppid(ppid).map_err(|error| DecodeFailure {
        error,
        protocol: None,
        message_type: None,
        position: 0,
        offending_message: Bytes::copy_from_slice(data),
        offending_parameter: None,
        peer: None,
    })?;
    let mut decoder = Decoder {
        cursor: MessageCursor::new(data),
        protocol,
        source,
        message_type: None,
        message_length: None,
        peer: None,
        open_tlvs: Vec::new(),
        unrecognized: Vec::new(),
    };
    decoder.message().map_err(|error| decoder.failure(error))
}

/// A parameter located by [`Decoder::find_tlv`]. The cursor sits at its payload.
#[derive(Debug, Clone, Copy)]
struct Tlv {
    start: usize,
    parameter: ParameterType,
    /// End of the payload, excluding padding.
    end: usize,
}

impl Tlv {
    fn padded_end(&self) -> usize {
        self.end + padding(self.end - self.start, 4)
    }
}

struct Decoder<'a> {
    cursor: MessageCursor<'a>,
    protocol: Protocol,
    source: Option<SocketAddr>,
    message_type: Option<MessageType>,
    message_length: Option<usize>,
    peer: Option<RegistrarIdentifier>,
    /// Start offsets of the parameters currently being parsed, innermost last.
    open_tlvs: Vec<usize>,
    unrecognized: Vec<Bytes>,
}

impl<'a> Decoder<'a> {
    fn message(&mut self) -> Result<RSerPoolMessage, RspError> {
        let header: MessageHeader = self.cursor.read().ok_or(RspError::InvalidValue)?;
        let message_type = MessageType::from_wire(self.protocol, header.msg_type)?;
        self.message_type = Some(message_type);

        let length = usize::from(header.length.get());
        if length < HEADER_SIZE || length > self.cursor.size() {
            return Err(RspError::InvalidValue);
        }
        self.message_length = Some(length);
        let limit = length + padding(length, 4);
        if limit > self.cursor.size() {
            return Err(RspError::InvalidValue);
        }

        let body = self.body(message_type, header.flags, limit)?;

        // Whatever follows must be skippable by its action bits.
        self.find_tlv(&[], limit)?;
        if self.cursor.position() != limit {
            return Err(RspError::InvalidValue);
        }
        Ok(RSerPoolMessage {
            flags: header.flags,
            body,
            unrecognized_parameters: std::mem::take(&mut self.unrecognized),
        })
    }

    fn body(&mut self, message_type: MessageType, flags: u8, limit: usize) -> Result<MessageBody, RspError> {
        let body = match message_type {
            MessageType::Registration => {
                let handle = self.pool_handle(limit)?;
                let tlv = self.expect(ParameterType::PoolElement, limit)?;
                let element = self.pool_element(tlv)?;
                if element.registrator_transport.is_some() {
                    return Err(RspError::InvalidRegistrator);
                }
                let error = self.optional_error(limit)?;
                MessageBody::Registration {
                    handle,
                    element,
                    error,
                }
            }
            MessageType::Deregistration => MessageBody::Deregistration {
                handle: self.pool_handle(limit)?,
                identifier: self.pool_element_identifier(limit)?,
            },
            MessageType::RegistrationResponse => MessageBody::RegistrationResponse {
                handle: self.pool_handle(limit)?,
                identifier: self.pool_element_identifier(limit)?,
                error: self.optional_error(limit)?,
            },
            MessageType::DeregistrationResponse => MessageBody::DeregistrationResponse {
                handle: self.pool_handle(limit)?,
                identifier: self.pool_element_identifier(limit)?,
                error: self.optional_error(limit)?,
            },
            MessageType::HandleResolution => {
                let handle = self.pool_handle(limit)?;
                let items = match self.find_tlv(&[ParameterType::HandleResolution], limit)? {
                    Some(tlv) => {
                        let payload = self.payload(&tlv);
                        let items = payload
                            .get(..4)
                            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                            .ok_or(RspError::InvalidValue)?;
                        self.finish_tlv(&tlv)?;
                        Some(items)
                    }
                    None => None,
                };
                MessageBody::HandleResolution { handle, items }
            }
            MessageType::HandleResolutionResponse => {
                let handle = self.pool_handle(limit)?;
                let tlv = self
                    .find_tlv(&[ParameterType::OperationError, ParameterType::PoolPolicy], limit)?
                    .ok_or(RspError::InvalidValue)?;
                let outcome = if tlv.parameter == ParameterType::OperationError {
                    let error = self.operation_error(tlv)?.ok_or(RspError::InvalidValue)?;
                    ResolutionOutcome::Failed(error)
                } else {
                    let policy = self.policy_from(tlv)?;
                    let elements = self.pool_elements(limit)?;
                    if elements.len() > MAX_HANDLE_RESOLUTION_ITEMS {
                        return Err(RspError::InvalidValue);
                    }
                    ResolutionOutcome::Resolved { policy, elements }
                };
                MessageBody::HandleResolutionResponse { handle, outcome }
            }
            MessageType::EndpointKeepAlive => {
                let registrar = self.fixed::<U32>(limit)?.get();
                let handle = self.pool_handle(limit)?;
                let identifier = match self.find_tlv(&[ParameterType::PoolElementIdentifier], limit)? {
                    Some(tlv) => Some(self.identifier_from(tlv)?),
                    None => None,
                };
                MessageBody::EndpointKeepAlive {
                    registrar,
                    handle,
                    identifier,
                }
            }
            MessageType::EndpointKeepAliveAck => MessageBody::EndpointKeepAliveAck {
                handle: self.pool_handle(limit)?,
                identifier: self.pool_element_identifier(limit)?,
            },
            MessageType::EndpointUnreachable => MessageBody::EndpointUnreachable {
                handle: self.pool_handle(limit)?,
                identifier: self.pool_element_identifier(limit)?,
            },
            MessageType::ServerAnnounce => {
                let registrar = self.fixed::<U32>(limit)?.get();
                let mut transports = Vec::new();
                while let Some(transport) = self.transport(limit)? {
                    transports.push(transport);
                }
                if transports.is_empty() {
                    if let Some(source) = self.source {
                        transports.push(TransportAddressBlock::from_socket_addr(
                            TransportProtocol::Sctp,
                            source,
                            0,
                        ));
                    }
                }
                MessageBody::ServerAnnounce {
                    registrar,
                    transports,
                }
            }
            MessageType::Cookie => MessageBody::Cookie {
                cookie: self.cookie(limit)?,
            },
            MessageType::CookieEcho => MessageBody::CookieEcho {
                cookie: self.cookie(limit)?,
            },
            MessageType::BusinessCard => {
                let handle = self.pool_handle(limit)?;
                let policy = self.policy(limit)?;
                let elements = self.pool_elements(limit)?;
                if elements.is_empty() || elements.len() >= MAX_HANDLE_RESOLUTION_ITEMS {
                    return Err(RspError::InvalidValue);
                }
                MessageBody::BusinessCard {
                    handle,
                    policy,
                    elements,
                }
            }
            MessageType::AsapError => MessageBody::AsapError {
                error: self.required_error(limit)?,
            },

            MessageType::Presence => {
                let (sender, receiver) = self.server_fields(limit)?;
                let checksum = self.checksum(limit)?;
                let tlv = self.expect(ParameterType::ServerInformation, limit)?;
                let server = self.server_information(tlv)?;
                MessageBody::Presence {
                    sender,
                    receiver,
                    checksum,
                    server,
                }
            }
            MessageType::HandleTableRequest => {
                let (sender, receiver) = self.server_fields(limit)?;
                MessageBody::HandleTableRequest { sender, receiver }
            }
            MessageType::HandleTableResponse => {
                let (sender, receiver) = self.server_fields(limit)?;
                let pools = if flags & EHF_HANDLE_TABLE_RESPONSE_REJECT != 0 {
                    Vec::new()
                } else {
                    self.handle_table(limit)?
                };
                MessageBody::HandleTableResponse {
                    sender,
                    receiver,
                    pools,
                }
            }
            MessageType::HandleUpdate => {
                let fields: HandleUpdateFields = self.fixed(limit)?;
                self.peer = Some(fields.sender_id.get());
                let action = HandleUpdateAction::try_from(fields.update_action.get())?;
                let handle = self.pool_handle(limit)?;
                let tlv = self.expect(ParameterType::PoolElement, limit)?;
                let element = self.pool_element(tlv)?;
                if element.registrator_transport.is_none() {
                    return Err(RspError::InvalidRegistrator);
                }
                MessageBody::HandleUpdate {
                    sender: fields.sender_id.get(),
                    receiver: fields.receiver_id.get(),
                    action,
                    handle,
                    element,
                }
            }
            MessageType::ListRequest => {
                let (sender, receiver) = self.server_fields(limit)?;
                MessageBody::ListRequest { sender, receiver }
            }
            MessageType::ListResponse => {
                let (sender, receiver) = self.server_fields(limit)?;
                let mut servers = Vec::new();
                if flags & EHF_LIST_RESPONSE_REJECT == 0 {
                    while let Some(tlv) = self.find_tlv(&[ParameterType::ServerInformation], limit)? {
                        servers.push(self.server_information(tlv)?);
                    }
                }
                MessageBody::ListResponse {
                    sender,
                    receiver,
                    servers,
                }
            }
            MessageType::InitTakeover => {
                let (sender, receiver, target) = self.target_fields(limit)?;
                MessageBody::InitTakeover {
                    sender,
                    receiver,
                    target,
                }
            }
            MessageType::InitTakeoverAck => {
                let (sender, receiver, target) = self.target_fields(limit)?;
                MessageBody::InitTakeoverAck {
                    sender,
                    receiver,
                    target,
                }
            }
            MessageType::TakeoverServer => {
                let (sender, receiver, target) = self.target_fields(limit)?;
                MessageBody::TakeoverServer {
                    sender,
                    receiver,
                    target,
                }
            }
            MessageType::EnrpError => {
                let (sender, receiver) = self.server_fields(limit)?;
                MessageBody::EnrpError {
                    sender,
                    receiver,
                    error: self.required_error(limit)?,
                }
            }
        };
        Ok(body)
    }

    // ── TLV framing ──────────────────────────────────────────────────────────

    /// Read a fixed-size field that must end before `limit`.
    fn fixed<T: FromBytes>(&mut self, limit: usize) -> Result<T, RspError> {
        if self.cursor.position() + size_of::<T>() > limit {
            return Err(RspError::InvalidValue);
        }
        self.cursor.read().ok_or(RspError::InvalidValue)
    }

    /// Advance to the next parameter of one of the `wanted` types before
    /// `limit`, applying the action bits of every other parameter on the way.
    fn find_tlv(&mut self, wanted: &[ParameterType], limit: usize) -> Result<Option<Tlv>, RspError> {
        while self.cursor.position() < limit {
            let start = self.cursor.position();
            self.open_tlvs.push(start);
            let header: TlvHeader = self.fixed(limit)?;
            let tlv_type = header.tlv_type.get();
            let length = usize::from(header.length.get());
            if length < HEADER_SIZE || start + length > limit {
                return Err(RspError::InvalidValue);
            }
            if let Some(parameter) = ParameterType::from_code(tlv_type).filter(|p| wanted.contains(p)) {
                return Ok(Some(Tlv {
                    start,
                    parameter,
                    end: start + length,
                }));
            }
            self.unexpected_tlv(start, tlv_type, length)?;
        }
        Ok(None)
    }

    fn unexpected_tlv(&mut self, start: usize, tlv_type: u16, length: usize) -> Result<(), RspError> {
        let action = TlvAction::of(tlv_type);
        match action {
            TlvAction::Stop | TlvAction::StopAndReport => {
                self.cursor.seek(start);
                tracing::debug!(
                    tlv_type = format_args!("{tlv_type:#06x}"),
                    position = start,
                    "stopping at unrecognized parameter"
                );
                Err(if action == TlvAction::Stop {
                    RspError::UnrecognizedParameterSilent
                } else {
                    RspError::UnrecognizedParameter
                })
            }
            TlvAction::Continue | TlvAction::ContinueAndReport => {
                let end = start + length + padding(length, 4);
                if end > self.cursor.size() {
                    return Err(RspError::InvalidValue);
                }
                if action == TlvAction::ContinueAndReport {
                    let parameter = self.cursor.slice(start, start + length);
                    self.unrecognized.push(Bytes::copy_from_slice(parameter));
                }
                tracing::debug!(
                    tlv_type = format_args!("{tlv_type:#06x}"),
                    position = start,
                    "skipping unrecognized parameter"
                );
                self.cursor.seek(end);
                self.open_tlvs.pop();
                Ok(())
            }
        }
    }

    fn expect(&mut self, parameter: ParameterType, limit: usize) -> Result<Tlv, RspError> {
        self.find_tlv(&[parameter], limit)?.ok_or(RspError::InvalidValue)
    }

    /// Step back in front of a parameter found one level too early.
    fn unread(&mut self, tlv: &Tlv) {
        self.cursor.seek(tlv.start);
        self.open_tlvs.pop();
    }

    /// The rest of the parameter's payload.
    fn payload(&mut self, tlv: &Tlv) -> &'a [u8] {
        let payload = self.cursor.slice(self.cursor.position(), tlv.end);
        self.cursor.seek(tlv.end);
        payload
    }

    /// Skip unread payload and padding. Reading past the padded end is an error.
    fn finish_tlv(&mut self, tlv: &Tlv) -> Result<(), RspError> {
        let end = tlv.padded_end();
        if self.cursor.position() > end || end > self.cursor.size() {
            return Err(RspError::InvalidValue);
        }
        self.cursor.seek(end);
        self.open_tlvs.pop();
        Ok(())
    }

    // ── Parameters ───────────────────────────────────────────────────────────

    fn server_fields(&mut self, limit: usize) -> Result<(u32, u32), RspError> {
        let fields: ServerFields = self.fixed(limit)?;
        self.peer = Some(fields.sender_id.get());
        Ok((fields.sender_id.get(), fields.receiver_id.get()))
    }

    fn target_fields(&mut self, limit: usize) -> Result<(u32, u32, u32), RspError> {
        let fields: TargetFields = self.fixed(limit)?;
        self.peer = Some(fields.sender_id.get());
        Ok((
            fields.sender_id.get(),
            fields.receiver_id.get(),
            fields.target_id.get(),
        ))
    }

    fn pool_handle(&mut self, limit: usize) -> Result<PoolHandle, RspError> {
        let tlv = self.expect(ParameterType::PoolHandle, limit)?;
        self.pool_handle_from(tlv)
    }

    fn pool_handle_from(&mut self, tlv: Tlv) -> Result<PoolHandle, RspError> {
        let handle = PoolHandle::new(Bytes::copy_from_slice(self.payload(&tlv)))?;
        self.finish_tlv(&tlv)?;
        Ok(handle)
    }

    fn pool_element_identifier(&mut self, limit: usize) -> Result<u32, RspError> {
        let tlv = self.expect(ParameterType::PoolElementIdentifier, limit)?;
        self.identifier_from(tlv)
    }

    fn identifier_from(&mut self, tlv: Tlv) -> Result<u32, RspError> {
        let identifier = match self.payload(&tlv) {
            [a, b, c, d] => u32::from_be_bytes([*a, *b, *c, *d]),
            _ => return Err(RspError::InvalidValue),
        };
        self.finish_tlv(&tlv)?;
        Ok(identifier)
    }

    fn address(&mut self, tlv: Tlv) -> Result<IpAddr, RspError> {
        let payload = self.payload(&tlv);
        let address = match tlv.parameter {
            ParameterType::Ipv4Address => {
                let octets: [u8; 4] = payload
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(RspError::InvalidValue)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            _ => {
                let octets: [u8; 16] = payload
                    .get(..16)
                    .and_then(|b| b.try_into().ok())
                    .ok_or(RspError::InvalidValue)?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        self.finish_tlv(&tlv)?;
        Ok(address)
    }

    /// The next transport parameter before `limit`, if any.
    fn transport(&mut self, limit: usize) -> Result<Option<TransportAddressBlock>, RspError> {
        let Some(tlv) = self.find_tlv(&TRANSPORTS, limit)? else {
            return Ok(None);
        };
        let protocol = TransportProtocol::from_parameter_type(tlv.parameter).ok_or(RspError::InvalidValue)?;
        let fields: TransportFields = self.fixed(tlv.end)?;
        let flags = match protocol {
            TransportProtocol::Udp => 0,
            _ if fields.transport_use.get() == UTP_DATA_PLUS_CONTROL => TABF_CONTROLCHANNEL,
            _ => 0,
        };

        let mut addresses = Vec::new();
        let mut scanned = 0;
        while let Some(address_tlv) = self.find_tlv(&ADDRESSES, tlv.end)? {
            scanned += 1;
            if scanned > protocol.max_addresses() {
                return Err(RspError::InvalidValue);
            }
            let address = self.address(address_tlv)?;
            if protocol == TransportProtocol::Sctp && is_link_local(&address) {
                tracing::debug!(%address, "dropping link-local address from SCTP transport");
                continue;
            }
            addresses.push(address);
        }
        self.finish_tlv(&tlv)?;

        TransportAddressBlock::new(protocol, fields.port.get(), flags, addresses)
            .map(Some)
            .map_err(|_| RspError::InvalidValue)
    }

    fn policy(&mut self, limit: usize) -> Result<PoolPolicySettings, RspError> {
        let tlv = self.expect(ParameterType::PoolPolicy, limit)?;
        self.policy_from(tlv)
    }

    fn policy_from(&mut self, tlv: Tlv) -> Result<PoolPolicySettings, RspError> {
        let policy = decode_policy(self.payload(&tlv))?;
        self.finish_tlv(&tlv)?;
        Ok(policy)
    }

    fn pool_element(&mut self, tlv: Tlv) -> Result<PoolElement, RspError> {
        let fields: PoolElementFields = self.fixed(tlv.end)?;
        let user_transport = self.transport(tlv.end)?.ok_or(RspError::InvalidValue)?;
        let policy = self.policy(tlv.end)?;
        let registrator_transport = self.transport(tlv.end)?;
        self.finish_tlv(&tlv)?;
        Ok(PoolElement {
            identifier: fields.identifier.get(),
            home_registrar: fields.home_registrar.get(),
            registration_life: fields.registration_life.get(),
            policy,
            user_transport,
            registrator_transport,
        })
    }

    fn pool_elements(&mut self, limit: usize) -> Result<Vec<PoolElement>, RspError> {
        let mut elements = Vec::new();
        while let Some(tlv) = self.find_tlv(&[ParameterType::PoolElement], limit)? {
            elements.push(self.pool_element(tlv)?);
        }
        Ok(elements)
    }

    fn handle_table(&mut self, limit: usize) -> Result<Vec<HandleTableEntry>, RspError> {
        let mut pools = Vec::new();
        while let Some(handle_tlv) = self.find_tlv(&[ParameterType::PoolHandle], limit)? {
            let handle = self.pool_handle_from(handle_tlv)?;
            let mut elements = Vec::new();
            while let Some(tlv) =
                self.find_tlv(&[ParameterType::PoolElement, ParameterType::PoolHandle], limit)?
            {
                if tlv.parameter == ParameterType::PoolHandle {
                    self.unread(&tlv);
                    break;
                }
                let element = self.pool_element(tlv)?;
                if element.registrator_transport.is_none() {
                    return Err(RspError::InvalidRegistrator);
                }
                elements.push(element);
            }
            if elements.is_empty() {
                tracing::debug!(%handle, "handle table response contains an empty pool");
                return Err(RspError::InvalidValue);
            }
            pools.push(HandleTableEntry { handle, elements });
        }
        Ok(pools)
    }

    fn server_information(&mut self, tlv: Tlv) -> Result<ServerInformation, RspError> {
        let fields: ServerInfoFields = self.fixed(tlv.end)?;
        let transport = self.transport(tlv.end)?.ok_or(RspError::InvalidValue)?;
        self.finish_tlv(&tlv)?;
        Ok(ServerInformation {
            server_id: fields.server_id.get(),
            transport,
        })
    }

    /// `None` when the cause is "okay".
    fn operation_error(&mut self, tlv: Tlv) -> Result<Option<OperationError>, RspError> {
        let header: ErrorCauseHeader = self.fixed(tlv.end)?;
        let cause_length = usize::from(header.length.get());
        if cause_length < 4 || self.cursor.position() + cause_length - 4 > tlv.end {
            return Err(RspError::InvalidValue);
        }
        let data = self
            .cursor
            .get_space(cause_length - 4)
            .map(Bytes::copy_from_slice)
            .ok_or(RspError::InvalidValue)?;
        self.finish_tlv(&tlv)?;
        Ok(RspError::from_code(header.cause.get()).map(|cause| OperationError::with_data(cause, data)))
    }

    fn optional_error(&mut self, limit: usize) -> Result<Option<OperationError>, RspError> {
        match self.find_tlv(&[ParameterType::OperationError], limit)? {
            Some(tlv) => self.operation_error(tlv),
            None => Ok(None),
        }
    }

    fn required_error(&mut self, limit: usize) -> Result<OperationError, RspError> {
        let tlv = self.expect(ParameterType::OperationError, limit)?;
        self.operation_error(tlv)?.ok_or(RspError::InvalidValue)
    }

    fn cookie(&mut self, limit: usize) -> Result<Bytes, RspError> {
        let tlv = self.expect(ParameterType::Cookie, limit)?;
        let cookie = Bytes::copy_from_slice(self.payload(&tlv));
        self.finish_tlv(&tlv)?;
        Ok(cookie)
    }

    fn checksum(&mut self, limit: usize) -> Result<u16, RspError> {
        let tlv = self.expect(ParameterType::HandlespaceChecksum, limit)?;
        let checksum = match self.payload(&tlv) {
            [high, low, ..] => u16::from_be_bytes([*high, *low]),
            _ => return Err(RspError::InvalidValue),
        };
        self.finish_tlv(&tlv)?;
        Ok(checksum)
    }

    // ── Failure ──────────────────────────────────────────────────────────────

    fn failure(&self, error: RspError) -> DecodeFailure {
        let data = self.cursor.data();
        let message_end = self.message_length.unwrap_or(data.len());
        let offending_parameter = self.open_tlvs.last().map(|&start| {
            let declared = data
                .get(start + 2..start + 4)
                .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
                .unwrap_or(0);
            let end = if declared >= HEADER_SIZE {
                start + declared
            } else {
                data.len()
            };
            Bytes::copy_from_slice(self.cursor.slice(start, end))
        });
        DecodeFailure {
            error,
            protocol: Some(self.protocol),
            message_type: self.message_type,
            position: self.cursor.position(),
            offending_message: Bytes::copy_from_slice(self.cursor.slice(0, message_end)),
            offending_parameter,
            peer: self.peer,
        }
    }
}
