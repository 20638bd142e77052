use std::net::IpAddr;

use bytes::Bytes;
use zerocopy::byteorder::network_endian::{U16, U32};

use crate::buffer::MessageBuffer;
use crate::error::RspError;
use crate::message::{
    HandleTableEntry, MessageBody, OperationError, RSerPoolMessage, ResolutionOutcome,
    ServerInformation,
};
use crate::policy::{encode_policy, PoolPolicySettings};
use crate::pool_element::PoolElement;
use crate::pool_handle::PoolHandle;
use crate::transport::{TransportAddressBlock, TransportProtocol};
use crate::wire::{
    ErrorCauseHeader, HandleUpdateFields, ParameterType, PoolElementFields, ServerFields,
    ServerInfoFields, TargetFields, TransportFields, EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND,
    MAX_HANDLE_RESOLUTION_ITEMS, MAX_MESSAGE_SIZE, UTP_DATA_ONLY, UTP_DATA_PLUS_CONTROL,
};

/// One encoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub bytes: Bytes,
    /// Payload protocol identifier to send the datagram with.
    pub ppid: u32,
    /// `false` when a List or Handle Table Response had to leave entries out.
    pub complete: bool,
    /// Servers or pool elements written into a list-carrying response.
    pub entries: usize,
}

/// Encode `message` into at most `capacity` bytes.
///
/// List and Handle Table Responses are filled with as many entries as fit;
/// a Handle Table Response that was cut short carries the more-to-send
/// flag. Every other message either fits completely or fails with
/// [`RspError::BufferSizeExceeded`].
pub fn encode(message: &RSerPoolMessage, capacity: usize) -> Result<EncodedMessage, RspError> {
    let message_type = message.message_type();
    let mut encoder = Encoder {
        buffer: MessageBuffer::with_capacity(capacity.min(MAX_MESSAGE_SIZE)),
    };
    let start = encoder.buffer.begin_message(message_type, message.flags)?;
    let fill = encoder.body(&message.body)?;
    if matches!(message.body, MessageBody::HandleTableResponse { .. }) && !fill.complete {
        encoder
            .buffer
            .add_message_flags(start, EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND);
    }
    encoder.buffer.finish_message(start)?;
    Ok(EncodedMessage {
        bytes: encoder.buffer.freeze(),
        ppid: message_type.protocol().ppid(),
        complete: fill.complete,
        entries: fill.entries,
    })
}

/// How far a list-carrying body got.
struct Fill {
    complete: bool,
    entries: usize,
}

impl Fill {
    const WHOLE: Fill = Fill {
        complete: true,
        entries: 0,
    };
}

/// Whether a pool element parameter carries its registrator transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registrator {
    /// A pool element's own registration must not carry one.
    Forbidden,
    /// Pool users never see it.
    Omitted,
    /// Registrar-to-registrar entries must carry one.
    Required,
}

struct Encoder {
    buffer: MessageBuffer,
}

impl Encoder {
    fn body(&mut self, body: &MessageBody) -> Result<Fill, RspError> {
        match body {
            MessageBody::Registration {
                handle,
                element,
                error,
            } => {
                self.pool_handle(handle)?;
                self.pool_element(element, Registrator::Forbidden)?;
                if let Some(error) = error {
                    self.operation_error(error)?;
                }
            }
            MessageBody::Deregistration { handle, identifier }
            | MessageBody::EndpointKeepAliveAck { handle, identifier }
            | MessageBody::EndpointUnreachable { handle, identifier } => {
                self.pool_handle(handle)?;
                self.pool_element_identifier(*identifier)?;
            }
            MessageBody::RegistrationResponse {
                handle,
                identifier,
                error,
            }
            | MessageBody::DeregistrationResponse {
                handle,
                identifier,
                error,
            } => {
                self.pool_handle(handle)?;
                self.pool_element_identifier(*identifier)?;
                if let Some(error) = error {
                    self.operation_error(error)?;
                }
            }
            MessageBody::HandleResolution { handle, items } => {
                self.pool_handle(handle)?;
                if let Some(items) = items {
                    let start = self.buffer.begin_tlv(ParameterType::HandleResolution.wire_code())?;
                    self.buffer.put_u32(*items)?;
                    self.buffer.finish_tlv(start)?;
                }
            }
            MessageBody::HandleResolutionResponse { handle, outcome } => {
                self.pool_handle(handle)?;
                match outcome {
                    ResolutionOutcome::Resolved { policy, elements } => {
                        if elements.len() > MAX_HANDLE_RESOLUTION_ITEMS {
                            return Err(RspError::InvalidValue);
                        }
                        self.policy(policy)?;
                        for element in elements {
                            self.pool_element(element, Registrator::Omitted)?;
                        }
                    }
                    ResolutionOutcome::Failed(error) => self.operation_error(error)?,
                }
            }
            MessageBody::EndpointKeepAlive {
                registrar,
                handle,
                identifier,
            } => {
                self.buffer.put_u32(*registrar)?;
                self.pool_handle(handle)?;
                if let Some(identifier) = identifier {
                    self.pool_element_identifier(*identifier)?;
                }
            }
            MessageBody::ServerAnnounce {
                registrar,
                transports,
            } => {
                self.buffer.put_u32(*registrar)?;
                for transport in transports {
                    self.transport(transport)?;
                }
            }
            MessageBody::Cookie { cookie } | MessageBody::CookieEcho { cookie } => {
                let start = self.buffer.begin_tlv(ParameterType::Cookie.wire_code())?;
                self.buffer.put_slice(cookie)?;
                self.buffer.finish_tlv(start)?;
            }
            MessageBody::BusinessCard {
                handle,
                policy,
                elements,
            } => {
                if elements.is_empty() || elements.len() >= MAX_HANDLE_RESOLUTION_ITEMS {
                    return Err(RspError::InvalidValue);
                }
                self.pool_handle(handle)?;
                self.policy(policy)?;
                for element in elements {
                    self.pool_element(element, Registrator::Omitted)?;
                }
            }
            MessageBody::AsapError { error } => self.operation_error(error)?,

            MessageBody::Presence {
                sender,
                receiver,
                checksum,
                server,
            } => {
                self.server_fields(*sender, *receiver)?;
                let start = self.buffer.begin_tlv(ParameterType::HandlespaceChecksum.wire_code())?;
                self.buffer.put_u16(*checksum)?;
                self.buffer.finish_tlv(start)?;
                self.server_information(server)?;
            }
            MessageBody::HandleTableRequest { sender, receiver }
            | MessageBody::ListRequest { sender, receiver } => {
                self.server_fields(*sender, *receiver)?;
            }
            MessageBody::HandleTableResponse {
                sender,
                receiver,
                pools,
            } => {
                self.server_fields(*sender, *receiver)?;
                return self.handle_table(pools);
            }
            MessageBody::HandleUpdate {
                sender,
                receiver,
                action,
                handle,
                element,
            } => {
                self.buffer.put(&HandleUpdateFields {
                    sender_id: U32::new(*sender),
                    receiver_id: U32::new(*receiver),
                    update_action: U16::new((*action).into()),
                    pad: U16::new(0),
                })?;
                self.pool_handle(handle)?;
                self.pool_element(element, Registrator::Required)?;
            }
            MessageBody::ListResponse {
                sender,
                receiver,
                servers,
            } => {
                self.server_fields(*sender, *receiver)?;
                return self.server_list(servers);
            }
            MessageBody::InitTakeover {
                sender,
                receiver,
                target,
            }
            | MessageBody::InitTakeoverAck {
                sender,
                receiver,
                target,
            }
            | MessageBody::TakeoverServer {
                sender,
                receiver,
                target,
            } => {
                self.buffer.put(&TargetFields {
                    sender_id: U32::new(*sender),
                    receiver_id: U32::new(*receiver),
                    target_id: U32::new(*target),
                })?;
            }
            MessageBody::EnrpError {
                sender,
                receiver,
                error,
            } => {
                self.server_fields(*sender, *receiver)?;
                self.operation_error(error)?;
            }
        }
        Ok(Fill::WHOLE)
    }

    // ── Lists ────────────────────────────────────────────────────────────────

    fn server_list(&mut self, servers: &[ServerInformation]) -> Result<Fill, RspError> {
        let mut entries = 0;
        for server in servers {
            let position = self.buffer.position();
            match self.server_information(server) {
                Ok(()) => entries += 1,
                Err(RspError::BufferSizeExceeded) => {
                    self.buffer.truncate(position);
                    break;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(Fill {
            complete: entries == servers.len(),
            entries,
        })
    }

    fn handle_table(&mut self, pools: &[HandleTableEntry]) -> Result<Fill, RspError> {
        let total: usize = pools.iter().map(|pool| pool.elements.len()).sum();
        let mut entries = 0;
        'pools: for pool in pools {
            if pool.elements.is_empty() {
                return Err(RspError::InvalidValue);
            }
            let pool_start = self.buffer.position();
            if self.pool_handle(&pool.handle).is_err() {
                self.buffer.truncate(pool_start);
                break;
            }
            for (i, element) in pool.elements.iter().enumerate() {
                let position = self.buffer.position();
                match self.pool_element(element, Registrator::Required) {
                    Ok(()) => entries += 1,
                    Err(RspError::BufferSizeExceeded) => {
                        // A handle without elements would be an empty pool.
                        self.buffer.truncate(if i == 0 { pool_start } else { position });
                        break 'pools;
                    }
                    Err(error) => return Err(error),
                }
            }
        }
        if entries == 0 && total > 0 {
            return Err(RspError::BufferSizeExceeded);
        }
        Ok(Fill {
            complete: entries == total,
            entries,
        })
    }

    // ── Parameters ───────────────────────────────────────────────────────────

    fn server_fields(&mut self, sender: u32, receiver: u32) -> Result<(), RspError> {
        self.buffer.put(&ServerFields {
            sender_id: U32::new(sender),
            receiver_id: U32::new(receiver),
        })
    }

    fn pool_handle(&mut self, handle: &PoolHandle) -> Result<(), RspError> {
        let start = self.buffer.begin_tlv(ParameterType::PoolHandle.wire_code())?;
        self.buffer.put_slice(handle.as_bytes())?;
        self.buffer.finish_tlv(start)
    }

    fn pool_element_identifier(&mut self, identifier: u32) -> Result<(), RspError> {
        let start = self
            .buffer
            .begin_tlv(ParameterType::PoolElementIdentifier.wire_code())?;
        self.buffer.put_u32(identifier)?;
        self.buffer.finish_tlv(start)
    }

    fn address(&mut self, address: &IpAddr) -> Result<(), RspError> {
        let start = match address {
            IpAddr::V4(v4) => {
                let start = self.buffer.begin_tlv(ParameterType::Ipv4Address.wire_code())?;
                self.buffer.put_slice(&v4.octets())?;
                start
            }
            IpAddr::V6(v6) => {
                let start = self.buffer.begin_tlv(ParameterType::Ipv6Address.wire_code())?;
                self.buffer.put_slice(&v6.octets())?;
                start
            }
        };
        self.buffer.finish_tlv(start)
    }

    fn transport(&mut self, block: &TransportAddressBlock) -> Result<(), RspError> {
        let protocol = block.protocol();
        let transport_use = match protocol {
            TransportProtocol::Udp => 0,
            _ if block.has_control_channel() => UTP_DATA_PLUS_CONTROL,
            _ => UTP_DATA_ONLY,
        };
        let start = self.buffer.begin_tlv(protocol.parameter_type().wire_code())?;
        self.buffer.put(&TransportFields {
            port: U16::new(block.port()),
            transport_use: U16::new(transport_use),
        })?;
        for address in block.addresses() {
            self.address(address)?;
        }
        self.buffer.finish_tlv(start)
    }

    fn policy(&mut self, policy: &PoolPolicySettings) -> Result<(), RspError> {
        encode_policy(&mut self.buffer, policy)
    }

    fn pool_element(&mut self, element: &PoolElement, registrator: Registrator) -> Result<(), RspError> {
        match (registrator, &element.registrator_transport) {
            (Registrator::Forbidden, Some(_)) | (Registrator::Required, None) => {
                return Err(RspError::InvalidRegistrator)
            }
            _ => {}
        }
        let start = self.buffer.begin_tlv(ParameterType::PoolElement.wire_code())?;
        self.buffer.put(&PoolElementFields {
            identifier: U32::new(element.identifier),
            home_registrar: U32::new(element.home_registrar),
            registration_life: U32::new(element.registration_life),
        })?;
        self.transport(&element.user_transport)?;
        self.policy(&element.policy)?;
        if registrator == Registrator::Required {
            if let Some(transport) = &element.registrator_transport {
                self.transport(transport)?;
            }
        }
        self.buffer.finish_tlv(start)
    }

    fn server_information(&mut self, server: &ServerInformation) -> Result<(), RspError> {
        let start = self
            .buffer
            .begin_tlv(ParameterType::ServerInformation.wire_code())?;
        self.buffer.put(&ServerInfoFields {
            server_id: U32::new(server.server_id),
        })?;
        self.transport(&server.transport)?;
        self.buffer.finish_tlv(start)
    }

    /// Offending data is only echoed for causes that are defined to carry it.
    fn operation_error(&mut self, error: &OperationError) -> Result<(), RspError> {
        let data: &[u8] = if error.cause.carries_offending_data() {
            &error.data
        } else {
            &[]
        };
        let cause_length =
            u16::try_from(data.len() + 4).map_err(|_| RspError::BufferSizeExceeded)?;
        let start = self.buffer.begin_tlv(ParameterType::OperationError.wire_code())?;
        self.buffer.put(&ErrorCauseHeader {
            cause: U16::new(error.cause.code()),
            length: U16::new(cause_length),
        })?;
        self.buffer.put_slice(data)?;
        self.buffer.finish_tlv(start)
    }
}
