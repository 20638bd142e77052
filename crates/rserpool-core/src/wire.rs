//! ASAP/ENRP wire format: on-wire headers, type codes and protocol constants.
//!
//! These types ARE the protocol. Every field and every size here is part of
//! the RSerPool wire format; changing anything breaks interoperability with
//! other registrars.
//!
//! Fixed-size headers are `#[repr(C)]` structs of network-order integers with
//! zerocopy derives, so they can be written into and read out of a message
//! buffer without any unsafe code or manual byte shuffling.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::RspError;

// ── Transport ─────────────────────────────────────────────────────────────────

/// SCTP payload protocol identifier for ASAP.
pub const PPID_ASAP: u32 = 11;

/// SCTP payload protocol identifier for ENRP.
pub const PPID_ENRP: u32 = 12;

/// Well-known ASAP port.
pub const ASAP_PORT: u16 = 3863;

/// Well-known ENRP port.
pub const ENRP_PORT: u16 = 3864;

/// Largest message the 16-bit length field can describe.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Maximum addresses in one transport parameter.
pub const MAX_PE_TRANSPORT_ADDRESSES: usize = 32;

/// Maximum pool handle length in bytes.
pub const MAX_POOL_HANDLE_SIZE: usize = 32;

/// Maximum pool elements in a handle resolution response or business card.
pub const MAX_HANDLE_RESOLUTION_ITEMS: usize = 128;

/// Handle resolution item count meaning "as many as possible".
pub const HANDLE_RESOLUTION_ITEMS_MAX: u32 = 0xffff_ffff;

/// Registrar identifier of a peer whose identity is not yet known.
pub const UNDEFINED_REGISTRAR_IDENTIFIER: u32 = 0;

// ── Headers ───────────────────────────────────────────────────────────────────

/// Common header of every ASAP and ENRP message.
///
/// Only the low byte of the message type travels on the wire. The protocol
/// (and with it the high byte) is implied by the PPID of the datagram.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct MessageHeader {
    pub msg_type: u8,
    pub flags: u8,
    /// Header plus body, excluding trailing padding.
    pub length: U16,
}

assert_eq_size!(MessageHeader, [u8; 4]);

/// Header of every parameter.
///
/// The two high-order bits of `tlv_type` select what a receiver does with a
/// parameter type it does not understand (see [`TlvAction`]).
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TlvHeader {
    pub tlv_type: U16,
    /// Header plus payload, excluding trailing padding.
    pub length: U16,
}

assert_eq_size!(TlvHeader, [u8; 4]);

/// Size of both the message and the TLV header.
pub const HEADER_SIZE: usize = 4;

/// Fixed part of a Pool Element parameter; transports and policy follow.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PoolElementFields {
    pub identifier: U32,
    pub home_registrar: U32,
    /// Registration life in milliseconds.
    pub registration_life: U32,
}

assert_eq_size!(PoolElementFields, [u8; 12]);

/// Fixed part of an SCTP, TCP or UDP transport parameter; addresses follow.
/// For UDP the second field is reserved and sent as zero.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TransportFields {
    pub port: U16,
    pub transport_use: U16,
}

assert_eq_size!(TransportFields, [u8; 4]);

/// Transport use: the endpoint carries data only.
pub const UTP_DATA_ONLY: u16 = 0x0000;

/// Transport use: the endpoint carries data and the ASAP control channel.
pub const UTP_DATA_PLUS_CONTROL: u16 = 0x0001;

/// Fixed part of a Server Information parameter; a transport follows.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ServerInfoFields {
    pub server_id: U32,
}

assert_eq_size!(ServerInfoFields, [u8; 4]);

/// Header of an Operation Error cause; cause-specific data follows.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ErrorCauseHeader {
    pub cause: U16,
    /// Cause header plus data.
    pub length: U16,
}

assert_eq_size!(ErrorCauseHeader, [u8; 4]);

/// ENRP server parameter: the first body field of most ENRP messages.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ServerFields {
    pub sender_id: U32,
    pub receiver_id: U32,
}

assert_eq_size!(ServerFields, [u8; 8]);

/// ENRP target parameter used by the takeover messages.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TargetFields {
    pub sender_id: U32,
    pub receiver_id: U32,
    pub target_id: U32,
}

assert_eq_size!(TargetFields, [u8; 12]);

/// ENRP handle update parameter.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct HandleUpdateFields {
    pub sender_id: U32,
    pub receiver_id: U32,
    pub update_action: U16,
    pub pad: U16,
}

assert_eq_size!(HandleUpdateFields, [u8; 12]);

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Which half of RSerPool a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Aggregate Server Access Protocol: pool users and pool elements.
    Asap,
    /// Endpoint haNdlespace Redundancy Protocol: registrar to registrar.
    Enrp,
}

/// High byte ORed into ASAP message types.
pub const AHT_ASAP_MODIFIER: u16 = 0xaa00;

/// High byte ORed into ENRP message types.
pub const EHT_ENRP_MODIFIER: u16 = 0xee00;

impl Protocol {
    pub fn ppid(self) -> u32 {
        match self {
            Protocol::Asap => PPID_ASAP,
            Protocol::Enrp => PPID_ENRP,
        }
    }

    /// Protocol implied by a datagram's PPID.
    pub fn from_ppid(ppid: u32) -> Result<Self, RspError> {
        match ppid {
            PPID_ASAP => Ok(Protocol::Asap),
            PPID_ENRP => Ok(Protocol::Enrp),
            _ => Err(RspError::WrongProtocol),
        }
    }

    pub fn modifier(self) -> u16 {
        match self {
            Protocol::Asap => AHT_ASAP_MODIFIER,
            Protocol::Enrp => EHT_ENRP_MODIFIER,
        }
    }
}

// ── Message Types ─────────────────────────────────────────────────────────────

/// Every ASAP and ENRP message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // ASAP
    Registration,
    Deregistration,
    RegistrationResponse,
    DeregistrationResponse,
    HandleResolution,
    HandleResolutionResponse,
    EndpointKeepAlive,
    EndpointKeepAliveAck,
    EndpointUnreachable,
    ServerAnnounce,
    Cookie,
    CookieEcho,
    BusinessCard,
    AsapError,
    // ENRP
    Presence,
    HandleTableRequest,
    HandleTableResponse,
    HandleUpdate,
    ListRequest,
    ListResponse,
    InitTakeover,
    InitTakeoverAck,
    TakeoverServer,
    EnrpError,
}

impl MessageType {
    pub fn protocol(self) -> Protocol {
        match self {
            MessageType::Presence
            | MessageType::HandleTableRequest
            | MessageType::HandleTableResponse
            | MessageType::HandleUpdate
            | MessageType::ListRequest
            | MessageType::ListResponse
            | MessageType::InitTakeover
            | MessageType::InitTakeoverAck
            | MessageType::TakeoverServer
            | MessageType::EnrpError => Protocol::Enrp,
            _ => Protocol::Asap,
        }
    }

    /// The byte carried in the message header.
    pub fn type_byte(self) -> u8 {
        match self {
            MessageType::Registration => 0x01,
            MessageType::Deregistration => 0x02,
            MessageType::RegistrationResponse => 0x03,
            MessageType::DeregistrationResponse => 0x04,
            MessageType::HandleResolution => 0x05,
            MessageType::HandleResolutionResponse => 0x06,
            MessageType::EndpointKeepAlive => 0x07,
            MessageType::EndpointKeepAliveAck => 0x08,
            MessageType::EndpointUnreachable => 0x09,
            MessageType::ServerAnnounce => 0x0a,
            MessageType::Cookie => 0x0b,
            MessageType::CookieEcho => 0x0c,
            MessageType::BusinessCard => 0x0d,
            MessageType::AsapError => 0x0e,
            MessageType::Presence => 0x01,
            MessageType::HandleTableRequest => 0x02,
            MessageType::HandleTableResponse => 0x03,
            MessageType::HandleUpdate => 0x04,
            MessageType::ListRequest => 0x05,
            MessageType::ListResponse => 0x06,
            MessageType::InitTakeover => 0x07,
            MessageType::InitTakeoverAck => 0x08,
            MessageType::TakeoverServer => 0x09,
            MessageType::EnrpError => 0x0a,
        }
    }

    /// Full 16-bit type: protocol modifier plus header byte.
    pub fn code(self) -> u16 {
        self.protocol().modifier() | u16::from(self.type_byte())
    }

    /// Resolve a header byte received under `protocol`.
    pub fn from_wire(protocol: Protocol, type_byte: u8) -> Result<Self, RspError> {
        let message_type = match (protocol, type_byte) {
            (Protocol::Asap, 0x01) => MessageType::Registration,
            (Protocol::Asap, 0x02) => MessageType::Deregistration,
            (Protocol::Asap, 0x03) => MessageType::RegistrationResponse,
            (Protocol::Asap, 0x04) => MessageType::DeregistrationResponse,
            (Protocol::Asap, 0x05) => MessageType::HandleResolution,
            (Protocol::Asap, 0x06) => MessageType::HandleResolutionResponse,
            (Protocol::Asap, 0x07) => MessageType::EndpointKeepAlive,
            (Protocol::Asap, 0x08) => MessageType::EndpointKeepAliveAck,
            (Protocol::Asap, 0x09) => MessageType::EndpointUnreachable,
            (Protocol::Asap, 0x0a) => MessageType::ServerAnnounce,
            (Protocol::Asap, 0x0b) => MessageType::Cookie,
            (Protocol::Asap, 0x0c) => MessageType::CookieEcho,
            (Protocol::Asap, 0x0d) => MessageType::BusinessCard,
            (Protocol::Asap, 0x0e) => MessageType::AsapError,
            (Protocol::Enrp, 0x01) => MessageType::Presence,
            (Protocol::Enrp, 0x02) => MessageType::HandleTableRequest,
            (Protocol::Enrp, 0x03) => MessageType::HandleTableResponse,
            (Protocol::Enrp, 0x04) => MessageType::HandleUpdate,
            (Protocol::Enrp, 0x05) => MessageType::ListRequest,
            (Protocol::Enrp, 0x06) => MessageType::ListResponse,
            (Protocol::Enrp, 0x07) => MessageType::InitTakeover,
            (Protocol::Enrp, 0x08) => MessageType::InitTakeoverAck,
            (Protocol::Enrp, 0x09) => MessageType::TakeoverServer,
            (Protocol::Enrp, 0x0a) => MessageType::EnrpError,
            _ => return Err(RspError::UnrecognizedMessage),
        };
        Ok(message_type)
    }

    /// Header flag bits defined for this message type. Others are sent as zero.
    pub fn flag_mask(self) -> u8 {
        match self {
            MessageType::EndpointKeepAlive => AHF_ENDPOINT_KEEP_ALIVE_HOME,
            MessageType::RegistrationResponse => AHF_REGISTRATION_REJECT,
            MessageType::Presence => EHF_PRESENCE_REPLY_REQUIRED,
            MessageType::HandleTableRequest => EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY,
            MessageType::HandleTableResponse => {
                EHF_HANDLE_TABLE_RESPONSE_REJECT | EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND
            }
            MessageType::ListResponse => EHF_LIST_RESPONSE_REJECT,
            MessageType::HandleUpdate => EHF_TAKEOVER_SUGGESTED,
            _ => 0x00,
        }
    }
}

// ── Message Flags ─────────────────────────────────────────────────────────────

pub const AHF_ENDPOINT_KEEP_ALIVE_HOME: u8 = 1 << 0;
pub const AHF_REGISTRATION_REJECT: u8 = 1 << 0;

pub const EHF_PRESENCE_REPLY_REQUIRED: u8 = 1 << 0;
pub const EHF_HANDLE_TABLE_REQUEST_OWN_CHILDREN_ONLY: u8 = 1 << 0;
pub const EHF_HANDLE_TABLE_RESPONSE_REJECT: u8 = 1 << 0;
pub const EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND: u8 = 1 << 1;
pub const EHF_LIST_RESPONSE_REJECT: u8 = 1 << 0;
pub const EHF_TAKEOVER_SUGGESTED: u8 = 1 << 0;

// ── Parameter Types ───────────────────────────────────────────────────────────

/// Parameter (TLV) types, without action bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ParameterType {
    Ipv4Address = 0x01,
    Ipv6Address = 0x02,
    SctpTransport = 0x04,
    TcpTransport = 0x05,
    UdpTransport = 0x06,
    PoolPolicy = 0x08,
    PoolHandle = 0x09,
    PoolElement = 0x0a,
    ServerInformation = 0x0b,
    OperationError = 0x0c,
    Cookie = 0x0d,
    PoolElementIdentifier = 0x0e,
    HandlespaceChecksum = 0x0f,
    HandleResolution = 0x10,
}

/// Mask of the action bits inside a TLV type.
pub const ATT_ACTION_MASK: u16 = 0xc000;

impl ParameterType {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Look up a TLV type after stripping its action bits.
    pub fn from_code(tlv_type: u16) -> Option<Self> {
        let parameter = match tlv_type & !ATT_ACTION_MASK {
            0x01 => ParameterType::Ipv4Address,
            0x02 => ParameterType::Ipv6Address,
            0x04 => ParameterType::SctpTransport,
            0x05 => ParameterType::TcpTransport,
            0x06 => ParameterType::UdpTransport,
            0x08 => ParameterType::PoolPolicy,
            0x09 => ParameterType::PoolHandle,
            0x0a => ParameterType::PoolElement,
            0x0b => ParameterType::ServerInformation,
            0x0c => ParameterType::OperationError,
            0x0d => ParameterType::Cookie,
            0x0e => ParameterType::PoolElementIdentifier,
            0x0f => ParameterType::HandlespaceChecksum,
            0x10 => ParameterType::HandleResolution,
            _ => return None,
        };
        Some(parameter)
    }

    /// Type code as sent. Handle resolution carries the continue bits so
    /// registrars that predate it skip it silently.
    pub fn wire_code(self) -> u16 {
        match self {
            ParameterType::HandleResolution => self.code() | TlvAction::Continue.bits(),
            _ => self.code(),
        }
    }
}

/// What a receiver does with a TLV whose type it does not expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvAction {
    /// Stop processing and discard the message silently.
    Stop,
    /// Stop processing, discard, and report the parameter.
    StopAndReport,
    /// Skip the parameter silently.
    Continue,
    /// Skip the parameter and report it.
    ContinueAndReport,
}

impl TlvAction {
    pub fn of(tlv_type: u16) -> Self {
        match tlv_type & ATT_ACTION_MASK {
            0x0000 => TlvAction::Stop,
            0x4000 => TlvAction::StopAndReport,
            0x8000 => TlvAction::Continue,
            _ => TlvAction::ContinueAndReport,
        }
    }

    pub fn bits(self) -> u16 {
        match self {
            TlvAction::Stop => 0x0000,
            TlvAction::StopAndReport => 0x4000,
            TlvAction::Continue => 0x8000,
            TlvAction::ContinueAndReport => 0xc000,
        }
    }
}

// ── Handle Update ─────────────────────────────────────────────────────────────

/// Action carried in an ENRP Handle Update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HandleUpdateAction {
    AddPoolElement = 0x0000,
    DeletePoolElement = 0x0001,
}

impl TryFrom<u16> for HandleUpdateAction {
    type Error = RspError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(HandleUpdateAction::AddPoolElement),
            0x0001 => Ok(HandleUpdateAction::DeletePoolElement),
            _ => Err(RspError::InvalidValue),
        }
    }
}

impl From<HandleUpdateAction> for u16 {
    fn from(action: HandleUpdateAction) -> u16 {
        action as u16
    }
}
