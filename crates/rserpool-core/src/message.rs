//! Typed ASAP and ENRP messages.
//!
//! [`RSerPoolMessage`] is what the codec produces from a datagram and what
//! it turns back into bytes. Each [`MessageBody`] variant carries exactly
//! the parameters its message type has on the wire; header flags stay in
//! [`RSerPoolMessage::flags`].

use bytes::Bytes;

use crate::error::RspError;
use crate::policy::PoolPolicySettings;
use crate::pool_element::{PoolElement, PoolElementIdentifier, RegistrarIdentifier};
use crate::pool_handle::PoolHandle;
use crate::transport::TransportAddressBlock;
use crate::wire::{HandleUpdateAction, MessageType, Protocol};

/// Contents of an Operation Error parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub cause: RspError,
    /// Cause-specific data, usually the offending parameter or message.
    pub data: Bytes,
}

impl OperationError {
    pub fn new(cause: RspError) -> Self {
        Self {
            cause,
            data: Bytes::new(),
        }
    }

    pub fn with_data(cause: RspError, data: Bytes) -> Self {
        Self { cause, data }
    }
}

/// A registrar as announced in a Server Information parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInformation {
    pub server_id: RegistrarIdentifier,
    pub transport: TransportAddressBlock,
}

/// Result carried by a Handle Resolution Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Resolved {
        policy: PoolPolicySettings,
        elements: Vec<PoolElement>,
    },
    Failed(OperationError),
}

/// One pool in a Handle Table Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTableEntry {
    pub handle: PoolHandle,
    /// Never empty. Every element carries its registrator transport.
    pub elements: Vec<PoolElement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    // ── ASAP ─────────────────────────────────────────────────────────────────
    /// A pool element registers (or re-registers) with its home registrar.
    Registration {
        handle: PoolHandle,
        element: PoolElement,
        error: Option<OperationError>,
    },
    Deregistration {
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
    },
    RegistrationResponse {
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
        error: Option<OperationError>,
    },
    DeregistrationResponse {
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
        error: Option<OperationError>,
    },
    /// `items` limits the elements wanted; `None` leaves it to the registrar.
    HandleResolution {
        handle: PoolHandle,
        items: Option<u32>,
    },
    HandleResolutionResponse {
        handle: PoolHandle,
        outcome: ResolutionOutcome,
    },
    EndpointKeepAlive {
        registrar: RegistrarIdentifier,
        handle: PoolHandle,
        identifier: Option<PoolElementIdentifier>,
    },
    EndpointKeepAliveAck {
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
    },
    /// A pool user reports an element it could not reach.
    EndpointUnreachable {
        handle: PoolHandle,
        identifier: PoolElementIdentifier,
    },
    /// Registrar advertisement. Without explicit transports the decoder
    /// substitutes the datagram's source address.
    ServerAnnounce {
        registrar: RegistrarIdentifier,
        transports: Vec<TransportAddressBlock>,
    },
    Cookie {
        cookie: Bytes,
    },
    CookieEcho {
        cookie: Bytes,
    },
    /// Failover hints from a pool element to a pool user.
    BusinessCard {
        handle: PoolHandle,
        policy: PoolPolicySettings,
        elements: Vec<PoolElement>,
    },
    AsapError {
        error: OperationError,
    },

    // ── ENRP ─────────────────────────────────────────────────────────────────
    /// Liveness and handlespace checksum of the sender.
    Presence {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        checksum: u16,
        server: ServerInformation,
    },
    HandleTableRequest {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
    },
    HandleTableResponse {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        pools: Vec<HandleTableEntry>,
    },
    HandleUpdate {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        action: HandleUpdateAction,
        handle: PoolHandle,
        element: PoolElement,
    },
    ListRequest {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
    },
    ListResponse {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        servers: Vec<ServerInformation>,
    },
    InitTakeover {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        target: RegistrarIdentifier,
    },
    InitTakeoverAck {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        target: RegistrarIdentifier,
    },
    TakeoverServer {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        target: RegistrarIdentifier,
    },
    EnrpError {
        sender: RegistrarIdentifier,
        receiver: RegistrarIdentifier,
        error: OperationError,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Registration { .. } => MessageType::Registration,
            MessageBody::Deregistration { .. } => MessageType::Deregistration,
            MessageBody::RegistrationResponse { .. } => MessageType::RegistrationResponse,
            MessageBody::DeregistrationResponse { .. } => MessageType::DeregistrationResponse,
            MessageBody::HandleResolution { .. } => MessageType::HandleResolution,
            MessageBody::HandleResolutionResponse { .. } => MessageType::HandleResolutionResponse,
            MessageBody::EndpointKeepAlive { .. } => MessageType::EndpointKeepAlive,
            MessageBody::EndpointKeepAliveAck { .. } => MessageType::EndpointKeepAliveAck,
            MessageBody::EndpointUnreachable { .. } => MessageType::EndpointUnreachable,
            MessageBody::ServerAnnounce { .. } => MessageType::ServerAnnounce,
            MessageBody::Cookie { .. } => MessageType::Cookie,
            MessageBody::CookieEcho { .. } => MessageType::CookieEcho,
            MessageBody::BusinessCard { .. } => MessageType::BusinessCard,
            MessageBody::AsapError { .. } => MessageType::AsapError,
            MessageBody::Presence { .. } => MessageType::Presence,
            MessageBody::HandleTableRequest { .. } => MessageType::HandleTableRequest,
            MessageBody::HandleTableResponse { .. } => MessageType::HandleTableResponse,
            MessageBody::HandleUpdate { .. } => MessageType::HandleUpdate,
            MessageBody::ListRequest { .. } => MessageType::ListRequest,
            MessageBody::ListResponse { .. } => MessageType::ListResponse,
            MessageBody::InitTakeover { .. } => MessageType::InitTakeover,
            MessageBody::InitTakeoverAck { .. } => MessageType::InitTakeoverAck,
            MessageBody::TakeoverServer { .. } => MessageType::TakeoverServer,
            MessageBody::EnrpError { .. } => MessageType::EnrpError,
        }
    }

    /// Sender of an ENRP message. `None` for ASAP.
    pub fn sender(&self) -> Option<RegistrarIdentifier> {
        match self {
            MessageBody::Presence { sender, .. }
            | MessageBody::HandleTableRequest { sender, .. }
            | MessageBody::HandleTableResponse { sender, .. }
            | MessageBody::HandleUpdate { sender, .. }
            | MessageBody::ListRequest { sender, .. }
            | MessageBody::ListResponse { sender, .. }
            | MessageBody::InitTakeover { sender, .. }
            | MessageBody::InitTakeoverAck { sender, .. }
            | MessageBody::TakeoverServer { sender, .. }
            | MessageBody::EnrpError { sender, .. } => Some(*sender),
            _ => None,
        }
    }
}

/// A decoded or to-be-encoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RSerPoolMessage {
    /// Header flags. Bits not defined for the message type are dropped on encode.
    pub flags: u8,
    pub body: MessageBody,
    /// Parameters skipped with the continue-and-report action, verbatim.
    pub unrecognized_parameters: Vec<Bytes>,
}

impl RSerPoolMessage {
    pub fn new(body: MessageBody) -> Self {
        Self {
            flags: 0,
            body,
            unrecognized_parameters: Vec::new(),
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn protocol(&self) -> Protocol {
        self.message_type().protocol()
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

impl From<MessageBody> for RSerPoolMessage {
    fn from(body: MessageBody) -> Self {
        RSerPoolMessage::new(body)
    }
}
