//! RSerPool error causes.
//!
//! One closed set of codes shared by the wire format (Operation Error
//! parameter cause codes) and the local APIs (peer list, handlespace,
//! codec). `0x0000` means "okay" on the wire and has no variant here:
//! success is `Ok(..)`.

/// Every RSerPool error cause this implementation knows about.
///
/// Codes below `0x1000` are protocol causes that may travel on the wire.
/// `0x1000..0xf000` are local implementation errors. `0xf000..` are
/// handlespace/peer list management errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum RspError {
    // ── Protocol causes ──────────────────────────────────────────────────────
    #[error("unrecognized parameter")]
    UnrecognizedParameter,
    #[error("unrecognized message")]
    UnrecognizedMessage,
    #[error("invalid TLV")]
    InvalidTlv,
    #[error("incompatible pool policy")]
    IncompatiblePoolPolicy,
    #[error("out of resources")]
    OutOfResources,
    #[error("wrong control channel handling")]
    WrongControlChannelHandling,
    #[error("object not found")]
    NotFound,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid value")]
    InvalidValue,

    // ── Implementation errors ────────────────────────────────────────────────
    #[error("not initialized")]
    NotInitialized,
    #[error("buffer size exceeded (message too long)")]
    BufferSizeExceeded,
    #[error("read() error")]
    ReadError,
    #[error("write() error")]
    WriteError,
    #[error("socket() failure")]
    ConnectionFailureSocket,
    #[error("connect() failure")]
    ConnectionFailureConnect,
    #[error("no registrar available")]
    NoRegistrar,
    #[error("timeout")]
    Timeout,
    #[error("unrecognized parameter (silent)")]
    UnrecognizedParameterSilent,
    #[error("wrong protocol")]
    WrongProtocol,
    #[error("unsupported pool policy")]
    UnsupportedPoolPolicy,

    // ── Management errors ────────────────────────────────────────────────────
    #[error("invalid ID")]
    InvalidId,
    #[error("own ID")]
    OwnId,
    #[error("duplicate ID")]
    DuplicateId,
    #[error("invalid pool policy")]
    InvalidPoolPolicy,
    #[error("invalid pool handle (too long)")]
    InvalidPoolHandle,
    #[error("invalid address(es)")]
    InvalidAddresses,
    #[error("invalid registrator")]
    InvalidRegistrator,
    #[error("no usable ASAP endpoint address(es)")]
    NoUsableAsapAddresses,
    #[error("no usable user endpoint address(es)")]
    NoUsableUserAddresses,

    /// A cause code received from a peer that this implementation does not know.
    #[error("unknown error cause {0:#06x}")]
    Unknown(u16),
}

/// Allocation failure. RSerPool historically aliases this to out-of-resources.
pub const OUT_OF_MEMORY: RspError = RspError::OutOfResources;

impl RspError {
    /// Numeric cause code as carried in an Operation Error parameter.
    pub fn code(self) -> u16 {
        match self {
            RspError::UnrecognizedParameter => 0x0001,
            RspError::UnrecognizedMessage => 0x0002,
            RspError::InvalidTlv => 0x0003,
            RspError::IncompatiblePoolPolicy => 0x0005,
            RspError::OutOfResources => 0x0006,
            RspError::WrongControlChannelHandling => 0x0008,
            RspError::NotFound => 0x0009,
            RspError::InvalidMessage => 0x0010,
            RspError::InvalidValue => 0x0011,
            RspError::NotInitialized => 0x1000,
            RspError::BufferSizeExceeded => 0x1001,
            RspError::ReadError => 0x1003,
            RspError::WriteError => 0x1004,
            RspError::ConnectionFailureSocket => 0x1005,
            RspError::ConnectionFailureConnect => 0x1006,
            RspError::NoRegistrar => 0x1007,
            RspError::Timeout => 0x1008,
            RspError::UnrecognizedParameterSilent => 0x1009,
            RspError::WrongProtocol => 0x100a,
            RspError::UnsupportedPoolPolicy => 0x100b,
            RspError::InvalidId => 0xf000,
            RspError::OwnId => 0xf001,
            RspError::DuplicateId => 0xf002,
            RspError::InvalidPoolPolicy => 0xf003,
            RspError::InvalidPoolHandle => 0xf004,
            RspError::InvalidAddresses => 0xf005,
            RspError::InvalidRegistrator => 0xf006,
            RspError::NoUsableAsapAddresses => 0xf007,
            RspError::NoUsableUserAddresses => 0xf008,
            RspError::Unknown(code) => code,
        }
    }

    /// Map a wire cause code back to an error. `0x0000` (okay) yields `None`.
    pub fn from_code(code: u16) -> Option<Self> {
        let error = match code {
            0x0000 => return None,
            0x0001 => RspError::UnrecognizedParameter,
            0x0002 => RspError::UnrecognizedMessage,
            0x0003 => RspError::InvalidTlv,
            0x0005 => RspError::IncompatiblePoolPolicy,
            0x0006 => RspError::OutOfResources,
            0x0008 => RspError::WrongControlChannelHandling,
            0x0009 => RspError::NotFound,
            0x0010 => RspError::InvalidMessage,
            0x0011 => RspError::InvalidValue,
            0x1000 => RspError::NotInitialized,
            0x1001 => RspError::BufferSizeExceeded,
            0x1003 => RspError::ReadError,
            0x1004 => RspError::WriteError,
            0x1005 => RspError::ConnectionFailureSocket,
            0x1006 => RspError::ConnectionFailureConnect,
            0x1007 => RspError::NoRegistrar,
            0x1008 => RspError::Timeout,
            0x1009 => RspError::UnrecognizedParameterSilent,
            0x100a => RspError::WrongProtocol,
            0x100b => RspError::UnsupportedPoolPolicy,
            0xf000 => RspError::InvalidId,
            0xf001 => RspError::OwnId,
            0xf002 => RspError::DuplicateId,
            0xf003 => RspError::InvalidPoolPolicy,
            0xf004 => RspError::InvalidPoolHandle,
            0xf005 => RspError::InvalidAddresses,
            0xf006 => RspError::InvalidRegistrator,
            0xf007 => RspError::NoUsableAsapAddresses,
            0xf008 => RspError::NoUsableUserAddresses,
            other => RspError::Unknown(other),
        };
        Some(error)
    }

    /// Causes whose Operation Error parameter echoes the offending bytes.
    pub fn carries_offending_data(self) -> bool {
        matches!(
            self,
            RspError::UnrecognizedParameter | RspError::InvalidTlv | RspError::InvalidValue
        )
    }
}
