//! rserpool-core — error codes, wire format, message codec and the value
//! types shared by the handlespace and peer list engines.
//! All other rserpool crates depend on this one.

pub mod buffer;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod pool_element;
pub mod pool_handle;
pub mod time;
pub mod transport;
pub mod wire;

pub use checksum::{ChecksumAccumulator, HandlespaceChecksum};
pub use codec::{decode, encode, DecodeFailure, EncodedMessage};
pub use error::RspError;
pub use message::{MessageBody, RSerPoolMessage};
pub use policy::{PolicyType, PoolPolicySettings};
pub use pool_element::{PoolElement, PoolElementIdentifier, PoolElementNode, RegistrarIdentifier};
pub use pool_handle::PoolHandle;
pub use transport::{TransportAddressBlock, TransportProtocol};
