//! rserpool-services — the registrar engines: pool handlespace, ENRP peer
//! list, takeover bookkeeping and the registrar state machine tying them
//! together. Nothing here does I/O.

pub mod handlespace;
pub mod peer_list;
pub mod peer_list_management;
pub mod registrar;
pub mod takeover;

pub use handlespace::{
    HandlespaceChange, HandlespaceObserver, OwnershipChecksums, PoolHandlespace, RegistrationOutcome,
};
pub use peer_list::{PeerHandle, PeerList, PeerListNode};
pub use peer_list_management::{ChecksumMismatch, PeerListManagement, UserDataDisposer};
pub use registrar::{Outgoing, PeerSyncState, RegistrarState, RegistrarTimeouts};
pub use takeover::TakeoverProcess;
