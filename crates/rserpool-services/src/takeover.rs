//! Takeover of a failed registrar's pool elements.
//!
//! The registrar that starts a takeover asks every other peer to agree by
//! sending Init Takeover. It may adopt the target's elements once each of
//! those peers has answered with Init Takeover Ack.

use rserpool_core::wire::UNDEFINED_REGISTRAR_IDENTIFIER;
use rserpool_core::{RegistrarIdentifier, RspError};

use crate::peer_list::PeerList;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverProcess {
    target: RegistrarIdentifier,
    outstanding: Vec<RegistrarIdentifier>,
}

impl TakeoverProcess {
    /// Start a takeover of `target`, expecting an acknowledgement from every
    /// identified peer other than the target and ourselves.
    pub fn new<U>(target: RegistrarIdentifier, peers: &PeerList<U>) -> Result<Self, RspError> {
        if target == UNDEFINED_REGISTRAR_IDENTIFIER {
            return Err(RspError::InvalidId);
        }
        if target == peers.own_identifier() {
            return Err(RspError::OwnId);
        }
        let outstanding = peers
            .iter()
            .map(|(_, node)| node.identifier())
            .filter(|id| {
                *id != target && *id != peers.own_identifier() && *id != UNDEFINED_REGISTRAR_IDENTIFIER
            })
            .collect();
        Ok(Self { target, outstanding })
    }

    pub fn target(&self) -> RegistrarIdentifier {
        self.target
    }

    /// Peers that have not acknowledged yet.
    pub fn outstanding(&self) -> &[RegistrarIdentifier] {
        &self.outstanding
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Record an acknowledgement. Returns how many are still missing.
    pub fn acknowledge(&mut self, acknowledger: RegistrarIdentifier) -> usize {
        self.outstanding.retain(|id| *id != acknowledger);
        self.outstanding.len()
    }
}
