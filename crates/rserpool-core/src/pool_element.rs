//! Pool elements as they travel in messages and as a registrar stores them.

use std::fmt;

use crate::checksum::{pool_element_checksum, ChecksumAccumulator};
use crate::policy::PoolPolicySettings;
use crate::pool_handle::PoolHandle;
use crate::transport::TransportAddressBlock;

/// Identifier of a registrar. Zero means "not yet known".
pub type RegistrarIdentifier = u32;

/// Identifier of a pool element, unique within its pool.
pub type PoolElementIdentifier = u32;

/// The contents of a Pool Element parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolElement {
    pub identifier: PoolElementIdentifier,
    /// Registrar that owns this registration.
    pub home_registrar: RegistrarIdentifier,
    /// Registration life in milliseconds.
    pub registration_life: u32,
    pub policy: PoolPolicySettings,
    pub user_transport: TransportAddressBlock,
    /// Where the owning registrar reached the element. Carried only between
    /// registrars, never in a pool element's own registration.
    pub registrator_transport: Option<TransportAddressBlock>,
}

impl fmt::Display for PoolElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:08x} home=${:08x} life={}ms {} via {}",
            self.identifier, self.home_registrar, self.registration_life, self.policy, self.user_transport
        )?;
        if let Some(registrator) = &self.registrator_transport {
            write!(f, " registrator {registrator}")?;
        }
        Ok(())
    }
}

/// A pool element inside a handlespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolElementNode {
    pub element: PoolElement,
    /// Contribution to the handlespace and ownership checksums.
    pub checksum: ChecksumAccumulator,
    /// Microseconds, see [`crate::time::now_micros`].
    pub last_update: u64,
    /// When the registration lapses unless renewed.
    pub expiry: Option<u64>,
}

impl PoolElementNode {
    pub fn new(handle: &PoolHandle, element: PoolElement, now: u64) -> Self {
        Self {
            checksum: pool_element_checksum(handle, element.identifier),
            element,
            last_update: now,
            expiry: None,
        }
    }

    pub fn identifier(&self) -> PoolElementIdentifier {
        self.element.identifier
    }

    pub fn home_registrar(&self) -> RegistrarIdentifier {
        self.element.home_registrar
    }

    /// Replace the stored registration with a newer one for the same element.
    pub fn update(&mut self, element: PoolElement, now: u64) {
        debug_assert_eq!(element.identifier, self.element.identifier);
        self.element = element;
        self.last_update = now;
    }

    /// Deadline implied by the registration life, counted from the last update.
    pub fn lifetime_deadline(&self) -> u64 {
        self.last_update + u64::from(self.element.registration_life) * 1000
    }
}
