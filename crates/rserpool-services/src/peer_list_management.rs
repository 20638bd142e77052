//! Peer list management: the registrar's view of its ENRP peers.
//!
//! Wraps a [`PeerList`] with the registration rules for static and dynamic
//! peers, the peer timers, and ownership checksum bookkeeping driven by
//! handlespace changes.

use std::fmt;

use rand::Rng;

use rserpool_core::checksum::ChecksumAccumulator;
use rserpool_core::wire::UNDEFINED_REGISTRAR_IDENTIFIER;
use rserpool_core::{PoolElementIdentifier, RegistrarIdentifier, RspError, TransportAddressBlock};

use crate::handlespace::{HandlespaceChange, HandlespaceObserver, OwnershipChecksums};
use crate::peer_list::{
    PeerHandle, PeerList, PeerListNode, TimerCode, PLNF_DYNAMIC, PLNF_NEW, PLNT_MAX_TIME_NO_RESPONSE,
};

/// Receives the user data of peers that leave the list.
pub trait UserDataDisposer<U> {
    fn dispose(&mut self, identifier: RegistrarIdentifier, user_data: U);
}

impl<U, F> UserDataDisposer<U> for F
where
    F: FnMut(RegistrarIdentifier, U),
{
    fn dispose(&mut self, identifier: RegistrarIdentifier, user_data: U) {
        self(identifier, user_data)
    }
}

/// A peer's stored ownership checksum disagrees with the handlespace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("ownership checksum of ${identifier:08x} is {stored}, handlespace has {expected}")]
pub struct ChecksumMismatch {
    pub identifier: RegistrarIdentifier,
    pub stored: ChecksumAccumulator,
    pub expected: ChecksumAccumulator,
}

#[derive(Debug)]
pub struct PeerListManagement<U, D> {
    list: PeerList<U>,
    disposer: D,
}

impl<U, D: UserDataDisposer<U>> PeerListManagement<U, D> {
    pub fn new(own_identifier: RegistrarIdentifier, disposer: D) -> Self {
        Self {
            list: PeerList::new(own_identifier),
            disposer,
        }
    }

    pub fn own_identifier(&self) -> RegistrarIdentifier {
        self.list.own_identifier()
    }

    pub fn peers(&self) -> &PeerList<U> {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&PeerListNode<U>> {
        self.list.get(handle)
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut PeerListNode<U>> {
        self.list.get_mut(handle)
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Add or refresh a peer.
    ///
    /// Dynamic peers must carry an identifier. When one is heard from for
    /// the first time at the address of a static placeholder, the
    /// placeholder takes its identifier in place and keeps its static
    /// flags. Static peers are always registered as placeholders.
    ///
    /// With `checksums` the peer's ownership checksum is recomputed from it.
    pub fn register(
        &mut self,
        identifier: RegistrarIdentifier,
        flags: u16,
        address_block: &TransportAddressBlock,
        now: u64,
        checksums: Option<&dyn OwnershipChecksums>,
    ) -> Result<PeerHandle, RspError> {
        if flags & PLNF_DYNAMIC != 0 {
            if identifier == UNDEFINED_REGISTRAR_IDENTIFIER {
                return Err(RspError::InvalidId);
            }
            let existing = self
                .list
                .find(identifier, None)
                .or_else(|| self.list.find(UNDEFINED_REGISTRAR_IDENTIFIER, Some(address_block)));
            if let Some(handle) = existing {
                if let Some(node) = self.list.get(handle).filter(|node| !node.is_dynamic()) {
                    let was_placeholder = !node.has_identifier();
                    self.list.set_identifier(handle, identifier)?;
                    if let Some(node) = self.list.get_mut(handle) {
                        node.last_update = now;
                        if was_placeholder {
                            node.flags |= PLNF_NEW;
                            tracing::info!(
                                peer = format_args!("${identifier:08x}"),
                                address = %node.address_block,
                                "static peer identified"
                            );
                        }
                    }
                    self.recompute_checksum(handle, checksums);
                    return Ok(handle);
                }
            }
        } else if identifier != UNDEFINED_REGISTRAR_IDENTIFIER {
            return Err(RspError::InvalidId);
        }

        let handle = self.list.add_or_update(identifier, flags, address_block, now)?;
        if self.list.get(handle).is_some_and(|node| node.is_new()) {
            tracing::info!(
                peer = format_args!("${identifier:08x}"),
                address = %address_block,
                dynamic = flags & PLNF_DYNAMIC != 0,
                "peer added"
            );
        }
        self.recompute_checksum(handle, checksums);
        Ok(handle)
    }

    fn recompute_checksum(&mut self, handle: PeerHandle, checksums: Option<&dyn OwnershipChecksums>) {
        let Some(checksums) = checksums else {
            return;
        };
        if let Some(node) = self.list.get_mut(handle) {
            node.ownership_checksum = if node.has_identifier() {
                checksums.ownership_checksum(node.identifier)
            } else {
                ChecksumAccumulator::INITIAL
            };
        }
    }

    /// Remove a peer. A static peer that had been identified falls back to
    /// an unidentified placeholder and keeps its user data.
    pub fn deregister_by_handle(&mut self, handle: PeerHandle) -> Result<(), RspError> {
        let node = self.list.get(handle).ok_or(RspError::NotFound)?;
        let identifier = node.identifier();
        let revert = !node.is_dynamic() && node.has_identifier();
        self.list.deactivate_timer(handle);

        if revert && self.list.set_identifier(handle, UNDEFINED_REGISTRAR_IDENTIFIER).is_ok() {
            if let Some(node) = self.list.get_mut(handle) {
                node.ownership_checksum = ChecksumAccumulator::INITIAL;
                node.status = 0;
                node.takeover = None;
            }
            tracing::info!(peer = format_args!("${identifier:08x}"), "static peer reverted to placeholder");
            return Ok(());
        }

        if let Some(mut node) = self.list.remove(handle) {
            tracing::info!(
                peer = format_args!("${identifier:08x}"),
                address = %node.address_block,
                "peer removed"
            );
            if let Some(user_data) = node.user_data.take() {
                self.disposer.dispose(identifier, user_data);
            }
        }
        Ok(())
    }

    pub fn deregister(
        &mut self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Result<(), RspError> {
        let handle = self
            .list
            .find(identifier, Some(address_block))
            .ok_or(RspError::NotFound)?;
        self.deregister_by_handle(handle)
    }

    /// Remove every peer, disposing of their user data.
    pub fn clear(&mut self) {
        for mut node in self.list.drain() {
            if let Some(user_data) = node.user_data.take() {
                self.disposer.dispose(node.identifier, user_data);
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Expect to hear from the peer within `timeout` of its last update.
    pub fn restart_expiry_timer(&mut self, handle: PeerHandle, timeout: u64) -> Result<(), RspError> {
        let last_update = self.list.get(handle).ok_or(RspError::NotFound)?.last_update;
        self.list.deactivate_timer(handle);
        self.list
            .activate_timer(handle, PLNT_MAX_TIME_NO_RESPONSE, last_update + timeout);
        Ok(())
    }

    pub fn activate_timer(&mut self, handle: PeerHandle, code: TimerCode, at: u64) {
        self.list.activate_timer(handle, code, at);
    }

    pub fn deactivate_timer(&mut self, handle: PeerHandle) {
        self.list.deactivate_timer(handle);
    }

    pub fn next_timer_timestamp(&self) -> Option<u64> {
        self.list.next_timer_timestamp()
    }

    pub fn first_timer(&self) -> Option<PeerHandle> {
        self.list.first_timer()
    }

    /// Peers whose timer is due at `now`, soonest first, with the timer code.
    pub fn expired_timers(&self, now: u64) -> Vec<(PeerHandle, TimerCode)> {
        self.list
            .timers()
            .take_while(|(_, node)| node.timer.is_some_and(|at| at <= now))
            .map(|(handle, node)| (handle, node.timer_code))
            .collect()
    }

    /// Deregister every peer whose timer is due. Returns how many.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let expired = self.expired_timers(now);
        for (handle, _) in &expired {
            // Listed by the timer index, so the handle is live.
            let _ = self.deregister_by_handle(*handle);
        }
        expired.len()
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn find(
        &self,
        identifier: RegistrarIdentifier,
        address_block: Option<&TransportAddressBlock>,
    ) -> Option<PeerHandle> {
        self.list.find(identifier, address_block)
    }

    pub fn find_nearest_prev(
        &self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Option<PeerHandle> {
        self.list.find_nearest_prev(identifier, address_block)
    }

    pub fn find_nearest_next(
        &self,
        identifier: RegistrarIdentifier,
        address_block: &TransportAddressBlock,
    ) -> Option<PeerHandle> {
        self.list.find_nearest_next(identifier, address_block)
    }

    pub fn first(&self) -> Option<PeerHandle> {
        self.list.first()
    }

    pub fn last(&self) -> Option<PeerHandle> {
        self.list.last()
    }

    pub fn next(&self, handle: PeerHandle) -> Option<PeerHandle> {
        self.list.next(handle)
    }

    pub fn prev(&self, handle: PeerHandle) -> Option<PeerHandle> {
        self.list.prev(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &PeerListNode<U>)> + '_ {
        self.list.iter()
    }

    pub fn random_peer(&self, rng: &mut impl Rng) -> Option<PeerHandle> {
        self.list.random(rng)
    }

    /// The identified peer whose identifier is farthest from the pool
    /// element's by XOR, if it beats our own distance.
    pub fn useful_peer_for_pe(&self, pe_identifier: PoolElementIdentifier) -> Option<PeerHandle> {
        let mut best_distance = self.list.own_identifier() ^ pe_identifier;
        let mut best = None;
        for (handle, node) in self.list.iter() {
            if !node.has_identifier() {
                continue;
            }
            let distance = node.identifier ^ pe_identifier;
            if distance > best_distance {
                best_distance = distance;
                best = Some(handle);
            }
        }
        best
    }

    // ── Checksums ────────────────────────────────────────────────────────────

    fn adjust_ownership(
        &mut self,
        home: RegistrarIdentifier,
        adjust: impl FnOnce(ChecksumAccumulator) -> ChecksumAccumulator,
    ) {
        if let Some(handle) = self.list.find(home, None) {
            if let Some(node) = self.list.get_mut(handle) {
                node.ownership_checksum = adjust(node.ownership_checksum);
            }
        }
    }

    /// Compare every identified peer's checksum against `checksums`.
    pub fn verify_checksums(&self, checksums: &dyn OwnershipChecksums) -> Result<(), ChecksumMismatch> {
        for (_, node) in self.list.iter().filter(|(_, node)| node.has_identifier()) {
            let expected = checksums.ownership_checksum(node.identifier);
            if expected != node.ownership_checksum {
                return Err(ChecksumMismatch {
                    identifier: node.identifier,
                    stored: node.ownership_checksum,
                    expected,
                });
            }
        }
        Ok(())
    }
}

impl<U, D: UserDataDisposer<U>> HandlespaceObserver for PeerListManagement<U, D> {
    fn on_pool_element_changed(&mut self, change: &HandlespaceChange) {
        match *change {
            HandlespaceChange::Created { home, checksum } => {
                self.adjust_ownership(home, |sum| sum + checksum);
            }
            HandlespaceChange::Updated {
                previous_home,
                previous_checksum,
                home,
                checksum,
            } => {
                self.adjust_ownership(previous_home, |sum| sum - previous_checksum);
                self.adjust_ownership(home, |sum| sum + checksum);
            }
            HandlespaceChange::Deleted { home, checksum } => {
                self.adjust_ownership(home, |sum| sum - checksum);
            }
        }
    }
}

impl<U, D> fmt::Display for PeerListManagement<U, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.list, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlespace::PoolHandlespace;
    use crate::peer_list::{PLNF_STATIC, PLNT_MAX_TIME_LAST_HEARD};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rserpool_core::{PolicyType, PoolElement, PoolHandle, PoolPolicySettings, TransportProtocol};

    type Disposed = Vec<(RegistrarIdentifier, &'static str)>;

    fn management() -> PeerListManagement<&'static str, impl FnMut(RegistrarIdentifier, &'static str)> {
        PeerListManagement::new(1, |_: RegistrarIdentifier, _: &'static str| {})
    }

    fn address(last: u8, port: u16) -> TransportAddressBlock {
        TransportAddressBlock::from_socket_addr(
            TransportProtocol::Udp,
            format!("10.0.0.{last}:{port}").parse().unwrap(),
            0,
        )
    }

    fn element(identifier: u32, home: u32) -> PoolElement {
        PoolElement {
            identifier,
            home_registrar: home,
            registration_life: 1_000,
            policy: PoolPolicySettings::new(PolicyType::RoundRobin),
            user_transport: address(200, 7),
            registrator_transport: None,
        }
    }

    #[test]
    fn dynamic_peer_needs_identifier_static_peer_must_not_have_one() {
        let mut peers = management();
        assert_eq!(
            peers.register(0, PLNF_DYNAMIC, &address(2, 3864), 0, None),
            Err(RspError::InvalidId)
        );
        assert_eq!(
            peers.register(5, PLNF_STATIC, &address(2, 3864), 0, None),
            Err(RspError::InvalidId)
        );
        assert_eq!(
            peers.register(1, PLNF_DYNAMIC, &address(2, 3864), 0, None),
            Err(RspError::OwnId)
        );
        assert!(peers.is_empty());
    }

    #[test]
    fn placeholder_is_resolved_in_place_and_reverts() {
        let mut disposed = Disposed::new();
        let mut peers = PeerListManagement::new(1, |id, data| disposed.push((id, data)));
        let placeholder = peers.register(0, PLNF_STATIC, &address(2, 3864), 0, None).unwrap();
        peers.get_mut(placeholder).unwrap().user_data = Some("sync");

        let resolved = peers.register(7, PLNF_DYNAMIC, &address(2, 3864), 10, None).unwrap();
        assert_eq!(resolved, placeholder);
        let node = peers.get(resolved).unwrap();
        assert_eq!(node.identifier(), 7);
        assert!(!node.is_dynamic());
        assert!(node.is_new());
        assert_eq!(node.last_update(), 10);
        assert_eq!(peers.len(), 1);

        peers.deregister(7, &address(2, 3864)).unwrap();
        let node = peers.get(placeholder).unwrap();
        assert_eq!(node.identifier(), 0);
        assert_eq!(node.user_data, Some("sync"));

        peers.deregister_by_handle(placeholder).unwrap();
        assert!(peers.is_empty());
        assert_eq!(peers.deregister(0, &address(2, 3864)), Err(RspError::NotFound));
        drop(peers);
        assert_eq!(disposed, vec![(0, "sync")]);
    }

    #[test]
    fn dynamic_peer_is_updated_not_duplicated() {
        let mut peers = management();
        let first = peers.register(7, PLNF_DYNAMIC, &address(2, 3864), 0, None).unwrap();
        assert!(peers.get(first).unwrap().is_new());
        let again = peers.register(7, PLNF_DYNAMIC, &address(3, 3864), 5, None).unwrap();
        assert_eq!(first, again);
        assert!(!peers.get(again).unwrap().is_new());
        assert_eq!(peers.get(again).unwrap().address_block(), &address(3, 3864));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn expiry_timer_counts_from_last_update() {
        let mut peers = management();
        let early = peers.register(7, PLNF_DYNAMIC, &address(2, 3864), 1_000, None).unwrap();
        let late = peers.register(8, PLNF_DYNAMIC, &address(3, 3864), 4_000, None).unwrap();
        peers.restart_expiry_timer(early, 5_000).unwrap();
        peers.restart_expiry_timer(late, 5_000).unwrap();
        peers.activate_timer(late, PLNT_MAX_TIME_LAST_HEARD, 20_000);

        assert_eq!(peers.next_timer_timestamp(), Some(6_000));
        assert_eq!(peers.first_timer(), Some(early));
        assert_eq!(peers.expired_timers(6_000), vec![(early, PLNT_MAX_TIME_NO_RESPONSE)]);
        assert_eq!(peers.purge_expired(10_000), 1);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.purge_expired(10_000), 0);
        assert_eq!(peers.next_timer_timestamp(), Some(20_000));
    }

    #[test]
    fn ownership_checksum_follows_handlespace() {
        let mut peers = management();
        let mut handlespace = PoolHandlespace::new();
        let pool = PoolHandle::try_from("EchoPool").unwrap();
        let peer = peers.register(100, PLNF_DYNAMIC, &address(1, 3863), 0, None).unwrap();

        peers.on_pool_element_changed(&HandlespaceChange::Created {
            home: 100,
            checksum: ChecksumAccumulator::from_raw(42),
        });
        assert_eq!(peers.get(peer).unwrap().ownership_accumulator().raw(), 42);
        peers.on_pool_element_changed(&HandlespaceChange::Deleted {
            home: 100,
            checksum: ChecksumAccumulator::from_raw(42),
        });
        assert_eq!(peers.get(peer).unwrap().ownership_accumulator().raw(), 0);
        assert_eq!(peers.purge_expired(u64::MAX), 0);

        handlespace.register_pool_element(&pool, element(9, 100), 0, &mut peers).unwrap();
        assert_eq!(peers.verify_checksums(&handlespace), Ok(()));
    }

    #[test]
    fn checksums_stay_consistent_under_random_churn() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut peers = management();
        let mut handlespace = PoolHandlespace::new();
        let homes = [100u32, 200, 300];
        for (i, home) in homes.iter().enumerate() {
            peers.register(*home, PLNF_DYNAMIC, &address(i as u8 + 2, 3864), 0, None).unwrap();
        }
        let pools: Vec<PoolHandle> = ["A", "B", "C"].iter().map(|n| PoolHandle::try_from(*n).unwrap()).collect();

        for _ in 0..500 {
            let pool = &pools[rng.gen_range(0..pools.len())];
            let identifier = rng.gen_range(1..20);
            match rng.gen_range(0..4) {
                0 => {
                    let _ = handlespace.deregister_pool_element(pool, identifier, &mut peers);
                }
                1 => {
                    let home = homes[rng.gen_range(0..homes.len())];
                    let _ = handlespace.update_ownership(pool, identifier, home, &mut peers);
                }
                _ => {
                    let home = homes[rng.gen_range(0..homes.len())];
                    handlespace
                        .register_pool_element(pool, element(identifier, home), 0, &mut peers)
                        .unwrap();
                }
            }
            assert_eq!(peers.verify_checksums(&handlespace), Ok(()));
        }

        let late = peers.register(400, PLNF_DYNAMIC, &address(9, 3864), 0, Some(&handlespace)).unwrap();
        assert_eq!(peers.get(late).unwrap().ownership_accumulator(), ChecksumAccumulator::INITIAL);
        let resync = peers.find(200, None).unwrap();
        peers.get_mut(resync).unwrap().ownership_checksum = ChecksumAccumulator::INITIAL;
        if handlespace.ownership_checksum(200) != ChecksumAccumulator::INITIAL {
            assert_eq!(peers.verify_checksums(&handlespace).unwrap_err().identifier, 200);
        }
        peers.register(200, PLNF_DYNAMIC, &address(3, 3864), 0, Some(&handlespace)).unwrap();
        assert_eq!(peers.verify_checksums(&handlespace), Ok(()));
    }

    #[test]
    fn useful_peer_maximises_xor_distance() {
        let mut peers = PeerListManagement::new(0b0001, |_: RegistrarIdentifier, _: ()| {});
        peers.register(0b0100, PLNF_DYNAMIC, &address(2, 3864), 0, None).unwrap();
        let far = peers.register(0b1000, PLNF_DYNAMIC, &address(3, 3864), 0, None).unwrap();
        peers.register(0b1001, PLNF_DYNAMIC, &address(4, 3864), 0, None).unwrap();

        // 0b1000 ^ 0b0001 = 9 beats 0b1001 ^ 0b0001 = 8.
        assert_eq!(peers.useful_peer_for_pe(0b0001), Some(far));
        // Own distance 0b1110 ^ 0b0001 = 15 cannot be beaten.
        let mut alone = PeerListManagement::new(0b1110, |_: RegistrarIdentifier, _: ()| {});
        alone.register(0b0100, PLNF_DYNAMIC, &address(2, 3864), 0, None).unwrap();
        assert_eq!(alone.useful_peer_for_pe(0b0001), None);
    }
}
