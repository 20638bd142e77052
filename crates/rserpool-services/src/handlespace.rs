//! Pool handlespace: every pool this registrar knows, keyed by pool handle.
//!
//! Each mutation reports a [`HandlespaceChange`] to the observer passed in,
//! synchronously, before the call returns. The peer list uses that to keep
//! per-registrar ownership checksums current without rescanning.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rserpool_core::checksum::ChecksumAccumulator;
use rserpool_core::{
    PolicyType, PoolElement, PoolElementIdentifier, PoolElementNode, PoolHandle, PoolPolicySettings,
    RegistrarIdentifier, RspError, TransportProtocol,
};

/// A pool element was added, changed or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlespaceChange {
    Created {
        home: RegistrarIdentifier,
        checksum: ChecksumAccumulator,
    },
    /// Re-registration. The home registrar may have changed.
    Updated {
        previous_home: RegistrarIdentifier,
        previous_checksum: ChecksumAccumulator,
        home: RegistrarIdentifier,
        checksum: ChecksumAccumulator,
    },
    Deleted {
        home: RegistrarIdentifier,
        checksum: ChecksumAccumulator,
    },
}

pub trait HandlespaceObserver {
    fn on_pool_element_changed(&mut self, change: &HandlespaceChange);
}

impl HandlespaceObserver for () {
    fn on_pool_element_changed(&mut self, _change: &HandlespaceChange) {}
}

/// Source of truth for ownership checksums, recomputed from scratch.
pub trait OwnershipChecksums {
    /// Sum of the checksums of all pool elements homed at `home`.
    fn ownership_checksum(&self, home: RegistrarIdentifier) -> ChecksumAccumulator;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Created,
    Updated,
}

#[derive(Debug)]
struct Pool {
    policy: PolicyType,
    protocol: TransportProtocol,
    control_channel: bool,
    elements: BTreeMap<PoolElementIdentifier, PoolElementNode>,
    /// Round-robin position: selection starts after this element.
    cursor: Option<PoolElementIdentifier>,
}

impl Pool {
    fn new(element: &PoolElement) -> Self {
        Self {
            policy: element.policy.policy_type,
            protocol: element.user_transport.protocol(),
            control_channel: element.user_transport.has_control_channel(),
            elements: BTreeMap::new(),
            cursor: None,
        }
    }

    fn check_compatibility(&self, element: &PoolElement) -> Result<(), RspError> {
        if element.policy.policy_type != self.policy {
            return Err(RspError::IncompatiblePoolPolicy);
        }
        if element.user_transport.protocol() != self.protocol {
            return Err(RspError::WrongProtocol);
        }
        if element.user_transport.has_control_channel() != self.control_channel {
            return Err(RspError::WrongControlChannelHandling);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PoolHandlespace {
    pools: BTreeMap<PoolHandle, Pool>,
    timers: BTreeSet<(u64, PoolHandle, PoolElementIdentifier)>,
    checksum: ChecksumAccumulator,
}

impl PoolHandlespace {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Add a pool element, or update it if already registered.
    ///
    /// A new pool adopts the element's policy and transport. Elements joining
    /// an existing pool must match them.
    pub fn register_pool_element(
        &mut self,
        handle: &PoolHandle,
        mut element: PoolElement,
        now: u64,
        observer: &mut dyn HandlespaceObserver,
    ) -> Result<RegistrationOutcome, RspError> {
        element.policy = element.policy.normalized();

        match self.pools.get(handle) {
            Some(pool) => pool.check_compatibility(&element)?,
            None => tracing::debug!(%handle, policy = element.policy.policy_type.name(), "creating pool"),
        }
        let pool = self
            .pools
            .entry(handle.clone())
            .or_insert_with(|| Pool::new(&element));

        if let Some(node) = pool.elements.get_mut(&element.identifier) {
            let previous_home = node.home_registrar();
            let previous_checksum = node.checksum;
            node.update(element, now);
            observer.on_pool_element_changed(&HandlespaceChange::Updated {
                previous_home,
                previous_checksum,
                home: node.home_registrar(),
                checksum: node.checksum,
            });
            return Ok(RegistrationOutcome::Updated);
        }

        let node = PoolElementNode::new(handle, element, now);
        let change = HandlespaceChange::Created {
            home: node.home_registrar(),
            checksum: node.checksum,
        };
        self.checksum += node.checksum;
        pool.elements.insert(node.identifier(), node);
        observer.on_pool_element_changed(&change);
        Ok(RegistrationOutcome::Created)
    }

    /// Remove a pool element. A pool left empty is removed too.
    pub fn deregister_pool_element(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
        observer: &mut dyn HandlespaceObserver,
    ) -> Result<PoolElementNode, RspError> {
        let pool = self.pools.get_mut(handle).ok_or(RspError::NotFound)?;
        let node = pool.elements.remove(&identifier).ok_or(RspError::NotFound)?;
        if pool.elements.is_empty() {
            tracing::debug!(%handle, "removing empty pool");
            self.pools.remove(handle);
        }
        if let Some(at) = node.expiry {
            self.timers.remove(&(at, handle.clone(), identifier));
        }
        self.checksum -= node.checksum;
        observer.on_pool_element_changed(&HandlespaceChange::Deleted {
            home: node.home_registrar(),
            checksum: node.checksum,
        });
        Ok(node)
    }

    /// Move a pool element to another home registrar.
    pub fn update_ownership(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
        home: RegistrarIdentifier,
        observer: &mut dyn HandlespaceObserver,
    ) -> Result<(), RspError> {
        let node = self
            .pools
            .get_mut(handle)
            .and_then(|pool| pool.elements.get_mut(&identifier))
            .ok_or(RspError::NotFound)?;
        let previous_home = node.home_registrar();
        node.element.home_registrar = home;
        observer.on_pool_element_changed(&HandlespaceChange::Updated {
            previous_home,
            previous_checksum: node.checksum,
            home,
            checksum: node.checksum,
        });
        Ok(())
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    pub fn find_pool_element(&self, handle: &PoolHandle, identifier: PoolElementIdentifier) -> Option<&PoolElementNode> {
        self.pools.get(handle)?.elements.get(&identifier)
    }

    /// Elements of one pool in identifier order.
    pub fn pool_elements<'a>(&'a self, handle: &PoolHandle) -> impl Iterator<Item = &'a PoolElementNode> + 'a {
        self.pools
            .get(handle)
            .into_iter()
            .flat_map(|pool| pool.elements.values())
    }

    pub fn pool_policy(&self, handle: &PoolHandle) -> Option<PolicyType> {
        self.pools.get(handle).map(|pool| pool.policy)
    }

    pub fn pools(&self) -> impl Iterator<Item = &PoolHandle> {
        self.pools.keys()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_element_count(&self) -> usize {
        self.pools.values().map(|pool| pool.elements.len()).sum()
    }

    /// Every element homed at `home`, in handle and identifier order.
    pub fn owned_by(&self, home: RegistrarIdentifier) -> Vec<(PoolHandle, PoolElementIdentifier)> {
        self.iter()
            .filter(|(_, node)| node.home_registrar() == home)
            .map(|(handle, node)| (handle.clone(), node.identifier()))
            .collect()
    }

    /// All elements in handle and identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&PoolHandle, &PoolElementNode)> {
        self.pools
            .iter()
            .flat_map(|(handle, pool)| pool.elements.values().map(move |node| (handle, node)))
    }

    /// Up to `max` elements for a Handle Table Response, in handle and
    /// identifier order, starting after `start_after`. With `owner` set only
    /// elements homed there are included.
    pub fn handle_table(
        &self,
        owner: Option<RegistrarIdentifier>,
        start_after: Option<(&PoolHandle, PoolElementIdentifier)>,
        max: usize,
    ) -> Vec<(&PoolHandle, &PoolElementNode)> {
        self.iter()
            .skip_while(|(handle, node)| match start_after {
                Some((after_handle, after_identifier)) => {
                    (*handle, node.identifier()) <= (after_handle, after_identifier)
                }
                None => false,
            })
            .filter(|(_, node)| owner.map_or(true, |home| node.home_registrar() == home))
            .take(max)
            .collect()
    }

    // ── Selection ────────────────────────────────────────────────────────────

    /// Handle resolution: the pool's policy and up to `max` of its elements,
    /// best candidates first.
    pub fn select(
        &mut self,
        handle: &PoolHandle,
        max: usize,
    ) -> Result<(PoolPolicySettings, Vec<PoolElement>), RspError> {
        let pool = self.pools.get_mut(handle).ok_or(RspError::NotFound)?;
        let max = max.max(1);
        let mut candidates: Vec<&PoolElementNode> = pool.elements.values().collect();

        match pool.policy {
            PolicyType::RoundRobin | PolicyType::WeightedRoundRobin => {
                let start = pool
                    .cursor
                    .and_then(|cursor| candidates.iter().position(|node| node.identifier() > cursor))
                    .unwrap_or(0);
                candidates.rotate_left(start);
                pool.cursor = candidates.first().map(|node| node.identifier());
            }
            PolicyType::Priority => {
                candidates.sort_by(|a, b| b.element.policy.weight.cmp(&a.element.policy.weight));
            }
            policy if policy.is_adaptive() => {
                candidates.sort_by_key(|node| node.element.policy.load);
            }
            _ => {}
        }

        let elements = candidates
            .into_iter()
            .take(max)
            .map(|node| node.element.clone())
            .collect();
        Ok((PoolPolicySettings::new(pool.policy), elements))
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    /// Arm the element's expiry at its last update plus its registration
    /// life. Returns the deadline.
    pub fn restart_pool_element_expiry(
        &mut self,
        handle: &PoolHandle,
        identifier: PoolElementIdentifier,
    ) -> Result<u64, RspError> {
        let node = self
            .pools
            .get_mut(handle)
            .and_then(|pool| pool.elements.get_mut(&identifier))
            .ok_or(RspError::NotFound)?;
        if let Some(at) = node.expiry.take() {
            self.timers.remove(&(at, handle.clone(), identifier));
        }
        let deadline = node.lifetime_deadline();
        node.expiry = Some(deadline);
        self.timers.insert((deadline, handle.clone(), identifier));
        Ok(deadline)
    }

    pub fn next_timer_timestamp(&self) -> Option<u64> {
        self.timers.first().map(|(at, _, _)| *at)
    }

    /// Deregister every element whose expiry is at or before `now`.
    pub fn purge_expired_pool_elements(&mut self, now: u64, observer: &mut dyn HandlespaceObserver) -> usize {
        let expired: Vec<(PoolHandle, PoolElementIdentifier)> = self
            .timers
            .iter()
            .take_while(|(at, _, _)| *at <= now)
            .map(|(_, handle, identifier)| (handle.clone(), *identifier))
            .collect();
        for (handle, identifier) in &expired {
            tracing::debug!(%handle, identifier = format_args!("{identifier:#010x}"), "pool element expired");
            // Listed in the timer set, so it is registered.
            let _ = self.deregister_pool_element(handle, *identifier, observer);
        }
        expired.len()
    }

    // ── Checksums ────────────────────────────────────────────────────────────

    /// Sum of every element's checksum.
    pub fn handlespace_checksum(&self) -> ChecksumAccumulator {
        self.checksum
    }

    /// Drop everything without notifying anyone.
    pub fn clear(&mut self) {
        self.pools.clear();
        self.timers.clear();
        self.checksum = ChecksumAccumulator::INITIAL;
    }
}

impl OwnershipChecksums for PoolHandlespace {
    fn ownership_checksum(&self, home: RegistrarIdentifier) -> ChecksumAccumulator {
        self.iter()
            .filter(|(_, node)| node.home_registrar() == home)
            .map(|(_, node)| node.checksum)
            .sum()
    }
}

impl fmt::Display for PoolHandlespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Handlespace: {} pools, {} elements, checksum ${:04x}",
            self.pool_count(),
            self.pool_element_count(),
            self.checksum.finish()
        )?;
        for (handle, pool) in &self.pools {
            writeln!(f, " + {handle} ({}, {} elements)", pool.policy.name(), pool.elements.len())?;
            for node in pool.elements.values() {
                writeln!(f, "   - {}", node.element)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rserpool_core::TransportAddressBlock;

    impl HandlespaceObserver for Vec<HandlespaceChange> {
        fn on_pool_element_changed(&mut self, change: &HandlespaceChange) {
            self.push(*change);
        }
    }

    fn handle(name: &str) -> PoolHandle {
        PoolHandle::try_from(name).unwrap()
    }

    fn element(identifier: u32, home: u32, policy: PoolPolicySettings) -> PoolElement {
        PoolElement {
            identifier,
            home_registrar: home,
            registration_life: 1_000,
            policy,
            user_transport: TransportAddressBlock::from_socket_addr(
                TransportProtocol::Udp,
                "10.0.0.5:7".parse().unwrap(),
                0,
            ),
            registrator_transport: None,
        }
    }

    fn rr(identifier: u32, home: u32) -> PoolElement {
        element(identifier, home, PoolPolicySettings::new(PolicyType::RoundRobin))
    }

    #[test]
    fn registration_reports_create_then_update() {
        let mut handlespace = PoolHandlespace::new();
        let mut changes = Vec::new();
        let pool = handle("EchoPool");

        let outcome = handlespace.register_pool_element(&pool, rr(1, 100), 0, &mut changes).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Created);
        let checksum = handlespace.find_pool_element(&pool, 1).unwrap().checksum;

        let outcome = handlespace.register_pool_element(&pool, rr(1, 200), 5, &mut changes).unwrap();
        assert_eq!(outcome, RegistrationOutcome::Updated);
        assert_eq!(
            changes,
            vec![
                HandlespaceChange::Created { home: 100, checksum },
                HandlespaceChange::Updated {
                    previous_home: 100,
                    previous_checksum: checksum,
                    home: 200,
                    checksum,
                },
            ]
        );
        assert_eq!(handlespace.handlespace_checksum(), checksum);
    }

    #[test]
    fn pool_rejects_incompatible_elements() {
        let mut handlespace = PoolHandlespace::new();
        let pool = handle("EchoPool");
        handlespace.register_pool_element(&pool, rr(1, 100), 0, &mut ()).unwrap();

        let lu = element(2, 100, PoolPolicySettings::loaded(PolicyType::LeastUsed, 0, 0));
        assert_eq!(
            handlespace.register_pool_element(&pool, lu, 0, &mut ()),
            Err(RspError::IncompatiblePoolPolicy)
        );

        let mut tcp = rr(3, 100);
        tcp.user_transport =
            TransportAddressBlock::from_socket_addr(TransportProtocol::Tcp, "10.0.0.5:7".parse().unwrap(), 0);
        assert_eq!(
            handlespace.register_pool_element(&pool, tcp, 0, &mut ()),
            Err(RspError::WrongProtocol)
        );
        assert_eq!(handlespace.pool_element_count(), 1);
    }

    #[test]
    fn deregistration_removes_empty_pool() {
        let mut handlespace = PoolHandlespace::new();
        let mut changes = Vec::new();
        let pool = handle("EchoPool");
        handlespace.register_pool_element(&pool, rr(1, 100), 0, &mut changes).unwrap();
        let node = handlespace.deregister_pool_element(&pool, 1, &mut changes).unwrap();

        assert_eq!(
            changes.last(),
            Some(&HandlespaceChange::Deleted {
                home: 100,
                checksum: node.checksum
            })
        );
        assert_eq!(handlespace.pool_count(), 0);
        assert_eq!(handlespace.handlespace_checksum(), ChecksumAccumulator::INITIAL);
        assert_eq!(
            handlespace.deregister_pool_element(&pool, 1, &mut changes).unwrap_err(),
            RspError::NotFound
        );
    }

    #[test]
    fn expired_elements_are_purged_in_deadline_order() {
        let mut handlespace = PoolHandlespace::new();
        let pool = handle("EchoPool");
        for (identifier, registered_at) in [(1, 0), (2, 500_000), (3, 2_000_000)] {
            handlespace.register_pool_element(&pool, rr(identifier, 100), registered_at, &mut ()).unwrap();
            handlespace.restart_pool_element_expiry(&pool, identifier).unwrap();
        }
        assert_eq!(handlespace.next_timer_timestamp(), Some(1_000_000));

        assert_eq!(handlespace.purge_expired_pool_elements(1_500_000, &mut ()), 2);
        assert_eq!(handlespace.pool_elements(&pool).map(|n| n.identifier()).collect::<Vec<_>>(), vec![3]);
        assert_eq!(handlespace.next_timer_timestamp(), Some(3_000_000));
    }

    #[test]
    fn handle_table_continues_after_last_entry() {
        let mut handlespace = PoolHandlespace::new();
        for name in ["A", "B"] {
            for identifier in 1..=3 {
                let home = if identifier == 2 { 200 } else { 100 };
                handlespace.register_pool_element(&handle(name), rr(identifier, home), 0, &mut ()).unwrap();
            }
        }

        let first = handlespace.handle_table(Some(100), None, 3);
        let ids: Vec<(String, u32)> = first.iter().map(|(h, n)| (h.to_string(), n.identifier())).collect();
        assert_eq!(ids, vec![("A".into(), 1), ("A".into(), 3), ("B".into(), 1)]);

        let (last_handle, last_node) = first[2];
        let rest = handlespace.handle_table(Some(100), Some((last_handle, last_node.identifier())), 3);
        let ids: Vec<(String, u32)> = rest.iter().map(|(h, n)| (h.to_string(), n.identifier())).collect();
        assert_eq!(ids, vec![("B".into(), 3)]);
    }

    #[test]
    fn round_robin_selection_rotates() {
        let mut handlespace = PoolHandlespace::new();
        let pool = handle("EchoPool");
        for identifier in 1..=3 {
            handlespace.register_pool_element(&pool, rr(identifier, 100), 0, &mut ()).unwrap();
        }
        let first: Vec<u32> = handlespace.select(&pool, 1).unwrap().1.iter().map(|e| e.identifier).collect();
        let second: Vec<u32> = handlespace.select(&pool, 1).unwrap().1.iter().map(|e| e.identifier).collect();
        let third: Vec<u32> = handlespace.select(&pool, 3).unwrap().1.iter().map(|e| e.identifier).collect();
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2]);
        assert_eq!(third, vec![3, 1, 2]);
    }

    #[test]
    fn least_used_selection_prefers_low_load() {
        let mut handlespace = PoolHandlespace::new();
        let pool = handle("LoadPool");
        for (identifier, load) in [(1, 900), (2, 100), (3, 500)] {
            let lu = element(identifier, 100, PoolPolicySettings::loaded(PolicyType::LeastUsed, load, 0));
            handlespace.register_pool_element(&pool, lu, 0, &mut ()).unwrap();
        }
        let (policy, elements) = handlespace.select(&pool, 2).unwrap();
        assert_eq!(policy.policy_type, PolicyType::LeastUsed);
        assert_eq!(elements.iter().map(|e| e.identifier).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(handlespace.select(&handle("Nope"), 2).unwrap_err(), RspError::NotFound);
    }

    #[test]
    fn ownership_checksum_sums_homed_elements() {
        let mut handlespace = PoolHandlespace::new();
        let pool = handle("EchoPool");
        handlespace.register_pool_element(&pool, rr(1, 100), 0, &mut ()).unwrap();
        handlespace.register_pool_element(&pool, rr(2, 200), 0, &mut ()).unwrap();
        let one = handlespace.find_pool_element(&pool, 1).unwrap().checksum;
        let two = handlespace.find_pool_element(&pool, 2).unwrap().checksum;

        assert_eq!(handlespace.ownership_checksum(100), one);
        handlespace.update_ownership(&pool, 2, 100, &mut ()).unwrap();
        assert_eq!(handlespace.ownership_checksum(100), one + two);
        assert_eq!(handlespace.ownership_checksum(200), ChecksumAccumulator::INITIAL);
        assert_eq!(handlespace.owned_by(100).len(), 2);
    }
}
