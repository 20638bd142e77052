use crate::*;

use rserpool_core::message::ResolutionOutcome;
use rserpool_core::wire::EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND;
use rserpool_services::OwnershipChecksums;

/// Addresses of three fully meshed registrars after they have met.
fn three_registrars(network: &mut Network) -> [SocketAddr; 3] {
    let r1 = network.add_registrar(0x01, 3001, &[3002, 3003]);
    let r2 = network.add_registrar(0x02, 3002, &[3001, 3003]);
    let r3 = network.add_registrar(0x03, 3003, &[3001, 3002]);
    network.announce_all().unwrap();
    [r1, r2, r3]
}

fn resolved_elements(message: &RSerPoolMessage) -> Vec<PoolElement> {
    match &message.body {
        MessageBody::HandleResolutionResponse {
            outcome: ResolutionOutcome::Resolved { elements, .. },
            ..
        } => elements.clone(),
        other => panic!("expected a resolved handle, got {other:?}"),
    }
}

/// Two registrars find each other from one static entry.
#[test]
fn test_static_peer_introduces_registrars() {
    let mut network = Network::new(EnrpConfig::default());
    let r1 = network.add_registrar(0x01, 3001, &[]);
    let r2 = network.add_registrar(0x02, 3002, &[3001]);
    network.announce_all().unwrap();

    let peers_of = |address| {
        network
            .registrar(address)
            .peers()
            .iter()
            .map(|(_, node)| node.identifier())
            .collect::<Vec<_>>()
    };
    assert_eq!(peers_of(r1), vec![0x02]);
    assert_eq!(peers_of(r2), vec![0x01]);

    // Both already agree on an empty handlespace.
    assert_eq!(network.delivered(MessageType::HandleTableRequest), 0);
}

/// A registration at one registrar resolves at the other.
#[test]
fn test_registration_is_shared_between_registrars() {
    let mut network = Network::new(EnrpConfig::default());
    let r1 = network.add_registrar(0x01, 3001, &[]);
    let r2 = network.add_registrar(0x02, 3002, &[3001]);
    network.announce_all().unwrap();

    let handle = pool("EchoPool");
    let pe = addr(9001);
    network.send(pe, r1, registration(&handle, element(0x100, 7001))).unwrap();

    let replies = network.take_inbox(pe);
    assert_eq!(replies.len(), 1);
    assert!(matches!(
        replies[0].body,
        MessageBody::RegistrationResponse { identifier: 0x100, error: None, .. }
    ));
    assert_eq!(network.delivered(MessageType::HandleUpdate), 1);

    let user = addr(9500);
    network.send(user, r2, resolution(&handle)).unwrap();
    let elements = resolved_elements(&network.take_inbox(user)[0]);
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].identifier, 0x100);
    assert_eq!(elements[0].home_registrar, 0x01);
    assert_eq!(elements[0].user_transport, udp_block(addr(7001)));

    // The next round of announcements finds matching checksums.
    network.clear_log();
    network.advance(1_000).unwrap();
    network.announce_all().unwrap();
    assert_eq!(network.delivered(MessageType::HandleTableRequest), 0);
    assert_consistent(&network, r1);
    assert_consistent(&network, r2);

    // Deregistration reaches the peer too.
    network
        .send(
            pe,
            r1,
            RSerPoolMessage::new(MessageBody::Deregistration {
                handle: handle.clone(),
                identifier: 0x100,
            }),
        )
        .unwrap();
    assert_eq!(network.registrar(r2).handlespace().pool_element_count(), 0);
    assert_consistent(&network, r2);
}

/// A registrar joining late pulls the handle table in several parts.
#[test]
fn test_late_joiner_synchronises_handle_table() {
    let config = EnrpConfig {
        max_elements_per_handle_table_request: 2,
        ..EnrpConfig::default()
    };
    let mut network = Network::new(config);
    let r1 = network.add_registrar(0x01, 3001, &[]);

    let handle = pool("EchoPool");
    for identifier in 1..=3 {
        let pe = addr(9000 + identifier as u16);
        network
            .send(pe, r1, registration(&handle, element(identifier, 7000 + identifier as u16)))
            .unwrap();
    }
    network.send(addr(9010), r1, registration(&pool("Other"), element(10, 7010))).unwrap();

    let r3 = network.add_registrar(0x03, 3003, &[3001]);
    network.announce_all().unwrap();

    assert_eq!(network.registrar(r3).handlespace().pool_element_count(), 4);
    assert_eq!(network.registrar(r3).handlespace().owned_by(0x01).len(), 4);
    assert_eq!(network.delivered(MessageType::HandleTableRequest), 2);
    assert_eq!(network.delivered(MessageType::HandleTableResponse), 2);
    assert_consistent(&network, r3);

    let peer = network.registrar(r3).peers().find(0x01, None).unwrap();
    let node = network.registrar(r3).peers().get(peer).unwrap();
    assert_eq!(
        node.ownership_checksum(),
        network.registrar(r1).handlespace().ownership_checksum(0x01).finish()
    );
}

/// The continuation flag survives the codec.
#[test]
fn test_more_to_send_crosses_the_wire() {
    let response = RSerPoolMessage::new(MessageBody::HandleTableResponse {
        sender: 0x01,
        receiver: 0x03,
        pools: Vec::new(),
    })
    .with_flags(EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND);
    let received = over_the_wire(&response, addr(3001)).unwrap();
    assert!(received.has_flag(EHF_HANDLE_TABLE_RESPONSE_MORE_TO_SEND));
}

/// When a registrar dies, the surviving peer with the highest identifier
/// adopts its pool elements and the other one agrees.
#[test]
fn test_takeover_of_failed_registrar() {
    let config = EnrpConfig::default();
    let (last_heard, no_response) = (config.max_time_last_heard_ms, config.max_time_no_response_ms);
    let mut network = Network::new(config);
    let [r1, r2, r3] = three_registrars(&mut network);
    for address in [r1, r2, r3] {
        assert_eq!(network.registrar(address).peers().len(), 2);
    }

    let handle = pool("EchoPool");
    network.send(addr(9001), r3, registration(&handle, element(0x300, 7300))).unwrap();
    assert_eq!(network.registrar(r1).handlespace().owned_by(0x03).len(), 1);

    network.remove_registrar(r3).unwrap();
    network.clear_log();

    // Probes go unanswered, then both survivors start a takeover.
    network.advance(last_heard).unwrap();
    network.advance(no_response).unwrap();
    assert_eq!(network.delivered(MessageType::InitTakeover), 2);
    assert_eq!(network.delivered(MessageType::InitTakeoverAck), 1);
    assert_eq!(network.delivered(MessageType::TakeoverServer), 1);

    for address in [r1, r2] {
        let state = network.registrar(address);
        assert!(state.peers().find(0x03, None).is_none(), "{address} still lists the dead registrar");
        assert_eq!(state.handlespace().owned_by(0x02).len(), 1);
        assert!(state.handlespace().owned_by(0x03).is_empty());
        assert_consistent(&network, address);
    }

    // Users can still reach the element.
    let user = addr(9500);
    network.send(user, r1, resolution(&handle)).unwrap();
    let elements = resolved_elements(&network.take_inbox(user)[0]);
    assert_eq!(elements[0].home_registrar, 0x02);
}

/// A peer list request is answered with every other registrar known.
#[test]
fn test_list_request_names_other_registrars() {
    let mut network = Network::new(EnrpConfig::default());
    let [r1, ..] = three_registrars(&mut network);

    let asker = addr(3099);
    network
        .send(
            asker,
            r1,
            RSerPoolMessage::new(MessageBody::ListRequest {
                sender: 0x99,
                receiver: 0x01,
            }),
        )
        .unwrap();
    let inbox = network.take_inbox(asker);
    match &inbox[0].body {
        MessageBody::ListResponse { servers, .. } => {
            let mut identifiers: Vec<_> = servers.iter().map(|server| server.server_id).collect();
            identifiers.sort_unstable();
            assert_eq!(identifiers, vec![0x02, 0x03]);
        }
        other => panic!("expected a list response, got {other:?}"),
    }
}
