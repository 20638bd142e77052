use crate::*;

use std::time::Duration;

use rserpool_core::message::ResolutionOutcome;
use rserpool_core::time::now_micros;
use rserpool_core::wire::PPID_ASAP;
use rserpool_core::RspError;
use tokio::net::UdpSocket;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Registrar serving ASAP on a loopback socket, the way the daemon's
/// listener does.
async fn serve_asap(socket: UdpSocket, mut state: RegistrarState) -> Result<()> {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let replies = match decode(&buf[..len], PPID_ASAP, Some(from)) {
            Ok(message) => state.handle_message(message, from, now_micros()),
            Err(failure) => failure
                .error_reply(state.identifier())
                .map(|message| Outgoing { destination: from, message })
                .into_iter()
                .collect(),
        };
        for Outgoing { destination, message } in replies {
            let encoded = encode(&message, MAX_MESSAGE_SIZE)?;
            socket.send_to(&encoded.bytes, destination).await?;
        }
    }
}

async fn start_registrar() -> Result<SocketAddr> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let address = socket.local_addr()?;
    let state = RegistrarState::new(0x51, udp_block(address), &EnrpConfig::default());
    tokio::spawn(serve_asap(socket, state));
    Ok(address)
}

async fn request(socket: &UdpSocket, registrar: SocketAddr, bytes: &[u8]) -> Result<RSerPoolMessage> {
    socket.send_to(bytes, registrar).await?;
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let (len, from) = tokio::time::timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("no reply from registrar")??;
    decode(&buf[..len], PPID_ASAP, Some(from)).map_err(|failure| anyhow::anyhow!("bad reply: {failure}"))
}

async fn exchange(socket: &UdpSocket, registrar: SocketAddr, message: &RSerPoolMessage) -> Result<RSerPoolMessage> {
    let encoded = encode(message, MAX_MESSAGE_SIZE)?;
    request(socket, registrar, &encoded.bytes).await
}

/// A pool element registers over UDP and a user resolves it.
#[tokio::test]
async fn test_register_and_resolve_over_udp() -> Result<()> {
    let registrar = start_registrar().await?;
    let pe = UdpSocket::bind("127.0.0.1:0").await?;
    let handle = pool("EchoPool");

    let reply = exchange(&pe, registrar, &registration(&handle, element(0x77, 7007))).await?;
    match reply.body {
        MessageBody::RegistrationResponse { identifier, error, .. } => {
            assert_eq!(identifier, 0x77);
            assert!(error.is_none(), "registration failed: {error:?}");
        }
        other => bail!("expected a registration response, got {other:?}"),
    }

    let user = UdpSocket::bind("127.0.0.1:0").await?;
    let reply = exchange(&user, registrar, &resolution(&handle)).await?;
    match reply.body {
        MessageBody::HandleResolutionResponse {
            outcome: ResolutionOutcome::Resolved { elements, .. },
            ..
        } => {
            assert_eq!(elements.len(), 1);
            assert_eq!(elements[0].identifier, 0x77);
            assert_eq!(elements[0].home_registrar, 0x51);
        }
        other => bail!("expected resolved elements, got {other:?}"),
    }

    let reply = exchange(&user, registrar, &resolution(&pool("Missing"))).await?;
    assert!(matches!(
        reply.body,
        MessageBody::HandleResolutionResponse {
            outcome: ResolutionOutcome::Failed(_),
            ..
        }
    ));
    Ok(())
}

/// An unknown parameter whose action bits ask for a report gets an ASAP
/// Error back.
#[tokio::test]
async fn test_unknown_parameter_is_reported() -> Result<()> {
    let registrar = start_registrar().await?;
    let pe = UdpSocket::bind("127.0.0.1:0").await?;

    let deregistration = RSerPoolMessage::new(MessageBody::Deregistration {
        handle: pool("EchoPool"),
        identifier: 5,
    });
    let mut bytes = encode(&deregistration, MAX_MESSAGE_SIZE)?.bytes.to_vec();
    // Stop-and-report parameter right after the common header and handle.
    let unknown = [0x40, 0x33, 0x00, 0x08, 0xde, 0xad, 0xbe, 0xef];
    bytes.splice(16..16, unknown);
    let length = bytes.len() as u16;
    bytes[2..4].copy_from_slice(&length.to_be_bytes());

    let reply = request(&pe, registrar, &bytes).await?;
    match reply.body {
        MessageBody::AsapError { error } => assert_eq!(error.cause, RspError::UnrecognizedParameter),
        other => bail!("expected an ASAP error, got {other:?}"),
    }
    Ok(())
}
