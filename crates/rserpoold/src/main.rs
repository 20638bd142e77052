//! rserpoold — RSerPool registrar daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::Mutex;

use rserpool_core::config::RegistrarConfig;
use rserpool_core::time::now_micros;
use rserpool_core::wire::{Protocol, UNDEFINED_REGISTRAR_IDENTIFIER};
use rserpool_core::{TransportAddressBlock, TransportProtocol};
use rserpool_services::RegistrarState;

mod enrp;

use enrp::{announce, listener::Listener, Sockets};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = RegistrarConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = RegistrarConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        RegistrarConfig::default()
    });

    let identifier = match config.registrar.identifier {
        UNDEFINED_REGISTRAR_IDENTIFIER => rand::thread_rng().gen_range(1..=u32::MAX),
        configured => configured,
    };

    // Bind sockets
    let enrp_addr = config.enrp.listen_addr();
    let asap_addr = SocketAddr::new(config.enrp.listen, config.asap.port);
    let sockets = Sockets::bind(enrp_addr, asap_addr)?;
    let transport = TransportAddressBlock::from_socket_addr(TransportProtocol::Udp, sockets.enrp.local_addr()?, 0);
    tracing::info!(
        identifier = format_args!("${identifier:08x}"),
        enrp = %transport,
        asap = %sockets.asap.local_addr()?,
        "rserpoold starting"
    );

    // Registrar state
    let mut state = RegistrarState::new(identifier, transport, &config.enrp);
    for peer in &config.peers.static_peers {
        match state.add_static_peer(*peer, now_micros()) {
            Ok(_) => tracing::info!(%peer, "static peer configured"),
            Err(e) => tracing::warn!(%peer, error = %e, "static peer ignored"),
        }
    }
    let state = Arc::new(Mutex::new(state));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let enrp_listener_task = tokio::spawn(
        Listener::new(Protocol::Enrp, state.clone(), sockets.clone(), shutdown_tx.subscribe()).run(),
    );

    let asap_listener_task = tokio::spawn(
        Listener::new(Protocol::Asap, state.clone(), sockets.clone(), shutdown_tx.subscribe()).run(),
    );

    let announce_task = tokio::spawn(announce::announce_loop(
        state.clone(),
        sockets.clone(),
        Duration::from_millis(config.enrp.announce_interval_ms.max(1)),
        shutdown_tx.subscribe(),
    ));

    let timer_task = tokio::spawn(announce::timer_loop(
        state.clone(),
        sockets.clone(),
        shutdown_tx.subscribe(),
    ));

    let state_printer = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let state = state.lock().await;
                tracing::info!(
                    pools = state.handlespace().pool_count(),
                    elements = state.handlespace().pool_element_count(),
                    peers = state.peers().len(),
                    "registrar snapshot"
                );
                tracing::debug!("\n{}", *state);
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = enrp_listener_task   => tracing::error!("ENRP listener exited: {:?}", r),
        r = asap_listener_task   => tracing::error!("ASAP listener exited: {:?}", r),
        r = announce_task        => tracing::error!("announce loop exited: {:?}", r),
        r = timer_task           => tracing::error!("timer loop exited: {:?}", r),
        r = state_printer        => tracing::error!("state printer exited: {:?}", r),
    }

    Ok(())
}
