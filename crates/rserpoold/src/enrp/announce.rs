//! Periodic Presence announcements and the registrar's timer wheel.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time;

use rserpool_core::time::{now_micros, until};

use super::{SharedRegistrar, Sockets};

/// Upper bound on how long the timer loop sleeps, so deadlines armed by
/// the listeners while it waits are picked up.
const MAX_TIMER_SLEEP: Duration = Duration::from_millis(250);

/// Send a Presence to every known peer on a regular interval.
pub async fn announce_loop(
    state: SharedRegistrar,
    sockets: Sockets,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut interval = time::interval(interval);
    tracing::info!(interval_ms = interval.period().as_millis() as u64, "announce loop starting");

    loop {
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = interval.tick() => {
                let outgoing = state.lock().await.announce();
                tracing::trace!(peers = outgoing.len(), "announcing presence");
                sockets.send_all(outgoing).await;
            }
        }
    }
}

/// Run peer and pool element timers as they fall due.
pub async fn timer_loop(
    state: SharedRegistrar,
    sockets: Sockets,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        let wait = match state.lock().await.next_deadline() {
            Some(deadline) => until(deadline, now_micros()).min(MAX_TIMER_SLEEP),
            None => MAX_TIMER_SLEEP,
        };
        tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            _ = time::sleep(wait) => {
                let outgoing = state.lock().await.handle_timers(now_micros());
                sockets.send_all(outgoing).await;
            }
        }
    }
}
