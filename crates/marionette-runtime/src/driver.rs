//! Tokio driver
//!
//! Runs a session at the clock's frame interval and feeds it transport
//! events as they arrive. Hosts with their own frame callback call
//! `AvatarSession::tick` directly instead.

use marionette_core::AvatarResult;
use marionette_transport::TransportEvent;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::session::AvatarSession;

/// Drive `session` until it closes or `shutdown` flips to true
///
/// Returns the error that ended the session, if any.
pub async fn run_session(
    session: &mut AvatarSession,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> AvatarResult<()> {
    let mut interval = tokio::time::interval(session.frame_interval());
    // A late tick is caught up by the clock, not by bursts of ticks
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut inbound_open = true;

    tracing::info!(interval = ?session.frame_interval(), "session driver started");

    while !session.is_closed() {
        tokio::select! {
            _ = interval.tick() => {
                session.tick();
            }
            event = inbound.recv(), if inbound_open => match event {
                Some(event) => session.on_transport_event(event),
                None => {
                    inbound_open = false;
                    session.on_transport_event(TransportEvent::Closed {
                        reason: "transport channel dropped".into(),
                    });
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("shutdown requested");
                    session.stop();
                }
            }
        }
    }

    session.tick();
    tracing::info!(error = ?session.terminal_error(), "session driver finished");

    match session.terminal_error() {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}
