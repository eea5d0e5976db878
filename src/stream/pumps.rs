//! Per-connection workers.
//!
//! The read pump decodes inbound frames and routes replies to the
//! correlator and pushes to the ledger and event sink. The write pump
//! drains the outbound queue, sends keepalive pings, and registers each
//! written request with the correlator. Both close the session on exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::stream::client::ListenerError;
use crate::stream::correlator::{PendingRequest, Registration};
use crate::stream::ledger::SubscriptionLedger;
use crate::stream::proto::{EventMessage, ResponseMessage};
use crate::stream::transport::{SessionReader, SessionWriter};

/// Where the read pump delivers what it decodes.
pub(crate) struct InboundRoutes {
    pub(crate) responses: mpsc::Sender<ResponseMessage>,
    pub(crate) events: Option<mpsc::Sender<EventMessage>>,
    pub(crate) ledger: Arc<SubscriptionLedger>,
}

pub(crate) async fn read_pump(
    mut reader: SessionReader,
    writer: SessionWriter,
    routes: InboundRoutes,
    cancel: CancellationToken,
) -> Result<(), ListenerError> {
    debug!(event = "pump_running", pump = "read");
    let result = read_loop(&mut reader, &writer, &routes, &cancel).await;
    writer.close().await;
    match &result {
        Ok(()) => debug!(event = "pump_stopped", pump = "read"),
        Err(err) => debug!(event = "pump_stopped", pump = "read", error = %err),
    }
    result
}

async fn read_loop(
    reader: &mut SessionReader,
    writer: &SessionWriter,
    routes: &InboundRoutes,
    cancel: &CancellationToken,
) -> Result<(), ListenerError> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next_frame() => frame?,
        };
        let Some(text) = frame else {
            return Err(ListenerError::Protocol(
                "connection closed by server".to_string(),
            ));
        };

        if let Err(err) = route_frame(&text, routes, cancel).await {
            error!(event = "malformed_frame", error = %err);
            writer.close().await;
            return Err(err);
        }
    }
}

async fn route_frame(
    text: &str,
    routes: &InboundRoutes,
    cancel: &CancellationToken,
) -> Result<(), ListenerError> {
    let response = ResponseMessage::from_text(text)?;
    if !response.is_push() {
        // A closed correlator means this connection is already shutting down.
        let _ = routes.responses.send(response).await;
        return Ok(());
    }

    let message = response.event_message()?;
    if !message.is_consistent() {
        warn!(
            event = "inconsistent_batch_offset",
            offset = message.offset,
            events = message.events.len()
        );
    }
    let advanced = routes.ledger.advance(&message.events);
    debug!(
        event = "push_received",
        offset = message.offset,
        events = message.events.len(),
        advanced
    );

    if let Some(events) = &routes.events {
        tokio::select! {
            _ = cancel.cancelled() => {}
            sent = events.send(message) => {
                if sent.is_err() {
                    debug!(event = "event_sink_dropped");
                }
            }
        }
    }
    Ok(())
}

pub(crate) async fn write_pump(
    writer: SessionWriter,
    mut outbound: OwnedMutexGuard<mpsc::Receiver<PendingRequest>>,
    registrations: mpsc::Sender<Registration>,
    ping_period: Duration,
    cancel: CancellationToken,
) -> Result<(), ListenerError> {
    debug!(event = "pump_running", pump = "write");
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            next = outbound.recv() => match next {
                Some(request) => {
                    if let Err(err) = write_request(&writer, &registrations, request).await {
                        error!(event = "write_failed", error = %err);
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
            _ = ticker.tick() => {
                if let Err(err) = writer.ping().await {
                    error!(event = "ping_failed", error = %err);
                    break Err(err);
                }
            }
        }
    };

    drop(registrations);
    drop(outbound);
    writer.close().await;
    debug!(event = "pump_stopped", pump = "write");
    result
}

async fn write_request(
    writer: &SessionWriter,
    registrations: &mpsc::Sender<Registration>,
    request: PendingRequest,
) -> Result<(), ListenerError> {
    if request.is_abandoned() {
        debug!(event = "abandoned_request_skipped", id = %request.id);
        return Ok(());
    }

    let PendingRequest { id, payload, reply } = request;
    writer.send_text(payload).await?;

    if let Some(reply) = reply {
        let registration = Registration { id, reply };
        if let Err(SendError(registration)) = registrations.send(registration).await {
            let _ = registration.reply.send(Err(ListenerError::ListenerClosed));
        }
    }
    Ok(())
}
