//! Reconnection supervisor.
//!
//! The supervisor owns the connect/retry loop. Each successful dial gets one
//! read worker, one write worker, and one correlator; the ledger is replayed
//! before the connection counts as restored. When either worker exits, both
//! are torn down before the next attempt, so at most one connection is live.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::retry::{sleep_or_cancel, AttemptBudget};
use crate::stream::client::{ListenerError, Shared};
use crate::stream::correlator::run_correlator;
use crate::stream::proto::{BatchParams, Method};
use crate::stream::pumps::{read_pump, write_pump, InboundRoutes};
use crate::stream::transport::Session;

/// Capacity of the worker-to-correlator handoff channels.
const HANDOFF_CAPACITY: usize = 64;

/// Connection lifecycle as seen by the supervisor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Final: no further attempts are made and every request fails.
    Terminated,
}

/// The worker pair of one connection.
pub(crate) struct LiveConnection {
    cancel: CancellationToken,
    read: JoinHandle<Result<(), ListenerError>>,
    write: JoinHandle<Result<(), ListenerError>>,
}

enum FirstExit {
    Read(Result<(), ListenerError>),
    Write(Result<(), ListenerError>),
}

impl LiveConnection {
    /// Spawns the correlator and both workers for `session`.
    pub(crate) async fn spawn(shared: &Arc<Shared>, session: Session) -> Self {
        let cancel = shared.shutdown.child_token();
        let (registrations_tx, registrations_rx) = mpsc::channel(HANDOFF_CAPACITY);
        let (responses_tx, responses_rx) = mpsc::channel(HANDOFF_CAPACITY);
        // Released by the previous write worker before its connection ended.
        let outbound = Arc::clone(&shared.outbound_rx).lock_owned().await;
        let Session { reader, writer } = session;
        let span = shared.span.clone();

        tokio::spawn(
            run_correlator(registrations_rx, responses_rx, shared.config.response_wait)
                .instrument(span.clone()),
        );
        let routes = InboundRoutes {
            responses: responses_tx,
            events: shared.event_sink(),
            ledger: Arc::clone(&shared.ledger),
        };
        let read = tokio::spawn(
            read_pump(reader, writer.clone(), routes, cancel.clone()).instrument(span.clone()),
        );
        let write = tokio::spawn(
            write_pump(
                writer,
                outbound,
                registrations_tx,
                shared.config.ping_period,
                cancel.clone(),
            )
            .instrument(span),
        );

        Self {
            cancel,
            read,
            write,
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for either worker to exit, then stops and joins the other.
    pub(crate) async fn join(self) -> Result<(), ListenerError> {
        let LiveConnection {
            cancel,
            mut read,
            mut write,
        } = self;

        let first = tokio::select! {
            result = &mut read => FirstExit::Read(worker_result("read", result)),
            result = &mut write => FirstExit::Write(worker_result("write", result)),
        };
        cancel.cancel();

        match first {
            FirstExit::Read(result) => result.and(worker_result("write", write.await)),
            FirstExit::Write(result) => result.and(worker_result("read", read.await)),
        }
    }
}

fn worker_result(
    worker: &str,
    joined: Result<Result<(), ListenerError>, tokio::task::JoinError>,
) -> Result<(), ListenerError> {
    joined.unwrap_or_else(|err| {
        Err(ListenerError::Protocol(format!(
            "{worker} worker failed: {err}"
        )))
    })
}

/// Runs the connect/retry loop until shutdown or the attempt limit.
///
/// With `ready` set, the outcome of the first attempt is reported through
/// it, and a failed first dial ends the loop instead of retrying.
pub(crate) async fn supervise(
    shared: Arc<Shared>,
    mut ready: Option<oneshot::Sender<Result<(), ListenerError>>>,
) {
    let config = shared.config.clone();
    let mut budget = AttemptBudget::new(config.reconnection_attempts);

    loop {
        shared.set_state(ConnectionState::Connecting);
        debug!(
            event = "connection_attempt",
            attempt = budget.failures() + 1,
            url = %shared.url
        );

        let dialed = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            dialed = Session::connect(&shared.url, shared.token.as_ref(), &config) => dialed,
        };

        let failed = match dialed {
            Ok(session) => {
                let restored = run_connection(&shared, session, &mut ready).await;
                if restored {
                    budget.reset();
                }
                !restored
            }
            Err(err) => {
                error!(event = "connection_failed", url = %shared.url, error = %err);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(err));
                    break;
                }
                true
            }
        };
        shared.set_state(ConnectionState::Disconnected);

        if failed && budget.record_failure() {
            warn!(
                event = "reconnection_attempts_exhausted",
                attempts = budget.failures(),
                url = %shared.url
            );
            break;
        }
        if !sleep_or_cancel(config.reconnection_delay, &shared.shutdown).await {
            debug!(event = "reconnect_wait_cancelled");
            break;
        }
    }

    if let Some(tx) = ready.take() {
        let _ = tx.send(Err(ListenerError::ListenerClosed));
    }
    shared.terminate();
}

/// Drives one connection to its end.
///
/// Returns `false` when the ledger replay failed. Only a restored connection
/// resets the attempt budget, so repeated replay failures exhaust it.
async fn run_connection(
    shared: &Arc<Shared>,
    session: Session,
    ready: &mut Option<oneshot::Sender<Result<(), ListenerError>>>,
) -> bool {
    info!(event = "connected", url = %shared.url);
    let connection = LiveConnection::spawn(shared, session).await;
    shared.set_state(ConnectionState::Connected);

    let restored = match resubscribe(shared).await {
        Ok(_) => {
            if let Some(tx) = ready.take() {
                let _ = tx.send(Ok(()));
            }
            true
        }
        Err(err) => {
            warn!(event = "resubscribe_failed", error = %err);
            connection.cancel();
            false
        }
    };

    match connection.join().await {
        Ok(()) => debug!(event = "connection_finished"),
        Err(err) => warn!(event = "connection_lost", error = %err),
    }
    restored
}

/// Reissues every ledger entry, one batch request per distinct offset.
async fn resubscribe(shared: &Shared) -> Result<usize, ListenerError> {
    let mut restored = 0;
    for (offset, event_types) in shared.ledger.grouped_by_offset() {
        let params = BatchParams::new(&event_types, Some(offset));
        if !shared.control(Method::BatchSubscribe, params).await? {
            return Err(ListenerError::Protocol(format!(
                "server declined resubscription of {} topic(s) at offset {offset}",
                event_types.len()
            )));
        }
        restored += event_types.len();
    }
    if restored > 0 {
        info!(event = "subscriptions_restored", restored);
    }
    Ok(restored)
}
