//! In-flight request table.
//!
//! One correlator task runs per connection. The write worker registers a
//! request after its bytes are on the wire; the read worker hands over every
//! reply that carries an id. When either handoff channel closes, every
//! registered waiter is released with [`ListenerError::ListenerClosed`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::stream::client::ListenerError;
use crate::stream::proto::ResponseMessage;

/// Replies held while their registration is still in the handoff queue.
const EARLY_REPLY_CAPACITY: usize = 64;

pub(crate) type Reply = Result<ResponseMessage, ListenerError>;
pub(crate) type ReplySlot = oneshot::Sender<Reply>;

/// Serialized request queued for the write worker.
pub(crate) struct PendingRequest {
    pub(crate) id: String,
    pub(crate) payload: String,
    pub(crate) reply: Option<ReplySlot>,
}

impl PendingRequest {
    /// Whether the caller stopped waiting before the request was written.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.reply.as_ref().is_some_and(|reply| reply.is_closed())
    }
}

/// A written request waiting for its reply.
pub(crate) struct Registration {
    pub(crate) id: String,
    pub(crate) reply: ReplySlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Delivered,
    /// The caller already gave up; the reply is dropped.
    Stale,
    /// No registration yet; held until one arrives or the reply expires.
    Held,
    Dropped,
}

pub(crate) struct Correlator {
    pending: HashMap<String, ReplySlot>,
    early: HashMap<String, (Instant, ResponseMessage)>,
    /// Ids whose waiter gave up, so their late replies are not held.
    retired: HashMap<String, Instant>,
    early_ttl: Duration,
}

impl Correlator {
    pub(crate) fn new(early_ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            early: HashMap::new(),
            retired: HashMap::new(),
            early_ttl,
        }
    }

    pub(crate) fn register(&mut self, registration: Registration) {
        self.retire_abandoned(Instant::now());

        let Registration { id, reply } = registration;
        if let Some((_, response)) = self.early.remove(&id) {
            let _ = reply.send(Ok(response));
            return;
        }
        if let Some(previous) = self.pending.insert(id.clone(), reply) {
            warn!(event = "duplicate_request_id", id = %id);
            let _ = previous.send(Err(ListenerError::ListenerClosed));
        }
    }

    pub(crate) fn resolve(&mut self, response: ResponseMessage) -> Resolution {
        let Some(id) = response.id.clone() else {
            return Resolution::Dropped;
        };
        match self.pending.remove(&id) {
            Some(slot) => {
                if slot.send(Ok(response)).is_ok() {
                    Resolution::Delivered
                } else {
                    debug!(event = "stale_reply_dropped", id = %id);
                    Resolution::Stale
                }
            }
            None => {
                let now = Instant::now();
                self.retire_abandoned(now);
                if self.retired.remove(&id).is_some() {
                    debug!(event = "stale_reply_dropped", id = %id);
                    return Resolution::Stale;
                }
                self.hold(id, response, now)
            }
        }
    }

    /// Moves waiters that gave up out of `pending` and forgets retired ids
    /// older than the reply TTL.
    fn retire_abandoned(&mut self, now: Instant) {
        let ttl = self.early_ttl;
        self.retired
            .retain(|_, retired_at| now.duration_since(*retired_at) < ttl);
        let retired = &mut self.retired;
        self.pending.retain(|id, slot| {
            if slot.is_closed() {
                retired.insert(id.clone(), now);
                false
            } else {
                true
            }
        });
    }

    fn hold(&mut self, id: String, response: ResponseMessage, now: Instant) -> Resolution {
        let ttl = self.early_ttl;
        self.early
            .retain(|_, (received_at, _)| now.duration_since(*received_at) < ttl);
        if self.early.len() >= EARLY_REPLY_CAPACITY {
            debug!(event = "unknown_reply_dropped", id = %id);
            return Resolution::Dropped;
        }
        self.early.insert(id, (now, response));
        Resolution::Held
    }

    /// Fails every registered waiter. Returns how many were released.
    pub(crate) fn release_all(&mut self) -> usize {
        let released = self.pending.len();
        for (_, slot) in self.pending.drain() {
            let _ = slot.send(Err(ListenerError::ListenerClosed));
        }
        self.early.clear();
        self.retired.clear();
        released
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Runs the correlator until either handoff channel closes.
pub(crate) async fn run_correlator(
    mut registrations: mpsc::Receiver<Registration>,
    mut responses: mpsc::Receiver<ResponseMessage>,
    early_ttl: Duration,
) {
    let mut correlator = Correlator::new(early_ttl);
    debug!(event = "pump_running", pump = "correlator");

    loop {
        tokio::select! {
            biased;
            registration = registrations.recv() => match registration {
                Some(registration) => correlator.register(registration),
                None => break,
            },
            response = responses.recv() => match response {
                Some(response) => {
                    correlator.resolve(response);
                }
                None => break,
            },
        }
    }

    let released = correlator.release_all();
    debug!(event = "pump_stopped", pump = "correlator", released);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{mpsc, oneshot};

    use super::{run_correlator, Correlator, Registration, Resolution};
    use crate::stream::client::ListenerError;
    use crate::stream::proto::ResponseMessage;

    const TTL: Duration = Duration::from_secs(5);

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime")
    }

    fn reply(id: &str) -> ResponseMessage {
        ResponseMessage::reply(id, &true).expect("reply")
    }

    #[test]
    fn delivers_reply_to_matching_registration_once() {
        let mut correlator = Correlator::new(TTL);
        let (tx, mut rx) = oneshot::channel();
        correlator.register(Registration {
            id: "a".to_string(),
            reply: tx,
        });

        assert_eq!(correlator.resolve(reply("a")), Resolution::Delivered);
        let response = rx.try_recv().expect("delivered").expect("ok reply");
        assert_eq!(response.id.as_deref(), Some("a"));
        assert_eq!(correlator.pending_len(), 0);

        assert_eq!(correlator.resolve(reply("a")), Resolution::Held);
    }

    #[test]
    fn reply_for_abandoned_waiter_is_dropped() {
        let mut correlator = Correlator::new(TTL);
        let (tx, rx) = oneshot::channel();
        correlator.register(Registration {
            id: "gone".to_string(),
            reply: tx,
        });
        drop(rx);

        assert_eq!(correlator.resolve(reply("gone")), Resolution::Stale);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[test]
    fn late_replies_for_pruned_waiters_do_not_crowd_out_early_replies() {
        let mut correlator = Correlator::new(TTL);
        let mut receivers = Vec::new();
        for index in 0..80 {
            let (tx, rx) = oneshot::channel();
            correlator.register(Registration {
                id: format!("timed-out-{index}"),
                reply: tx,
            });
            receivers.push(rx);
        }
        drop(receivers);

        let (tx, _rx) = oneshot::channel();
        correlator.register(Registration {
            id: "live".to_string(),
            reply: tx,
        });
        assert_eq!(correlator.pending_len(), 1);

        for index in 0..80 {
            assert_eq!(
                correlator.resolve(reply(&format!("timed-out-{index}"))),
                Resolution::Stale
            );
        }
        assert_eq!(correlator.resolve(reply("fast")), Resolution::Held);
    }

    #[test]
    fn early_reply_is_delivered_on_registration() {
        runtime().block_on(async {
            let mut correlator = Correlator::new(TTL);
            assert_eq!(correlator.resolve(reply("fast")), Resolution::Held);

            let (tx, rx) = oneshot::channel();
            correlator.register(Registration {
                id: "fast".to_string(),
                reply: tx,
            });
            let response = rx.await.expect("delivered").expect("ok reply");
            assert_eq!(response.id.as_deref(), Some("fast"));
            assert_eq!(correlator.pending_len(), 0);
        });
    }

    #[test]
    fn release_fails_every_waiter_with_listener_closed() {
        let mut correlator = Correlator::new(TTL);
        let mut receivers = Vec::new();
        for id in ["a", "b", "c"] {
            let (tx, rx) = oneshot::channel();
            correlator.register(Registration {
                id: id.to_string(),
                reply: tx,
            });
            receivers.push(rx);
        }

        assert_eq!(correlator.release_all(), 3);
        for mut rx in receivers {
            let reply = rx.try_recv().expect("released");
            assert!(matches!(reply, Err(ListenerError::ListenerClosed)));
        }
    }

    #[test]
    fn closing_registration_channel_releases_waiters() {
        runtime().block_on(async {
            let (registrations_tx, registrations_rx) = mpsc::channel(4);
            let (_responses_tx, responses_rx) = mpsc::channel(4);
            let task = tokio::spawn(run_correlator(registrations_rx, responses_rx, TTL));

            let (tx, rx) = oneshot::channel();
            registrations_tx
                .send(Registration {
                    id: "waiting".to_string(),
                    reply: tx,
                })
                .await
                .expect("register");
            drop(registrations_tx);

            let reply = rx.await.expect("released");
            assert!(matches!(reply, Err(ListenerError::ListenerClosed)));
            task.await.expect("correlator task");
        });
    }
}
