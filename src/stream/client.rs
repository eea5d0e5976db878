//! Event listener client and engine handle.
//!
//! [`EventListenerClient`] holds connection settings. Starting it spawns the
//! background workers that own the websocket and returns an
//! [`EventListener`] used to issue control requests. Control requests are
//! correlated to their replies by id and bounded by
//! [`ListenerConfig::response_wait`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::config::ListenerConfig;
use crate::retry::with_timeout;
use crate::stream::correlator::PendingRequest;
use crate::stream::ledger::SubscriptionLedger;
use crate::stream::proto::{
    BatchParams, EventMessage, EventType, Method, RequestMessage, ResponseMessage,
    SubscribeParams, UnsubscribeParams,
};
use crate::stream::supervisor::{supervise, ConnectionState, LiveConnection};
use crate::stream::transport::Session;

/// Requests queued ahead of the write worker before callers block.
const SEND_QUEUE_CAPACITY: usize = 32;

/// Entry point for creating event listeners.
#[derive(Clone)]
pub struct EventListenerClient {
    addr: String,
    endpoint_override: Option<String>,
    config: ListenerConfig,
    token: Option<SecretString>,
    span: Span,
}

impl EventListenerClient {
    /// Creates a client for a `host:port` service address.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            endpoint_override: None,
            config: ListenerConfig::default(),
            token: None,
            span: Span::none(),
        }
    }

    /// Sets an explicit websocket URL.
    ///
    /// The override takes precedence over the address given to [`Self::new`].
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    pub fn with_config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets a token sent as `Authorization: Bearer` on every upgrade request.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the span every worker logs under. Defaults to a disabled span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Websocket URL dialed by this client.
    pub fn endpoint(&self) -> String {
        match self.endpoint_override.as_deref() {
            Some(endpoint) => endpoint.to_string(),
            None => format!("ws://{}/", self.addr),
        }
    }

    /// Opens one connection without reconnection.
    ///
    /// A dial failure is returned directly. When the connection ends, the
    /// listener terminates and closes `events`.
    pub async fn listen_and_serve(
        &self,
        events: Option<mpsc::Sender<EventMessage>>,
    ) -> Result<EventListener, ListenerError> {
        self.config.validate()?;
        let shared = self.shared(events);
        shared.set_state(ConnectionState::Connecting);

        let session = match Session::connect(&shared.url, shared.token.as_ref(), &shared.config)
            .instrument(shared.span.clone())
            .await
        {
            Ok(session) => session,
            Err(err) => {
                shared.terminate();
                return Err(err);
            }
        };
        let connection = LiveConnection::spawn(&shared, session).await;
        shared.set_state(ConnectionState::Connected);

        let owner = Arc::clone(&shared);
        tokio::spawn(
            async move {
                if let Err(err) = connection.join().await {
                    warn!(event = "connection_lost", error = %err);
                }
                owner.terminate();
            }
            .instrument(shared.span.clone()),
        );

        Ok(EventListener { shared })
    }

    /// Starts a supervised listener and waits for the first connection.
    ///
    /// A failure of the very first dial is returned and the listener does
    /// not retry. Later failures are retried up to
    /// [`ListenerConfig::reconnection_attempts`] times in a row.
    pub async fn start(
        &self,
        events: Option<mpsc::Sender<EventMessage>>,
    ) -> Result<EventListener, ListenerError> {
        self.config.validate()?;
        let shared = self.shared(events);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(supervise(Arc::clone(&shared), Some(ready_tx)).instrument(shared.span.clone()));

        match ready_rx.await {
            Ok(Ok(())) => Ok(EventListener { shared }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ListenerError::ListenerClosed),
        }
    }

    /// Starts a supervised listener without waiting for a connection.
    ///
    /// Every dial failure, including the first, counts against
    /// [`ListenerConfig::reconnection_attempts`]. Requests issued before the
    /// first connection wait for it, bounded by the response timeout.
    pub fn spawn(
        &self,
        events: Option<mpsc::Sender<EventMessage>>,
    ) -> Result<EventListener, ListenerError> {
        self.config.validate()?;
        let shared = self.shared(events);
        tokio::spawn(supervise(Arc::clone(&shared), None).instrument(shared.span.clone()));
        Ok(EventListener { shared })
    }

    fn shared(&self, events: Option<mpsc::Sender<EventMessage>>) -> Arc<Shared> {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Shared {
            url: self.endpoint(),
            config: self.config.clone(),
            token: self.token.clone(),
            span: self.span.clone(),
            ledger: Arc::new(SubscriptionLedger::new()),
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            events: Mutex::new(events),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            terminated: AtomicBool::new(false),
            state,
        })
    }
}

/// Handle to a running listener.
///
/// Cloning is cheap; all clones share the same connection, ledger, and
/// request path, and may issue requests concurrently.
#[derive(Clone)]
pub struct EventListener {
    shared: Arc<Shared>,
}

impl EventListener {
    /// Subscribes to `event_type` starting at `offset`.
    ///
    /// On `Ok(true)` the ledger records the subscription so it is restored
    /// after a reconnect.
    pub async fn subscribe(
        &self,
        event_type: impl Into<EventType>,
        offset: u64,
    ) -> Result<bool, ListenerError> {
        let event_type = event_type.into();
        let accepted = self
            .shared
            .control(Method::Subscribe, SubscribeParams::new(event_type, offset))
            .await?;
        if accepted {
            self.shared.ledger.subscribe(&[event_type], offset);
            debug!(event = "subscribed", topic = %event_type, offset);
        }
        Ok(accepted)
    }

    pub async fn unsubscribe(&self, event_type: impl Into<EventType>) -> Result<bool, ListenerError> {
        let event_type = event_type.into();
        let accepted = self
            .shared
            .control(Method::Unsubscribe, UnsubscribeParams::new(event_type))
            .await?;
        if accepted {
            self.shared.ledger.unsubscribe(&[event_type]);
            debug!(event = "unsubscribed", topic = %event_type);
        }
        Ok(accepted)
    }

    /// Subscribes to every event type in one request, all at `offset`.
    pub async fn batch_subscribe(
        &self,
        event_types: &[EventType],
        offset: u64,
    ) -> Result<bool, ListenerError> {
        let accepted = self
            .shared
            .control(
                Method::BatchSubscribe,
                BatchParams::new(event_types, Some(offset)),
            )
            .await?;
        if accepted {
            self.shared.ledger.subscribe(event_types, offset);
            debug!(event = "batch_subscribed", topics = event_types.len(), offset);
        }
        Ok(accepted)
    }

    pub async fn batch_unsubscribe(&self, event_types: &[EventType]) -> Result<bool, ListenerError> {
        let accepted = self
            .shared
            .control(Method::BatchUnsubscribe, BatchParams::new(event_types, None))
            .await?;
        if accepted {
            self.shared.ledger.unsubscribe(event_types);
            debug!(event = "batch_unsubscribed", topics = event_types.len());
        }
        Ok(accepted)
    }

    /// Sends an arbitrary request and returns the raw correlated reply.
    ///
    /// The ledger is not touched; use the typed operations for
    /// subscriptions that should survive reconnects.
    pub async fn request<P>(&self, method: Method, params: P) -> Result<ResponseMessage, ListenerError>
    where
        P: Serialize,
    {
        let request = RequestMessage::new(method, params)?;
        self.shared.call(request).await
    }

    /// Current subscriptions and their resume offsets.
    pub fn subscriptions(&self) -> std::collections::BTreeMap<EventType, u64> {
        self.shared.ledger.snapshot()
    }

    /// Resume offset recorded for `event_type`, if subscribed.
    pub fn offset(&self, event_type: impl Into<EventType>) -> Option<u64> {
        self.shared.ledger.offset(event_type.into())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every connection state change.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Stops the listener. Safe to call any number of times.
    pub fn close(&self) {
        self.shared.terminate();
    }

    /// Resolves once the listener has terminated.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

/// State shared by the handle, the supervisor, and the workers.
pub(crate) struct Shared {
    pub(crate) url: String,
    pub(crate) config: ListenerConfig,
    pub(crate) token: Option<SecretString>,
    pub(crate) span: Span,
    pub(crate) ledger: Arc<SubscriptionLedger>,
    outbound_tx: mpsc::Sender<PendingRequest>,
    pub(crate) outbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingRequest>>>,
    events: Mutex<Option<mpsc::Sender<EventMessage>>>,
    /// Stop signal observed by the supervisor and every worker.
    pub(crate) shutdown: CancellationToken,
    /// Fired once the listener reached its terminal state.
    closed: CancellationToken,
    terminated: AtomicBool,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Sender half of the push sink, unless the listener already closed it.
    pub(crate) fn event_sink(&self) -> Option<mpsc::Sender<EventMessage>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publishes `state` unless the listener already terminated.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Terminated || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Moves to the terminal state. Only the first call has any effect.
    pub(crate) fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.send_replace(ConnectionState::Terminated);
        self.shutdown.cancel();
        // Workers drop their clones as they exit.
        drop(
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        info!(event = "listener_closed", url = %self.url);
        self.closed.cancel();
    }

    /// Queues `request` for the write worker and waits for its reply.
    pub(crate) async fn call(&self, request: RequestMessage) -> Result<ResponseMessage, ListenerError> {
        if self.closed.is_cancelled() {
            return Err(ListenerError::ListenerClosed);
        }
        let payload = request.to_text()?;
        debug!(event = "send_request", id = %request.id, method = %request.method);

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingRequest {
            id: request.id.clone(),
            payload,
            reply: Some(reply_tx),
        };
        let exchange = async {
            tokio::select! {
                _ = self.closed.cancelled() => return Err(ListenerError::ListenerClosed),
                queued = self.outbound_tx.send(pending) => {
                    queued.map_err(|_| ListenerError::ListenerClosed)?;
                }
            }
            tokio::select! {
                _ = self.closed.cancelled() => Err(ListenerError::ListenerClosed),
                reply = reply_rx => reply.unwrap_or(Err(ListenerError::ListenerClosed)),
            }
        };

        match with_timeout(self.config.response_wait, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(event = "request_timeout", id = %request.id, method = %request.method);
                Err(ListenerError::RequestTimeout {
                    id: request.id,
                    method: request.method,
                })
            }
        }
    }

    /// Sends a control request and decodes its boolean result.
    pub(crate) async fn control<P>(&self, method: Method, params: P) -> Result<bool, ListenerError>
    where
        P: Serialize,
    {
        let request = RequestMessage::new(method, params)?;
        let response = self.call(request).await?;
        if let Some(error) = response.error {
            return Err(ListenerError::Server {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result_bool()?)
    }
}

/// Errors produced by the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Dial or websocket upgrade failed, including the handshake timeout.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: WsError,
    },

    /// Websocket transport error on an established connection.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("no pong received within {0:?}")]
    PongTimeout(Duration),

    /// Stream protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No correlated reply arrived within the response timeout.
    #[error("request {method} ({id}) timed out")]
    RequestTimeout { id: String, method: Method },

    /// The server answered with an error object.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    /// The listener is shutting down or has terminated.
    #[error("listener closed")]
    ListenerClosed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Token could not be converted to a valid HTTP header value.
    #[error("invalid token header: {0}")]
    InvalidTokenHeader(#[from] InvalidHeaderValue),
}

impl ListenerError {
    /// Whether the error belongs to a single connection and is retried by
    /// the supervisor.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ListenerError::WebSocket(_)
                | ListenerError::Json(_)
                | ListenerError::WriteTimeout(_)
                | ListenerError::PongTimeout(_)
                | ListenerError::Protocol(_)
        )
    }
}
