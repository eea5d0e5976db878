//! One websocket session: dial, framed reads with an idle deadline, timed
//! writes, keepalive pings, and a close that runs at most once.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::ListenerConfig;
use crate::retry::with_timeout;
use crate::stream::client::ListenerError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A dialed connection split into its read and write halves.
pub(crate) struct Session {
    pub(crate) reader: SessionReader,
    pub(crate) writer: SessionWriter,
}

impl Session {
    /// Dials `url` and completes the websocket upgrade.
    ///
    /// Any failure, including the handshake timeout, is a
    /// [`ListenerError::Connect`].
    pub(crate) async fn connect(
        url: &str,
        token: Option<&SecretString>,
        config: &ListenerConfig,
    ) -> Result<Self, ListenerError> {
        let mut request = url
            .into_client_request()
            .map_err(|source| connect_error(url, source))?;
        if let Some(token) = token {
            let mut header: HeaderValue = format!("Bearer {}", token.expose_secret()).parse()?;
            header.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, header);
        }

        let dial = connect_async_with_config(request, Some(config.websocket_config()), false);
        let (socket, _) = match with_timeout(config.handshake_timeout, dial).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(source)) => return Err(connect_error(url, source)),
            Err(_) => {
                let timed_out = io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out");
                return Err(connect_error(url, WsError::Io(timed_out)));
            }
        };
        debug!(event = "session_opened", url);

        let (sink, stream) = socket.split();
        Ok(Self {
            reader: SessionReader::new(stream, config.pong_wait),
            writer: SessionWriter::new(sink, config.write_wait),
        })
    }
}

fn connect_error(url: &str, source: WsError) -> ListenerError {
    ListenerError::Connect {
        url: url.to_string(),
        source,
    }
}

/// Read half. Only pongs refresh the idle deadline.
pub(crate) struct SessionReader {
    stream: SplitStream<Socket>,
    pong_wait: Duration,
    deadline: Instant,
}

impl SessionReader {
    fn new(stream: SplitStream<Socket>, pong_wait: Duration) -> Self {
        Self {
            stream,
            pong_wait,
            deadline: Instant::now() + pong_wait,
        }
    }

    /// Reads the next data frame as text.
    ///
    /// Returns `Ok(None)` when the peer closed the connection and
    /// [`ListenerError::PongTimeout`] when no pong arrived within the wait.
    pub(crate) async fn next_frame(&mut self) -> Result<Option<String>, ListenerError> {
        loop {
            let next = match tokio::time::timeout_at(self.deadline, self.stream.next()).await {
                Ok(next) => next,
                Err(_) => return Err(ListenerError::PongTimeout(self.pong_wait)),
            };
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes).map(Some).map_err(|_| {
                        ListenerError::Protocol("binary frame is not valid utf-8".to_string())
                    });
                }
                Some(Ok(Message::Pong(_))) => {
                    self.deadline = Instant::now() + self.pong_wait;
                }
                // tungstenite queues the pong reply itself.
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(event = "close_frame_received", frame = ?frame);
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed)) | None => return Ok(None),
                Some(Err(err)) => return Err(ListenerError::WebSocket(err)),
            }
        }
    }
}

/// Write half, shared by both workers of a connection.
#[derive(Clone)]
pub(crate) struct SessionWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    sink: Mutex<SplitSink<Socket, Message>>,
    write_wait: Duration,
    closed: AtomicBool,
}

impl SessionWriter {
    fn new(sink: SplitSink<Socket, Message>, write_wait: Duration) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                sink: Mutex::new(sink),
                write_wait,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) async fn send_text(&self, text: String) -> Result<(), ListenerError> {
        self.send(Message::Text(text)).await
    }

    pub(crate) async fn ping(&self) -> Result<(), ListenerError> {
        self.send(Message::Ping(Vec::new())).await
    }

    /// Sends a close frame and releases the socket.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub(crate) async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let close = async {
            let mut sink = self.inner.sink.lock().await;
            sink.close().await
        };
        match with_timeout(self.inner.write_wait, close).await {
            Ok(Ok(())) | Ok(Err(WsError::ConnectionClosed)) | Ok(Err(WsError::AlreadyClosed)) => {
                debug!(event = "session_closed");
            }
            Ok(Err(err)) => debug!(event = "session_close_failed", error = %err),
            Err(_) => debug!(event = "session_close_timed_out"),
        }
    }

    async fn send(&self, message: Message) -> Result<(), ListenerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ListenerError::WebSocket(WsError::AlreadyClosed));
        }
        let write = async {
            let mut sink = self.inner.sink.lock().await;
            sink.send(message).await
        };
        match with_timeout(self.inner.write_wait, write).await {
            Ok(result) => result.map_err(ListenerError::WebSocket),
            Err(_) => Err(ListenerError::WriteTimeout(self.inner.write_wait)),
        }
    }
}
