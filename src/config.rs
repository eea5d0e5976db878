//! Listener options.
//!
//! Every option has a default taken from [`ListenerDefaults`]. Options are
//! supplied programmatically through
//! [`EventListenerClient::with_config`](crate::stream::client::EventListenerClient::with_config).

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::stream::client::ListenerError;

/// Default values for [`ListenerConfig`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ListenerDefaults;

impl ListenerDefaults {
    /// Unbounded inbound frames.
    pub const MESSAGE_SIZE_LIMIT: usize = 0;
    pub const WRITE_WAIT: Duration = Duration::from_secs(10);
    pub const PONG_WAIT: Duration = Duration::from_secs(60);
    /// 0.9 x [`Self::PONG_WAIT`].
    pub const PING_PERIOD: Duration = Duration::from_secs(54);
    pub const RESPONSE_WAIT: Duration = Duration::from_secs(10);
    pub const RECONNECTION_DELAY: Duration = Duration::from_secs(2);
    pub const RECONNECTION_ATTEMPTS: usize = 5;
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);
    /// Longest accepted value for any timing option.
    pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
}

/// Connection, keepalive, correlation, and reconnection options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Maximum inbound frame size in bytes. `0` disables the limit.
    pub message_size_limit: usize,
    /// Time allowed for a single frame write.
    pub write_wait: Duration,
    /// Time allowed between pongs before the read side gives up.
    pub pong_wait: Duration,
    /// Keepalive ping cadence. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Time a caller waits for the reply to one request.
    pub response_wait: Duration,
    /// Wait between connection attempts.
    pub reconnection_delay: Duration,
    /// Consecutive failed attempts tolerated before the engine terminates.
    pub reconnection_attempts: usize,
    /// Time allowed for dialing and the websocket upgrade.
    pub handshake_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            message_size_limit: ListenerDefaults::MESSAGE_SIZE_LIMIT,
            write_wait: ListenerDefaults::WRITE_WAIT,
            pong_wait: ListenerDefaults::PONG_WAIT,
            ping_period: ListenerDefaults::PING_PERIOD,
            response_wait: ListenerDefaults::RESPONSE_WAIT,
            reconnection_delay: ListenerDefaults::RECONNECTION_DELAY,
            reconnection_attempts: ListenerDefaults::RECONNECTION_ATTEMPTS,
            handshake_timeout: ListenerDefaults::HANDSHAKE_TIMEOUT,
        }
    }
}

impl ListenerConfig {
    /// Sets `pong_wait` and derives `ping_period` from it.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = ping_period_for(pong_wait);
        self
    }

    /// Sets the per-request reply timeout.
    pub fn with_response_wait(mut self, response_wait: Duration) -> Self {
        self.response_wait = response_wait;
        self
    }

    /// Sets reconnection delay and the consecutive attempt limit.
    pub fn with_reconnection(mut self, delay: Duration, attempts: usize) -> Self {
        self.reconnection_delay = delay;
        self.reconnection_attempts = attempts;
        self
    }

    /// Checks option consistency before any connection is made.
    pub fn validate(&self) -> Result<(), ListenerError> {
        let timings = [
            ("write_wait", self.write_wait),
            ("pong_wait", self.pong_wait),
            ("ping_period", self.ping_period),
            ("response_wait", self.response_wait),
            ("reconnection_delay", self.reconnection_delay),
            ("handshake_timeout", self.handshake_timeout),
        ];
        for (name, value) in timings {
            if value > ListenerDefaults::MAX_DURATION {
                return Err(ListenerError::InvalidConfig(format!(
                    "{name} ({value:?}) must be <= {:?}",
                    ListenerDefaults::MAX_DURATION
                )));
            }
        }
        if self.write_wait.is_zero() {
            return Err(ListenerError::InvalidConfig(
                "write_wait must be > 0".to_string(),
            ));
        }
        if self.response_wait.is_zero() {
            return Err(ListenerError::InvalidConfig(
                "response_wait must be > 0".to_string(),
            ));
        }
        if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
            return Err(ListenerError::InvalidConfig(format!(
                "ping_period ({:?}) must be > 0 and < pong_wait ({:?})",
                self.ping_period, self.pong_wait
            )));
        }
        if self.reconnection_attempts == 0 {
            return Err(ListenerError::InvalidConfig(
                "reconnection_attempts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        let limit = (self.message_size_limit > 0).then_some(self.message_size_limit);
        let mut config = WebSocketConfig::default();
        config.max_message_size = limit;
        config.max_frame_size = limit;
        config
    }
}

/// Keepalive cadence for a given pong wait: nine tenths of it.
pub fn ping_period_for(pong_wait: Duration) -> Duration {
    match pong_wait.checked_mul(9) {
        Some(scaled) => scaled / 10,
        None => pong_wait / 10 * 9,
    }
}
