//! Socket plumbing for the connection task.
//!
//! The task talks to the network only through [`Connector`] and
//! [`Transport`], so tests can swap the tungstenite socket for a scripted
//! in-memory peer.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::Url;

use crate::{config::ReconnectConfig, errors::ConnectionError};

/// Close code used for every close the session initiates on purpose.
pub const INTENTIONAL_CLOSE: u16 = 1000;

pub type TransportResult<T> = std::result::Result<T, ConnectionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrameInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseFrameInfo {
    pub fn is_intentional(&self) -> bool {
        self.code == INTENTIONAL_CLOSE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    /// Peer closed the socket; `None` when the stream ended without a close frame.
    Closed(Option<CloseFrameInfo>),
}

/// An open duplex text channel.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> TransportResult<()>;

    /// Next inbound frame. Must be cancel safe: the connection task polls it
    /// inside `select!`.
    async fn next_frame(&mut self) -> TransportResult<TransportFrame>;

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()>;
}

/// Opens transports. One call per physical connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> TransportResult<Box<dyn Transport>>;
}

/// Geometric reconnect schedule with an attempt budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    // Delay handed out by the previous `schedule`; jitter never goes below it.
    last: Duration,
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            attempts: 0,
            last: Duration::ZERO,
            max_attempts: config.max_attempts,
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 0.99),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delay before attempt number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.initial.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis as u64).min(self.max)
    }

    /// Claim the next attempt. `None` once the budget is spent.
    pub fn schedule(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        let mut delay = self.base_delay(self.attempts);
        if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            delay = delay.mul_f64(spread);
        }
        let delay = delay.max(self.last).min(self.max);
        self.last = delay;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last = Duration::ZERO;
    }
}

/// Dials real websockets through tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> TransportResult<Box<dyn Transport>> {
        let (stream, _) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsTransport { stream }))
    }
}

#[derive(Debug)]
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> TransportResult<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> TransportResult<TransportFrame> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(TransportFrame::Closed(None)),
            };
            match message {
                Message::Text(text) => return Ok(TransportFrame::Text(text)),
                Message::Binary(binary) => {
                    let text = String::from_utf8(binary).map_err(|_| {
                        ConnectionError::Transport("invalid utf8 payload".to_string())
                    })?;
                    return Ok(TransportFrame::Text(text));
                }
                Message::Close(frame) => {
                    let info = frame.map(|frame| CloseFrameInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    });
                    return Ok(TransportFrame::Closed(info));
                }
                // tungstenite queues the pong reply itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
