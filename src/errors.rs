use std::time::Duration;

use thiserror::Error;

use crate::{protocol::RequestKind, session::SwitchStep, types::AccountId};

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the physical connection and its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("a connection attempt is already in flight")]
    AlreadyConnecting,
    #[error("websocket is not connected")]
    NotConnected,
    #[error("connection closed before the request completed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("authorization rejected: {message} (code: {code})")]
    Authorization { code: String, message: String },
    #[error("{kind} request timed out after {after:?}")]
    RequestTimeout { kind: RequestKind, after: Duration },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("upstream error: {message} (code: {code})")]
    Api { code: String, message: String },
    #[error("switched to account {actual:?} but {expected} was requested")]
    AccountMismatch {
        expected: AccountId,
        actual: Option<AccountId>,
    },
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("operation requires an authorized session")]
    NotAuthorized,
    #[error("an account switch is already in progress")]
    SwitchInProgress,
    #[error("account switch failed at {step:?}: {source}")]
    SwitchFailed {
        step: SwitchStep,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("session task has stopped")]
    SessionClosed,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Error code carried by an upstream rejection, if any.
    pub fn upstream_code(&self) -> Option<&str> {
        match self {
            Error::Authorization { code, .. } | Error::Api { code, .. } => Some(code),
            Error::SwitchFailed { source, .. } => source.upstream_code(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::RequestTimeout { .. } => true,
            Error::Connection(ConnectionError::Timeout(_)) => true,
            Error::SwitchFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}
