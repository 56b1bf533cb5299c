#![allow(clippy::too_many_arguments)]

extern crate reqwest;
extern crate serde;
extern crate serde_json;
extern crate url;

pub mod config;
mod correlator;
pub mod dispatcher;
pub mod errors;
pub mod protocol;
mod registry;
pub mod session;
pub(crate) mod timings;
pub mod token;
pub mod transport;
pub mod types;

pub use config::{ReconnectConfig, SessionConfig, TokenExchangeConfig};
pub use dispatcher::{ErrorEvent, Event, EventHandlers, FeedHandler};
pub use errors::{ConnectionError, Error, Result};
pub use protocol::{
    AccountSummary, Authorization, Balance, Basis, ContractStatus, ContractType, ContractUpdate,
    DurationUnit, Proposal, ProposalParams, Purchase, RequestKind, Sale, Tick, Transaction,
};
pub use session::{SessionBuilder, SessionManager, SessionStatus, SwitchStep};
pub use token::{HttpTokenExchange, TokenExchange};
pub use transport::{
    CloseFrameInfo, ConnectionState, Connector, ReconnectPolicy, Transport, TransportFrame,
    WsConnector, INTENTIONAL_CLOSE,
};
pub use types::{AccountId, ContractId, FeedKey, ListenerId, RequestId, SubscriptionId};
