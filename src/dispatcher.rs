//! Fan-out of decoded events to registered listeners.
//!
//! Two kinds of registrations exist. Feed handlers are attached through the
//! `subscribe_*` calls and live in the [`SubscriptionRegistry`] next to the
//! feed they belong to. Account-wide [`EventHandlers`] are registered with
//! `add_listener` and receive every event of their kind.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    protocol::{Balance, ContractUpdate, Proposal, Tick, Transaction},
    registry::SubscriptionRegistry,
    types::{FeedKey, ListenerId, RequestId},
};

pub type TickHandler = Arc<dyn Fn(&Tick) + Send + Sync>;
pub type BalanceHandler = Arc<dyn Fn(&Balance) + Send + Sync>;
pub type TransactionHandler = Arc<dyn Fn(&Transaction) + Send + Sync>;
pub type ProposalHandler = Arc<dyn Fn(&Proposal) + Send + Sync>;
pub type ContractHandler = Arc<dyn Fn(&ContractUpdate) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(bool) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Callback attached to a single feed.
#[derive(Clone)]
pub enum FeedHandler {
    Tick(TickHandler),
    Balance(BalanceHandler),
    Transaction(TransactionHandler),
    Contract(ContractHandler),
}

impl fmt::Debug for FeedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            FeedHandler::Tick(_) => "Tick",
            FeedHandler::Balance(_) => "Balance",
            FeedHandler::Transaction(_) => "Transaction",
            FeedHandler::Contract(_) => "Contract",
        };
        write!(f, "FeedHandler::{kind}")
    }
}

/// Out-of-band error notification delivered to `on_error` handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
    pub req_id: Option<RequestId>,
}

impl ErrorEvent {
    pub const PROTOCOL: &'static str = "ProtocolError";
    pub const RECONNECT_EXHAUSTED: &'static str = "ReconnectExhausted";
    pub const SUBSCRIPTION_REJECTED: &'static str = "SubscriptionRejected";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            req_id: None,
        }
    }

    pub fn with_req_id(mut self, req_id: Option<RequestId>) -> Self {
        self.req_id = req_id;
        self
    }
}

/// Event emitted to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Tick(Tick),
    Balance(Balance),
    Transaction(Transaction),
    Proposal(Proposal),
    Contract(ContractUpdate),
    Connection(bool),
    Error(ErrorEvent),
}

/// Account-wide callbacks of one listener. Unset callbacks are skipped.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_tick: Option<TickHandler>,
    on_balance: Option<BalanceHandler>,
    on_transaction: Option<TransactionHandler>,
    on_proposal: Option<ProposalHandler>,
    on_contract: Option<ContractHandler>,
    on_connection: Option<ConnectionHandler>,
    on_error: Option<ErrorHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tick(mut self, f: impl Fn(&Tick) + Send + Sync + 'static) -> Self {
        self.on_tick = Some(Arc::new(f));
        self
    }

    pub fn on_balance(mut self, f: impl Fn(&Balance) + Send + Sync + 'static) -> Self {
        self.on_balance = Some(Arc::new(f));
        self
    }

    pub fn on_transaction(mut self, f: impl Fn(&Transaction) + Send + Sync + 'static) -> Self {
        self.on_transaction = Some(Arc::new(f));
        self
    }

    pub fn on_proposal(mut self, f: impl Fn(&Proposal) + Send + Sync + 'static) -> Self {
        self.on_proposal = Some(Arc::new(f));
        self
    }

    pub fn on_contract(mut self, f: impl Fn(&ContractUpdate) + Send + Sync + 'static) -> Self {
        self.on_contract = Some(Arc::new(f));
        self
    }

    pub fn on_connection(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_tick", &self.on_tick.is_some())
            .field("on_balance", &self.on_balance.is_some())
            .field("on_transaction", &self.on_transaction.is_some())
            .field("on_proposal", &self.on_proposal.is_some())
            .field("on_contract", &self.on_contract.is_some())
            .field("on_connection", &self.on_connection.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Ordered table of account-wide listeners.
#[derive(Debug, Default)]
pub(crate) struct Dispatcher {
    listeners: Vec<(ListenerId, EventHandlers)>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_listener(&mut self, id: ListenerId, handlers: EventHandlers) {
        if let Some(slot) = self.listeners.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = handlers;
        } else {
            self.listeners.push((id, handlers));
        }
    }

    pub(crate) fn remove_listener(&mut self, id: &ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| existing != id);
        before != self.listeners.len()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to the feed it belongs to and to every account-wide
    /// handler of its kind. Returns how many callbacks ran.
    pub(crate) fn dispatch(&self, registry: &SubscriptionRegistry, event: &Event) -> usize {
        let mut delivered = 0;
        match event {
            Event::Tick(tick) => {
                delivered += self.feed(registry, &FeedKey::ticks(tick.symbol.as_str()), |h| match h {
                    FeedHandler::Tick(f) => invoke("tick", || f(tick)),
                    _ => false,
                });
                delivered += self.each(|h| h.on_tick.as_ref().map(|f| invoke("tick", || f(tick))));
            }
            Event::Balance(balance) => {
                delivered += self.feed(registry, &FeedKey::Balance, |h| match h {
                    FeedHandler::Balance(f) => invoke("balance", || f(balance)),
                    _ => false,
                });
                delivered +=
                    self.each(|h| h.on_balance.as_ref().map(|f| invoke("balance", || f(balance))));
            }
            Event::Transaction(tx) => {
                delivered += self.feed(registry, &FeedKey::Transactions, |h| match h {
                    FeedHandler::Transaction(f) => invoke("transaction", || f(tx)),
                    _ => false,
                });
                delivered += self
                    .each(|h| h.on_transaction.as_ref().map(|f| invoke("transaction", || f(tx))));
            }
            Event::Contract(update) => {
                delivered += self.feed(registry, &FeedKey::Contract(update.contract_id), |h| match h {
                    FeedHandler::Contract(f) => invoke("contract", || f(update)),
                    _ => false,
                });
                delivered +=
                    self.each(|h| h.on_contract.as_ref().map(|f| invoke("contract", || f(update))));
            }
            Event::Proposal(proposal) => {
                delivered += self
                    .each(|h| h.on_proposal.as_ref().map(|f| invoke("proposal", || f(proposal))));
            }
            Event::Connection(up) => {
                delivered += self
                    .each(|h| h.on_connection.as_ref().map(|f| invoke("connection", || f(*up))));
            }
            Event::Error(error) => {
                delivered += self.each(|h| h.on_error.as_ref().map(|f| invoke("error", || f(error))));
            }
        }
        tracing::trace!(?event, delivered, "event dispatched");
        delivered
    }

    fn feed<F>(&self, registry: &SubscriptionRegistry, key: &FeedKey, mut call: F) -> usize
    where
        F: FnMut(&FeedHandler) -> bool,
    {
        registry
            .get(key)
            .map(|feed| feed.handlers().filter(|handler| call(*handler)).count())
            .unwrap_or(0)
    }

    fn each<F>(&self, mut call: F) -> usize
    where
        F: FnMut(&EventHandlers) -> Option<bool>,
    {
        self.listeners
            .iter()
            .filter_map(|(_, handlers)| call(handlers))
            .filter(|ran| *ran)
            .count()
    }
}

/// Run a consumer callback, containing any panic so the connection task survives.
fn invoke<F: FnOnce()>(kind: &'static str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!(kind, "listener callback panicked");
            false
        }
    }
}
