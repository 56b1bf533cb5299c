//! Public handle over the connection task.
//!
//! A [`SessionManager`] is cheap to clone; every clone talks to the same
//! connection task and therefore the same physical socket. Dropping the last
//! clone closes the socket with the intentional close code.

mod switch;
mod task;

use std::{
    fmt,
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot, watch};

pub use switch::SwitchStep;
use task::{Command, ConnectionTask};

use crate::{
    config::SessionConfig,
    dispatcher::{EventHandlers, FeedHandler},
    errors::{Error, Result},
    protocol::{
        AccountSummary, Authorization, Balance, ContractUpdate, Inbound, Proposal, ProposalParams,
        Purchase, Request, RequestKind, Sale, Tick, Transaction,
    },
    token::{HttpTokenExchange, TokenExchange},
    transport::{ConnectionState, Connector, WsConnector},
    types::{AccountId, ContractId, FeedKey, ListenerId},
};

const COMMAND_BUFFER: usize = 64;

/// Snapshot published by the connection task after every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub account: Option<AccountId>,
}

pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connector>>,
    tokens: Option<Arc<dyn TokenExchange>>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            connector: None,
            tokens: None,
        }
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn token_exchange(mut self, tokens: impl TokenExchange + 'static) -> Self {
        self.tokens = Some(Arc::new(tokens));
        self
    }

    /// Validate the config and spawn the connection task. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> Result<SessionManager> {
        self.config.validate()?;
        let url = self.config.ws_url()?;

        let tokens = match self.tokens {
            Some(tokens) => Some(tokens),
            None if !self.config.token_exchange.base_url.is_empty() => {
                let http = HttpTokenExchange::new(&self.config.token_exchange)?;
                Some(Arc::new(http) as Arc<dyn TokenExchange>)
            }
            None => None,
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector) as Arc<dyn Connector>);

        let config = Arc::new(self.config);
        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let task = ConnectionTask::new(Arc::clone(&config), url, connector, inbox, status_tx);
        tokio::spawn(task.run());

        Ok(SessionManager {
            commands,
            status,
            tokens,
            switching: Arc::new(AtomicBool::new(false)),
            config,
        })
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("custom_connector", &self.connector.is_some())
            .field("token_exchange", &self.tokens.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    tokens: Option<Arc<dyn TokenExchange>>,
    switching: Arc<AtomicBool>,
    config: Arc<SessionConfig>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("status", &*self.status.borrow())
            .field("token_exchange", &self.tokens.is_some())
            .finish()
    }
}

impl SessionManager {
    /// Session over real websockets, with HTTP token exchange when
    /// `token_exchange.base_url` is configured.
    pub fn new(config: SessionConfig) -> Result<Self> {
        SessionBuilder::new(config).build()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionState::Connected
    }

    /// Account of the last successful authorization, if it is still current.
    pub fn current_account(&self) -> Option<AccountId> {
        self.status.borrow().account.clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Open the socket. Resolves once connected; a no-op when already
    /// connected, rejected while another attempt is in flight.
    pub async fn connect(&self) -> Result<()> {
        self.call(Command::Connect).await?
    }

    /// Close with the intentional code. Never triggers a reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(Command::Disconnect).await
    }

    /// Intentional close plus full local teardown, then a fresh connect.
    /// The last authorized account is still reported until the next authorize.
    pub async fn force_reconnection(&self) -> Result<()> {
        self.call(Command::ForceReconnect).await?
    }

    pub async fn authorize(&self, token: &str, forget_first: bool) -> Result<Authorization> {
        if forget_first {
            self.forget_all_subscriptions().await?;
        }
        let request = Request::Authorize {
            token: token.to_string(),
        };
        match self.request(request, self.config.request_timeout()).await? {
            Inbound::Authorize(authorization) => Ok(authorization),
            other => Err(unexpected(RequestKind::Authorize, &other)),
        }
    }

    pub async fn subscribe_ticks(
        &self,
        symbol: &str,
        listener: impl Into<ListenerId>,
        on_tick: impl Fn(&Tick) + Send + Sync + 'static,
    ) -> Result<()> {
        let handler = FeedHandler::Tick(Arc::new(on_tick));
        self.subscribe(FeedKey::ticks(symbol), listener.into(), handler)
            .await
    }

    pub async fn subscribe_balance(
        &self,
        listener: impl Into<ListenerId>,
        on_balance: impl Fn(&Balance) + Send + Sync + 'static,
    ) -> Result<()> {
        let handler = FeedHandler::Balance(Arc::new(on_balance));
        self.subscribe(FeedKey::Balance, listener.into(), handler)
            .await
    }

    pub async fn subscribe_transactions(
        &self,
        listener: impl Into<ListenerId>,
        on_transaction: impl Fn(&Transaction) + Send + Sync + 'static,
    ) -> Result<()> {
        let handler = FeedHandler::Transaction(Arc::new(on_transaction));
        self.subscribe(FeedKey::Transactions, listener.into(), handler)
            .await
    }

    /// Follow an open contract until it settles.
    pub async fn subscribe_contract(
        &self,
        contract_id: ContractId,
        listener: impl Into<ListenerId>,
        on_contract: impl Fn(&ContractUpdate) + Send + Sync + 'static,
    ) -> Result<()> {
        let handler = FeedHandler::Contract(Arc::new(on_contract));
        self.subscribe(FeedKey::Contract(contract_id), listener.into(), handler)
            .await
    }

    /// Register account-wide handlers that see every event of their kind,
    /// including connection changes and errors.
    pub async fn add_listener(
        &self,
        listener: impl Into<ListenerId>,
        handlers: EventHandlers,
    ) -> Result<()> {
        let listener = listener.into();
        self.call(|reply| Command::AddListener {
            listener,
            handlers,
            reply,
        })
        .await
    }

    /// Detach `listener` from every feed and from the account-wide table.
    /// Upstream subscriptions stay active unless `forget_idle_feeds` is set.
    pub async fn unsubscribe(&self, listener: impl Into<ListenerId>) -> Result<()> {
        let listener = listener.into();
        self.call(|reply| Command::Unsubscribe { listener, reply })
            .await?
    }

    /// Forget every upstream subscription and empty the registry. Returns
    /// how many `forget` frames were sent.
    pub async fn forget_all_subscriptions(&self) -> Result<usize> {
        self.call(Command::ForgetAll).await?
    }

    pub async fn get_balance(&self) -> Result<Balance> {
        match self
            .request(Request::Balance, self.config.request_timeout())
            .await?
        {
            Inbound::Balance(balance) => Ok(balance),
            other => Err(unexpected(RequestKind::Balance, &other)),
        }
    }

    pub async fn get_account_list(&self) -> Result<Vec<AccountSummary>> {
        match self
            .request(Request::AccountList, self.config.request_timeout())
            .await?
        {
            Inbound::AccountList(accounts) => Ok(accounts),
            other => Err(unexpected(RequestKind::AccountList, &other)),
        }
    }

    pub async fn get_proposal(&self, params: ProposalParams) -> Result<Proposal> {
        let symbol = params.symbol.clone();
        let contract_type = params.contract_type.to_string();
        match self
            .request(Request::Proposal(params), self.config.request_timeout())
            .await?
        {
            Inbound::Proposal(mut proposal) => {
                if proposal.symbol.is_empty() {
                    proposal.symbol = symbol;
                }
                if proposal.contract_type.is_empty() {
                    proposal.contract_type = contract_type;
                }
                Ok(proposal)
            }
            other => Err(unexpected(RequestKind::Proposal, &other)),
        }
    }

    pub async fn buy_contract(&self, proposal_id: &str, price: f64) -> Result<Purchase> {
        let request = Request::Buy {
            proposal_id: proposal_id.to_string(),
            price,
        };
        match self.request(request, self.config.purchase_timeout()).await? {
            Inbound::Buy(purchase) => {
                tracing::info!(contract_id = %purchase.contract_id, buy_price = purchase.buy_price, "contract bought");
                Ok(purchase)
            }
            other => Err(unexpected(RequestKind::Buy, &other)),
        }
    }

    pub async fn sell_contract(&self, contract_id: ContractId, price: f64) -> Result<Sale> {
        let request = Request::Sell { contract_id, price };
        match self.request(request, self.config.request_timeout()).await? {
            Inbound::Sell(sale) => {
                tracing::info!(contract_id = %sale.contract_id, sold_for = sale.sold_for, "contract sold");
                Ok(sale)
            }
            other => Err(unexpected(RequestKind::Sell, &other)),
        }
    }

    async fn subscribe(&self, key: FeedKey, listener: ListenerId, handler: FeedHandler) -> Result<()> {
        self.call(|reply| Command::Subscribe {
            key,
            listener,
            handler,
            reply,
        })
        .await?
    }

    async fn request(&self, request: Request, timeout: Duration) -> Result<Inbound> {
        let response = self
            .call(|reply| Command::Request {
                request,
                timeout,
                reply,
            })
            .await??;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    async fn call<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::SessionClosed)?;
        response.await.map_err(|_| Error::SessionClosed)
    }
}

fn unexpected(kind: RequestKind, message: &Inbound) -> Error {
    Error::Protocol(format!(
        "unexpected {} frame in response to {kind}",
        message.tag()
    ))
}
