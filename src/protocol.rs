//! Frame codec for the upstream streaming API.
//!
//! Outbound frames are plain JSON objects with an optional numeric `req_id`
//! that the server echoes back. Inbound frames are tagged by which top-level
//! key they carry (`tick`, `balance`, `authorize`, ...); a frame carrying
//! `error` is always an error regardless of other keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    errors::{Error, Result},
    types::{AccountId, ContractId, FeedKey, RequestId, SubscriptionId},
};

/// Kind of a correlated request, used for timeouts and error mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Authorize,
    Balance,
    AccountList,
    Proposal,
    Buy,
    Sell,
    Subscribe,
    Forget,
    Ping,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Authorize => "authorize",
            RequestKind::Balance => "balance",
            RequestKind::AccountList => "account_list",
            RequestKind::Proposal => "proposal",
            RequestKind::Buy => "buy",
            RequestKind::Sell => "sell",
            RequestKind::Subscribe => "subscribe",
            RequestKind::Forget => "forget",
            RequestKind::Ping => "ping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Basis {
    Stake,
    Payout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractType {
    Call,
    Put,
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractType::Call => f.write_str("CALL"),
            ContractType::Put => f.write_str("PUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Ticks,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
}

/// Parameters of a price proposal request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalParams {
    pub amount: f64,
    pub basis: Basis,
    pub contract_type: ContractType,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub symbol: String,
}

/// Everything the session can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Authorize { token: String },
    Balance,
    AccountList,
    Proposal(ProposalParams),
    Buy { proposal_id: String, price: f64 },
    Sell { contract_id: ContractId, price: f64 },
    Subscribe(FeedKey),
    Forget(SubscriptionId),
    Ping,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Authorize { .. } => RequestKind::Authorize,
            Request::Balance => RequestKind::Balance,
            Request::AccountList => RequestKind::AccountList,
            Request::Proposal(_) => RequestKind::Proposal,
            Request::Buy { .. } => RequestKind::Buy,
            Request::Sell { .. } => RequestKind::Sell,
            Request::Subscribe(_) => RequestKind::Subscribe,
            Request::Forget(_) => RequestKind::Forget,
            Request::Ping => RequestKind::Ping,
        }
    }

    /// Serialize into a text frame, stamping `req_id` when given.
    pub fn to_frame(&self, req_id: Option<RequestId>) -> Result<String> {
        let mut payload = match self {
            Request::Authorize { token } => json!({ "authorize": token }),
            Request::Balance => json!({ "balance": 1 }),
            Request::AccountList => json!({ "account_list": 1 }),
            Request::Proposal(params) => {
                let mut value = serde_json::to_value(params)?;
                value["proposal"] = json!(1);
                value
            }
            Request::Buy { proposal_id, price } => json!({ "buy": proposal_id, "price": price }),
            Request::Sell { contract_id, price } => {
                json!({ "sell": contract_id.0, "price": price })
            }
            Request::Subscribe(feed) => match feed {
                FeedKey::Ticks(symbol) => json!({ "ticks": symbol, "subscribe": 1 }),
                // Balance stays scoped to every account so pushes keep
                // flowing whichever sub-account is active.
                FeedKey::Balance => json!({ "balance": 1, "account": "all", "subscribe": 1 }),
                FeedKey::Transactions => json!({ "transaction": 1, "subscribe": 1 }),
                FeedKey::Contract(id) => json!({
                    "proposal_open_contract": 1,
                    "contract_id": id.0,
                    "subscribe": 1,
                }),
            },
            Request::Forget(id) => json!({ "forget": id.as_str() }),
            Request::Ping => json!({ "ping": 1 }),
        };

        if let Some(id) = req_id {
            payload["req_id"] = json!(id.0);
        }
        Ok(payload.to_string())
    }
}

/// Price tick for a symbol. `timestamp` is in milliseconds once decoded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tick {
    pub symbol: String,
    #[serde(rename = "quote")]
    pub price: f64,
    #[serde(rename = "epoch")]
    pub timestamp: i64,
    #[serde(default = "default_pip_size")]
    pub pip_size: u32,
}

impl Tick {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Balance {
    #[serde(default)]
    pub balance: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub loginid: AccountId,
    #[serde(skip)]
    pub is_virtual: bool,
}

/// Account transaction push. `timestamp` is in milliseconds once decoded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub contract_id: Option<ContractId>,
    #[serde(default, rename = "action", alias = "transaction_type")]
    pub transaction_type: String,
    #[serde(default)]
    pub amount: f64,
    #[serde(default, rename = "balance", alias = "balance_after")]
    pub balance_after: f64,
    #[serde(default, rename = "transaction_time")]
    pub timestamp: i64,
}

/// Priced proposal. `symbol` and `contract_type` come from the echoed request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Proposal {
    pub id: String,
    #[serde(skip)]
    pub symbol: String,
    #[serde(skip)]
    pub contract_type: String,
    #[serde(default)]
    pub payout: f64,
    #[serde(default)]
    pub ask_price: f64,
    #[serde(default)]
    pub spot: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Open,
    Won,
    Lost,
    Sold,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContractUpdate {
    pub contract_id: ContractId,
    #[serde(default = "open_status")]
    pub status: ContractStatus,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub payout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Purchase {
    pub contract_id: ContractId,
    #[serde(default)]
    pub transaction_id: u64,
    #[serde(default)]
    pub buy_price: f64,
    #[serde(default)]
    pub balance_after: f64,
    #[serde(default)]
    pub payout: f64,
    #[serde(default)]
    pub longcode: String,
    #[serde(default)]
    pub start_time: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sale {
    pub contract_id: ContractId,
    #[serde(default)]
    pub transaction_id: u64,
    #[serde(default)]
    pub sold_for: f64,
    #[serde(default)]
    pub balance_after: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccountSummary {
    pub loginid: AccountId,
    #[serde(default)]
    pub currency: String,
    #[serde(default, deserialize_with = "flag")]
    pub is_virtual: bool,
    #[serde(default)]
    pub account_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Authorization {
    pub loginid: AccountId,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default, deserialize_with = "flag")]
    pub is_virtual: bool,
    #[serde(default)]
    pub account_list: Vec<AccountSummary>,
}

/// Upstream error object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Decoded payload of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Tick(Tick),
    Balance(Balance),
    Transaction(Transaction),
    Proposal(Proposal),
    Contract(ContractUpdate),
    Buy(Purchase),
    Sell(Sale),
    Authorize(Authorization),
    AccountList(Vec<AccountSummary>),
    Forget(bool),
    Pong,
    Error(ApiError),
}

impl Inbound {
    pub fn tag(&self) -> &'static str {
        match self {
            Inbound::Tick(_) => "tick",
            Inbound::Balance(_) => "balance",
            Inbound::Transaction(_) => "transaction",
            Inbound::Proposal(_) => "proposal",
            Inbound::Contract(_) => "proposal_open_contract",
            Inbound::Buy(_) => "buy",
            Inbound::Sell(_) => "sell",
            Inbound::Authorize(_) => "authorize",
            Inbound::AccountList(_) => "account_list",
            Inbound::Forget(_) => "forget",
            Inbound::Pong => "ping",
            Inbound::Error(_) => "error",
        }
    }
}

/// An inbound frame with its correlation metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub req_id: Option<RequestId>,
    pub subscription: Option<SubscriptionId>,
    pub message: Inbound,
}

fn default_pip_size() -> u32 {
    4
}

fn open_status() -> ContractStatus {
    ContractStatus::Open
}

/// Decode a text frame. Unknown tags and malformed payloads are protocol errors.
pub fn decode(text: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::Protocol("frame is not a JSON object".to_string()))?;

    let req_id = object.get("req_id").and_then(Value::as_u64).map(RequestId);
    let subscription = object
        .get("subscription")
        .and_then(|sub| sub.get("id"))
        .and_then(Value::as_str)
        .map(SubscriptionId::new);

    let message = classify(object)?;
    Ok(Frame {
        req_id,
        subscription,
        message,
    })
}

fn classify(object: &Map<String, Value>) -> Result<Inbound> {
    if let Some(error) = object.get("error") {
        return Ok(Inbound::Error(field(error, "error")?));
    }

    if let Some(tick) = object.get("tick") {
        let mut tick: Tick = field(tick, "tick")?;
        tick.timestamp = epoch_millis(tick.timestamp, "tick epoch")?;
        return Ok(Inbound::Tick(tick));
    }

    if let Some(balance) = object.get("balance") {
        let mut balance: Balance = field(balance, "balance")?;
        balance.is_virtual = balance.loginid.is_virtual();
        return Ok(Inbound::Balance(balance));
    }

    if let Some(transaction) = object.get("transaction") {
        let mut transaction: Transaction = field(transaction, "transaction")?;
        transaction.timestamp = epoch_millis(transaction.timestamp, "transaction time")?;
        return Ok(Inbound::Transaction(transaction));
    }

    if let Some(contract) = object.get("proposal_open_contract") {
        return Ok(Inbound::Contract(field(contract, "proposal_open_contract")?));
    }

    if let Some(proposal) = object.get("proposal") {
        let mut proposal: Proposal = field(proposal, "proposal")?;
        let echo = object.get("echo_req");
        let echoed = |key: &str| {
            echo.and_then(|e| e.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        proposal.symbol = echoed("symbol");
        proposal.contract_type = echoed("contract_type");
        return Ok(Inbound::Proposal(proposal));
    }

    if let Some(buy) = object.get("buy") {
        return Ok(Inbound::Buy(field(buy, "buy")?));
    }

    if let Some(sell) = object.get("sell") {
        return Ok(Inbound::Sell(field(sell, "sell")?));
    }

    if let Some(authorize) = object.get("authorize") {
        return Ok(Inbound::Authorize(field(authorize, "authorize")?));
    }

    if let Some(accounts) = object.get("account_list") {
        return Ok(Inbound::AccountList(field(accounts, "account_list")?));
    }

    if let Some(forget) = object.get("forget") {
        let forgotten = forget.as_bool().unwrap_or_else(|| forget.as_i64() == Some(1));
        return Ok(Inbound::Forget(forgotten));
    }

    if object.contains_key("ping") {
        return Ok(Inbound::Pong);
    }

    let tag = object
        .get("msg_type")
        .and_then(Value::as_str)
        .unwrap_or("<untagged>");
    Err(Error::Protocol(format!("unrecognised frame type {tag}")))
}

fn epoch_millis(seconds: i64, what: &str) -> Result<i64> {
    seconds
        .checked_mul(1000)
        .ok_or_else(|| Error::Protocol(format!("{what} out of range: {seconds}")))
}

fn field<T: for<'de> Deserialize<'de>>(value: &Value, name: &str) -> Result<T> {
    T::deserialize(value)
        .map_err(|err| Error::Protocol(format!("malformed {name} payload: {err}")))
}

/// The API encodes booleans as `0`/`1` in several places.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}
