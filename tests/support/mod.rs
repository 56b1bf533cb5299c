//! In-memory upstream for driving a `SessionManager` without a network.
//!
//! Every accepted connection gets its own scripted server task that answers
//! requests the way the streaming API does.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use deriv_session::{
    AccountId, CloseFrameInfo, ConnectionError, Connector, Error, Result, SessionConfig,
    SessionManager, TokenExchange, Transport, TransportFrame,
};
use serde_json::{json, Value};
use tokio::{sync::mpsc, time::Instant};
use url::Url;

type TransportResult<T> = std::result::Result<T, ConnectionError>;

/// What the next dial does.
#[derive(Debug, Clone, Copy)]
pub enum Dial {
    Accept,
    Refuse,
    Delay(Duration),
}

#[derive(Default)]
struct NetworkState {
    script: VecDeque<Dial>,
    dials: Vec<Instant>,
    silent: HashSet<&'static str>,
}

pub struct Network {
    state: Arc<Mutex<NetworkState>>,
    peers_tx: mpsc::UnboundedSender<Peer>,
    peers: mpsc::UnboundedReceiver<Peer>,
}

impl Network {
    pub fn new() -> Self {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        Self {
            state: Arc::default(),
            peers_tx,
            peers,
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            state: Arc::clone(&self.state),
            peers: self.peers_tx.clone(),
        }
    }

    /// Queue outcomes for the next dials; once drained every dial is accepted.
    pub fn script(&self, dials: impl IntoIterator<Item = Dial>) {
        self.state.lock().unwrap().script.extend(dials);
    }

    /// Requests of this kind (`"balance"`, `"authorize"`, ...) never get a reply.
    pub fn silence(&self, kind: &'static str) {
        self.state.lock().unwrap().silent.insert(kind);
    }

    pub fn dials(&self) -> Vec<Instant> {
        self.state.lock().unwrap().dials.clone()
    }

    pub async fn accept(&mut self) -> Peer {
        tokio::time::timeout(Duration::from_secs(120), self.peers.recv())
            .await
            .expect("no connection accepted")
            .expect("network closed")
    }

    pub fn try_accept(&mut self) -> Option<Peer> {
        self.peers.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<NetworkState>>,
    peers: mpsc::UnboundedSender<Peer>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &Url) -> TransportResult<Box<dyn Transport>> {
        let (dial, silent) = {
            let mut state = self.state.lock().unwrap();
            state.dials.push(Instant::now());
            let dial = state.script.pop_front().unwrap_or(Dial::Accept);
            (dial, state.silent.clone())
        };
        match dial {
            Dial::Refuse => {
                return Err(ConnectionError::Transport("connection refused".to_string()))
            }
            Dial::Delay(delay) => tokio::time::sleep(delay).await,
            Dial::Accept => {}
        }
        let (transport, peer) = open_pair(silent);
        let _ = self.peers.send(peer);
        Ok(Box::new(transport))
    }
}

struct FakeTransport {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<TransportFrame>,
    close_code: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, text: String) -> TransportResult<()> {
        self.outgoing
            .send(text)
            .map_err(|_| ConnectionError::Transport("peer gone".to_string()))
    }

    async fn next_frame(&mut self) -> TransportResult<TransportFrame> {
        Ok(self
            .incoming
            .recv()
            .await
            .unwrap_or(TransportFrame::Closed(None)))
    }

    async fn close(&mut self, code: u16, _reason: &str) -> TransportResult<()> {
        *self.close_code.lock().unwrap() = Some(code);
        Ok(())
    }
}

/// Test-side view of one accepted connection.
pub struct Peer {
    to_client: mpsc::UnboundedSender<TransportFrame>,
    log: Arc<Mutex<Vec<Value>>>,
    pings: Arc<AtomicUsize>,
    close_code: Arc<Mutex<Option<u16>>>,
}

impl Peer {
    /// Every non-heartbeat frame the client sent, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_with(&self, key: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|request| request.get(key).is_some())
            .collect()
    }

    pub fn subscribes(&self) -> Vec<Value> {
        self.requests_with("subscribe")
    }

    pub fn forgets(&self) -> Vec<String> {
        self.requests_with("forget")
            .into_iter()
            .filter_map(|request| request["forget"].as_str().map(str::to_string))
            .collect()
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn push(&self, frame: Value) {
        let _ = self.to_client.send(TransportFrame::Text(frame.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(TransportFrame::Text(text.to_string()));
    }

    /// Server-initiated close with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportFrame::Closed(Some(CloseFrameInfo {
            code,
            reason: "server close".to_string(),
        })));
    }

    /// Client-initiated close code, if the client closed this connection.
    pub fn close_code(&self) -> Option<u16> {
        *self.close_code.lock().unwrap()
    }
}

fn open_pair(silent: HashSet<&'static str>) -> (FakeTransport, Peer) {
    let (outgoing, mut from_client) = mpsc::unbounded_channel::<String>();
    let (to_client, incoming) = mpsc::unbounded_channel::<TransportFrame>();
    let log = Arc::new(Mutex::new(Vec::new()));
    let pings = Arc::new(AtomicUsize::new(0));
    let close_code = Arc::new(Mutex::new(None));

    let responder = to_client.clone();
    let server_log = Arc::clone(&log);
    let server_pings = Arc::clone(&pings);
    tokio::spawn(async move {
        let mut server = FakeDeriv::new(silent);
        while let Some(text) = from_client.recv().await {
            let request: Value = serde_json::from_str(&text).expect("client sent invalid json");
            if request.get("ping").is_some() {
                server_pings.fetch_add(1, Ordering::SeqCst);
            } else {
                server_log.lock().unwrap().push(request.clone());
            }
            for response in server.respond(&request) {
                if responder
                    .send(TransportFrame::Text(response.to_string()))
                    .is_err()
                {
                    return;
                }
            }
        }
    });

    let transport = FakeTransport {
        outgoing,
        incoming,
        close_code: Arc::clone(&close_code),
    };
    let peer = Peer {
        to_client,
        log,
        pings,
        close_code,
    };
    (transport, peer)
}

/// Answers requests like the upstream API. Tokens have the form
/// `tok-<loginid>`; anything else is rejected.
struct FakeDeriv {
    silent: HashSet<&'static str>,
    login: String,
}

const KINDS: [&str; 11] = [
    "authorize",
    "account_list",
    "proposal_open_contract",
    "proposal",
    "buy",
    "sell",
    "ticks",
    "transaction",
    "balance",
    "forget",
    "ping",
];

impl FakeDeriv {
    fn new(silent: HashSet<&'static str>) -> Self {
        Self {
            silent,
            login: String::new(),
        }
    }

    fn respond(&mut self, request: &Value) -> Vec<Value> {
        let Some(kind) = KINDS.iter().find(|kind| request.get(**kind).is_some()) else {
            return Vec::new();
        };
        if self.silent.contains(kind) {
            return Vec::new();
        }

        let subscribing = request.get("subscribe").is_some();
        let mut response = match *kind {
            "authorize" => self.authorize(request["authorize"].as_str().unwrap_or_default()),
            "balance" => {
                let mut frame = json!({
                    "msg_type": "balance",
                    "balance": {"balance": 1000.0, "currency": "USD", "loginid": self.login},
                });
                if subscribing {
                    frame["subscription"] = json!({"id": format!("bal-{}", self.login)});
                }
                frame
            }
            "account_list" => json!({"msg_type": "account_list", "account_list": accounts()}),
            "ticks" => {
                let symbol = request["ticks"].as_str().unwrap_or_default();
                if symbol == "BAD" {
                    json!({
                        "msg_type": "tick",
                        "error": {"code": "InvalidSymbol", "message": "Symbol BAD is invalid"},
                    })
                } else {
                    json!({
                        "msg_type": "tick",
                        "tick": {"symbol": symbol, "quote": 100.0, "epoch": 1_699_999_999, "pip_size": 2},
                        "subscription": {"id": format!("tick-{symbol}")},
                    })
                }
            }
            "transaction" => json!({
                "msg_type": "transaction",
                "transaction": {"balance": 1000.0},
                "subscription": {"id": "tx-1"},
            }),
            "proposal_open_contract" => {
                let contract_id = request["contract_id"].as_u64().unwrap_or_default();
                json!({
                    "msg_type": "proposal_open_contract",
                    "proposal_open_contract": {"contract_id": contract_id, "status": "open", "profit": 0.5},
                    "subscription": {"id": format!("poc-{contract_id}")},
                })
            }
            "proposal" => {
                let amount = request["amount"].as_f64().unwrap_or_default();
                json!({
                    "msg_type": "proposal",
                    "echo_req": request,
                    "proposal": {"id": "prop-1", "ask_price": amount, "payout": amount * 1.95, "spot": 100.0},
                })
            }
            "buy" => json!({
                "msg_type": "buy",
                "buy": {
                    "contract_id": 555,
                    "transaction_id": 9001,
                    "buy_price": request["price"],
                    "balance_after": 990.0,
                    "payout": 19.5,
                    "longcode": "Win payout if Volatility 100 Index is strictly higher than entry spot.",
                    "start_time": 1_700_000_000,
                },
            }),
            "sell" => json!({
                "msg_type": "sell",
                "sell": {
                    "contract_id": request["sell"],
                    "transaction_id": 9002,
                    "sold_for": request["price"],
                    "balance_after": 1005.0,
                },
            }),
            "forget" => json!({"msg_type": "forget", "forget": 1}),
            _ => json!({"msg_type": "ping", "ping": "pong"}),
        };

        if let Some(req_id) = request.get("req_id") {
            response["req_id"] = req_id.clone();
        }
        vec![response]
    }

    fn authorize(&mut self, token: &str) -> Value {
        match token.strip_prefix("tok-") {
            Some(login) => {
                self.login = login.to_string();
                json!({
                    "msg_type": "authorize",
                    "authorize": {
                        "loginid": login,
                        "currency": "USD",
                        "balance": 1000.0,
                        "is_virtual": u8::from(login.starts_with("VR")),
                        "account_list": accounts(),
                    },
                })
            }
            None => json!({
                "msg_type": "authorize",
                "error": {"code": "InvalidToken", "message": "The token is invalid."},
            }),
        }
    }
}

fn accounts() -> Value {
    json!([
        {"loginid": "CR1", "currency": "USD", "is_virtual": 0, "account_type": "trading"},
        {"loginid": "CR2", "currency": "USD", "is_virtual": 0, "account_type": "trading"},
        {"loginid": "VRTC9", "currency": "USD", "is_virtual": 1, "account_type": "trading"},
    ])
}

/// Token exchange backed by a fixed table.
#[derive(Clone, Default)]
pub struct FakeTokens {
    tokens: HashMap<String, String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, account: &str, token: &str) -> Self {
        self.tokens.insert(account.to_string(), token.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchange for FakeTokens {
    async fn account_token(&self, account: &AccountId) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.tokens
            .get(account.as_str())
            .cloned()
            .ok_or_else(|| Error::TokenExchange(format!("no token for {account}")))
    }
}

pub fn session(net: &Network, tokens: FakeTokens) -> SessionManager {
    session_with(SessionConfig::default(), net, tokens)
}

pub fn session_with(config: SessionConfig, net: &Network, tokens: FakeTokens) -> SessionManager {
    SessionManager::builder(config)
        .connector(net.connector())
        .token_exchange(tokens)
        .build()
        .expect("valid session config")
}

/// Let every spawned task run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Connect and authorize as `login`, returning the live peer.
pub async fn login(session: &SessionManager, net: &mut Network, login: &str) -> Peer {
    session.connect().await.expect("connect");
    let peer = net.accept().await;
    session
        .authorize(&format!("tok-{login}"), false)
        .await
        .expect("authorize");
    settle().await;
    peer
}
