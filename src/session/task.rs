use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant, Interval, MissedTickBehavior},
};
use url::Url;

use super::SessionStatus;
use crate::{
    config::SessionConfig,
    correlator::{PendingRequest, RequestCorrelator},
    dispatcher::{Dispatcher, ErrorEvent, Event, EventHandlers, FeedHandler},
    errors::{ConnectionError, Error, Result},
    protocol::{self, Authorization, Frame, Inbound, Request, RequestKind},
    registry::{Attach, SubscriptionRegistry},
    timings::{time_async_block, time_block},
    transport::{
        ConnectionState, Connector, ReconnectPolicy, Transport, TransportFrame, TransportResult,
        INTENTIONAL_CLOSE,
    },
    types::{AccountId, FeedKey, ListenerId, RequestId, SubscriptionId},
};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub(crate) type Reply<T> = oneshot::Sender<T>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Inbound>>;

pub(crate) enum Command {
    Connect(Reply<Result<()>>),
    Disconnect(Reply<()>),
    ForceReconnect(Reply<Result<()>>),
    Request {
        request: Request,
        timeout: Duration,
        reply: Reply<Result<ResponseReceiver>>,
    },
    Subscribe {
        key: FeedKey,
        listener: ListenerId,
        handler: FeedHandler,
        reply: Reply<Result<()>>,
    },
    EnsureFeed {
        key: FeedKey,
        reply: Reply<Result<()>>,
    },
    AddListener {
        listener: ListenerId,
        handlers: EventHandlers,
        reply: Reply<()>,
    },
    Unsubscribe {
        listener: ListenerId,
        reply: Reply<Result<()>>,
    },
    ForgetAll(Reply<Result<usize>>),
    Broadcast {
        event: Event,
        reply: Reply<usize>,
    },
}

/// Credentials of the account the socket was last authorized for.
pub(crate) struct AuthSession {
    token: String,
    account: AccountId,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("account", &self.account)
            .field("token_len", &self.token.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthOnTeardown {
    Clear,
    Keep,
}

struct DialOutcome {
    generation: u64,
    result: TransportResult<Box<dyn Transport>>,
}

/// Owns the socket and every piece of protocol state. All mutation happens
/// on this task; the public handle only sends [`Command`]s.
pub(crate) struct ConnectionTask {
    config: Arc<SessionConfig>,
    url: Url,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SessionStatus>,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    correlator: RequestCorrelator,
    registry: SubscriptionRegistry,
    dispatcher: Dispatcher,
    auth: Option<AuthSession>,
    // The current socket has accepted `auth`; false again after any reconnect.
    authorized: bool,
    policy: ReconnectPolicy,
    generation: u64,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
    dial_rx: mpsc::UnboundedReceiver<DialOutcome>,
    connect_waiters: Vec<Reply<Result<()>>>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
}

impl ConnectionTask {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        url: Url,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let policy = ReconnectPolicy::from_config(&config.reconnect);
        Self {
            config,
            url,
            connector,
            commands,
            status,
            state: ConnectionState::Disconnected,
            transport: None,
            correlator: RequestCorrelator::new(),
            registry: SubscriptionRegistry::new(),
            dispatcher: Dispatcher::new(),
            auth: None,
            authorized: false,
            policy,
            generation: 0,
            dial_tx,
            dial_rx,
            connect_waiters: Vec::new(),
            reconnect_at: None,
            heartbeat: None,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(url = %self.url, "session task started");
        loop {
            let deadline = self.correlator.next_deadline();
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(outcome) = self.dial_rx.recv() => self.on_dial(outcome).await,
                frame = next_frame(&mut self.transport) => self.on_transport(frame).await,
                _ = heartbeat_tick(&mut self.heartbeat) => self.send_heartbeat().await,
                _ = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_dial();
                }
                _ = sleep_until(deadline) => {
                    self.correlator.expire(Instant::now());
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(reply),
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::ForceReconnect(reply) => self.force_reconnection(reply).await,
            Command::Request {
                request,
                timeout,
                reply,
            } => {
                let result = self.send_request(request, timeout).await;
                let _ = reply.send(result);
            }
            Command::Subscribe {
                key,
                listener,
                handler,
                reply,
            } => {
                let result = self.subscribe(key, listener, handler).await;
                let _ = reply.send(result);
            }
            Command::EnsureFeed { key, reply } => {
                let result = self.ensure_feed(key).await;
                let _ = reply.send(result);
            }
            Command::AddListener {
                listener,
                handlers,
                reply,
            } => {
                tracing::debug!(%listener, "listener added");
                self.dispatcher.add_listener(listener, handlers);
                let _ = reply.send(());
            }
            Command::Unsubscribe { listener, reply } => {
                let result = self.unsubscribe(&listener).await;
                let _ = reply.send(result);
            }
            Command::ForgetAll(reply) => {
                let result = self.forget_all().await;
                let _ = reply.send(result);
            }
            Command::Broadcast { event, reply } => {
                let _ = reply.send(self.dispatcher.dispatch(&self.registry, &event));
            }
        }
    }

    fn connect(&mut self, reply: Reply<Result<()>>) {
        match self.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                tracing::debug!(state = %self.state, "connect rejected, attempt in flight");
                let _ = reply.send(Err(ConnectionError::AlreadyConnecting.into()));
            }
            ConnectionState::Disconnected => {
                self.connect_waiters.push(reply);
                self.set_state(ConnectionState::Connecting);
                self.start_dial();
            }
        }
    }

    fn start_dial(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let url = self.url.clone();
        let budget = self.config.connect_timeout();
        let outcomes = self.dial_tx.clone();

        tracing::info!(url = %url, attempt = self.policy.attempts(), generation, "dialing");
        tokio::spawn(async move {
            let dial = async {
                match time::timeout(budget, connector.connect(&url)).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectionError::Timeout(budget)),
                }
            };
            let result = time_async_block("dial", dial).await;
            let _ = outcomes.send(DialOutcome { generation, result });
        });
    }

    async fn on_dial(&mut self, outcome: DialOutcome) {
        if outcome.generation != self.generation {
            if let Ok(mut stale) = outcome.result {
                tracing::debug!(generation = outcome.generation, "closing superseded connection");
                close_quietly(&mut stale, "superseded").await;
            }
            return;
        }

        match outcome.result {
            Ok(transport) => self.on_open(transport),
            Err(err) => self.on_dial_failed(err),
        }
    }

    fn on_open(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.policy.reset();
        self.reconnect_at = None;

        let period = self.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        self.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.url, "connected");
        self.dispatcher
            .dispatch(&self.registry, &Event::Connection(true));
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn on_dial_failed(&mut self, err: ConnectionError) {
        if self.state == ConnectionState::Reconnecting {
            tracing::warn!(attempt = self.policy.attempts(), error = %err, "reconnect attempt failed");
            self.schedule_reconnect();
            return;
        }

        tracing::error!(error = %err, "connection attempt failed");
        self.set_state(ConnectionState::Disconnected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone().into()));
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.policy.schedule() {
            Some(delay) => {
                tracing::warn!(
                    attempt = self.policy.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting);
            }
            None => {
                let attempts = self.policy.attempts();
                tracing::error!(attempts, "reconnect budget exhausted");
                self.reconnect_at = None;
                self.set_state(ConnectionState::Disconnected);
                let err = ConnectionError::ReconnectExhausted { attempts };
                let event = ErrorEvent::new(ErrorEvent::RECONNECT_EXHAUSTED, err.to_string());
                self.dispatcher.dispatch(&self.registry, &Event::Error(event));
            }
        }
    }

    async fn disconnect(&mut self) {
        // Invalidates any dial still in flight.
        self.generation = self.generation.wrapping_add(1);
        self.reconnect_at = None;
        if let Some(transport) = self.transport.as_mut() {
            close_quietly(transport, "client disconnect").await;
        }
        self.teardown(AuthOnTeardown::Clear);
        self.policy.reset();
        self.set_state(ConnectionState::Disconnected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ConnectionError::Closed.into()));
        }
        tracing::info!("disconnected");
    }

    /// Close with the intentional code, tear everything down except the
    /// auth session, then dial again.
    async fn force_reconnection(&mut self, reply: Reply<Result<()>>) {
        tracing::info!(state = %self.state, "forcing reconnection");
        if self.state == ConnectionState::Connecting {
            self.connect_waiters.push(reply);
            return;
        }

        self.generation = self.generation.wrapping_add(1);
        self.reconnect_at = None;
        if let Some(transport) = self.transport.as_mut() {
            close_quietly(transport, "reconnect").await;
        }
        self.teardown(AuthOnTeardown::Keep);
        self.set_state(ConnectionState::Disconnected);
        tokio::task::yield_now().await;
        self.connect(reply);
    }

    fn teardown(&mut self, auth: AuthOnTeardown) {
        let was_open = self.transport.take().is_some();
        self.heartbeat = None;
        self.registry.clear();
        if !self.correlator.is_empty() {
            let failed = self.correlator.fail_all(|| ConnectionError::Closed.into());
            tracing::debug!(failed, "pending requests rejected");
        }
        self.authorized = false;
        if auth == AuthOnTeardown::Clear {
            self.auth = None;
        }
        self.publish();
        if was_open {
            self.dispatcher
                .dispatch(&self.registry, &Event::Connection(false));
        }
    }

    async fn shutdown(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(transport) = self.transport.as_mut() {
            close_quietly(transport, "session dropped").await;
        }
        self.teardown(AuthOnTeardown::Clear);
        self.set_state(ConnectionState::Disconnected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(Error::SessionClosed));
        }
        tracing::debug!("session task stopped");
    }

    async fn on_transport(&mut self, frame: TransportResult<TransportFrame>) {
        match frame {
            Ok(TransportFrame::Text(text)) => self.on_text(&text).await,
            Ok(TransportFrame::Closed(Some(info))) if info.is_intentional() => {
                tracing::info!(code = info.code, reason = %info.reason, "server closed the connection");
                self.teardown(AuthOnTeardown::Clear);
                self.set_state(ConnectionState::Disconnected);
            }
            Ok(TransportFrame::Closed(info)) => {
                tracing::warn!(?info, "connection closed abnormally");
                self.on_abnormal_close();
            }
            Err(err) => {
                tracing::error!(error = %err, "transport failure");
                self.on_abnormal_close();
            }
        }
    }

    fn on_abnormal_close(&mut self) {
        self.teardown(AuthOnTeardown::Clear);
        self.schedule_reconnect();
    }

    async fn on_text(&mut self, text: &str) {
        let frame = match time_block("decode", || protocol::decode(text)) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable frame");
                let event = ErrorEvent::new(ErrorEvent::PROTOCOL, err.to_string());
                self.dispatcher.dispatch(&self.registry, &Event::Error(event));
                return;
            }
        };

        if let Some(req_id) = frame.req_id {
            if let Some(pending) = self.correlator.take(req_id) {
                self.resolve(req_id, pending, frame).await;
                return;
            }
            if self.registry.is_subscribe_request(req_id) {
                self.on_subscribe_ack(req_id, frame).await;
                return;
            }
            if self.registry.claim_orphan(req_id) {
                if let Some(id) = frame.subscription {
                    tracing::debug!(%req_id, subscription = %id, "forgetting orphaned subscription");
                    let _ = self.send_forget(id).await;
                }
                return;
            }
            if frame.subscription.is_none() {
                tracing::debug!(%req_id, tag = frame.message.tag(), "late response discarded");
                return;
            }
        }

        self.broadcast_frame(frame);
    }

    async fn resolve(&mut self, req_id: RequestId, pending: PendingRequest, frame: Frame) {
        let kind = pending.kind();
        let outcome = match frame.message {
            Inbound::Error(api) => {
                tracing::warn!(%req_id, %kind, code = %api.code, message = %api.message, "request rejected");
                Err(match kind {
                    RequestKind::Authorize => Error::Authorization {
                        code: api.code,
                        message: api.message,
                    },
                    _ => Error::Api {
                        code: api.code,
                        message: api.message,
                    },
                })
            }
            Inbound::Authorize(authorization) => {
                self.on_authorized(&pending.request, &authorization).await;
                Ok(Inbound::Authorize(authorization))
            }
            message => Ok(message),
        };

        let waited = Instant::now() - pending.created_at;
        tracing::debug!(%req_id, %kind, waited_ms = waited.as_millis() as u64, "request resolved");
        if !pending.resolve(outcome) {
            tracing::debug!(%req_id, "caller went away before the response");
        }
    }

    async fn on_authorized(&mut self, request: &Request, authorization: &Authorization) {
        let Request::Authorize { token } = request else {
            return;
        };
        tracing::info!(account = %authorization.loginid, "authorized");
        self.auth = Some(AuthSession {
            token: token.clone(),
            account: authorization.loginid.clone(),
        });
        self.authorized = true;
        self.publish();

        if let Err(err) = self.ensure_feed(FeedKey::Balance).await {
            tracing::warn!(error = %err, "balance subscription after authorize failed");
        }
    }

    async fn on_subscribe_ack(&mut self, req_id: RequestId, frame: Frame) {
        if let Inbound::Error(api) = &frame.message {
            if let Some(feed) = self.registry.reject(req_id) {
                tracing::warn!(feed = %feed.key, code = %api.code, "subscription rejected");
                let event = ErrorEvent::new(
                    ErrorEvent::SUBSCRIPTION_REJECTED,
                    format!("{}: {} ({})", feed.key, api.message, api.code),
                )
                .with_req_id(Some(req_id));
                self.dispatcher.dispatch(&self.registry, &Event::Error(event));
            }
            return;
        }

        if let Some(key) = self.registry.acknowledge(req_id, frame.subscription.clone()) {
            tracing::debug!(feed = %key, subscription = ?frame.subscription, "subscription acknowledged");
        }
        self.broadcast_frame(frame);
    }

    fn broadcast_frame(&mut self, frame: Frame) {
        let event = match frame.message {
            Inbound::Tick(tick) => Event::Tick(tick),
            Inbound::Balance(balance) => Event::Balance(balance),
            Inbound::Transaction(transaction) => Event::Transaction(transaction),
            Inbound::Proposal(proposal) => Event::Proposal(proposal),
            Inbound::Contract(update) => Event::Contract(update),
            Inbound::Error(api) => {
                tracing::warn!(code = %api.code, message = %api.message, "uncorrelated error");
                Event::Error(ErrorEvent::new(api.code, api.message).with_req_id(frame.req_id))
            }
            other => {
                tracing::trace!(tag = other.tag(), "frame not broadcast");
                return;
            }
        };
        self.dispatcher.dispatch(&self.registry, &event);
    }

    /// Fails unless a socket is open, and authorized when `needs_auth`.
    fn require_socket(&self, needs_auth: bool) -> Result<()> {
        if self.transport.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }
        if needs_auth && !self.authorized {
            return Err(Error::NotAuthorized);
        }
        Ok(())
    }

    async fn send_request(&mut self, request: Request, timeout: Duration) -> Result<ResponseReceiver> {
        self.require_socket(requires_auth(&request))?;

        let (req_id, receiver) = self
            .correlator
            .register(request.clone(), timeout, Instant::now());
        let frame = match request.to_frame(Some(req_id)) {
            Ok(frame) => frame,
            Err(err) => {
                self.correlator.take(req_id);
                return Err(err);
            }
        };
        self.send_text(frame).await?;
        Ok(receiver)
    }

    async fn subscribe(&mut self, key: FeedKey, listener: ListenerId, handler: FeedHandler) -> Result<()> {
        self.require_socket(key.is_account_scoped())?;

        match self.registry.attach(key.clone(), listener.clone(), handler) {
            Attach::Shared => {
                tracing::debug!(feed = %key, %listener, "joined existing feed");
                Ok(())
            }
            Attach::Subscribe => self.send_subscribe(&key).await,
        }
    }

    /// Subscribe to `key` unless a subscription exists or is in flight.
    async fn ensure_feed(&mut self, key: FeedKey) -> Result<()> {
        self.require_socket(false)?;
        match self.registry.ensure(key.clone()) {
            Attach::Shared => Ok(()),
            Attach::Subscribe => self.send_subscribe(&key).await,
        }
    }

    async fn send_subscribe(&mut self, key: &FeedKey) -> Result<()> {
        let req_id = self.correlator.next_id();
        let frame = Request::Subscribe(key.clone()).to_frame(Some(req_id))?;
        self.registry.mark_pending(key, req_id);
        tracing::debug!(feed = %key, %req_id, "subscribing");
        self.send_text(frame).await
    }

    async fn unsubscribe(&mut self, listener: &ListenerId) -> Result<()> {
        let idle = self.registry.detach(listener);
        let removed = self.dispatcher.remove_listener(listener);
        tracing::debug!(
            %listener,
            idle_feeds = idle.len(),
            removed,
            listeners = self.dispatcher.listener_count(),
            "listener detached"
        );
        if !self.config.forget_idle_feeds {
            return Ok(());
        }

        for key in idle {
            if let Some(id) = self.registry.remove_idle(&key) {
                tracing::debug!(feed = %key, subscription = %id, "forgetting idle feed");
                if self.transport.is_some() {
                    self.send_forget(id).await?;
                }
            }
        }
        Ok(())
    }

    async fn forget_all(&mut self) -> Result<usize> {
        if self.registry.is_empty() {
            return Ok(0);
        }
        let feeds = self.registry.len();
        let drained = self.registry.drain();
        let count = drained.forget.len();
        tracing::info!(
            feeds,
            forgotten = count,
            in_flight = drained.in_flight,
            "forgetting all subscriptions"
        );
        if self.transport.is_some() {
            for id in drained.forget {
                self.send_forget(id).await?;
            }
        }
        Ok(count)
    }

    async fn send_forget(&mut self, id: SubscriptionId) -> Result<()> {
        let frame = Request::Forget(id).to_frame(None)?;
        self.send_text(frame).await
    }

    async fn send_heartbeat(&mut self) {
        if let Ok(frame) = Request::Ping.to_frame(None) {
            tracing::trace!("heartbeat");
            if let Err(err) = self.send_text(frame).await {
                tracing::debug!(error = %err, "heartbeat not sent");
            }
        }
    }

    /// A failed write means the socket is gone; treat it as an abnormal close.
    async fn send_text(&mut self, text: String) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(ConnectionError::NotConnected)?;
        tracing::trace!(bytes = text.len(), "sending frame");
        match transport.send(text).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "send failed");
                self.on_abnormal_close();
                Err(err.into())
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "connection state");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(SessionStatus {
            state: self.state,
            account: self.auth.as_ref().map(|auth| auth.account.clone()),
        });
    }
}

fn requires_auth(request: &Request) -> bool {
    match request {
        Request::Balance | Request::AccountList | Request::Buy { .. } | Request::Sell { .. } => true,
        Request::Subscribe(key) => key.is_account_scoped(),
        Request::Authorize { .. } | Request::Proposal(_) | Request::Forget(_) | Request::Ping => false,
    }
}

async fn close_quietly(transport: &mut Box<dyn Transport>, reason: &str) {
    match time::timeout(CLOSE_GRACE, transport.close(INTENTIONAL_CLOSE, reason)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!(error = %err, "close handshake failed"),
        Err(_) => tracing::debug!("close handshake timed out"),
    }
}

async fn next_frame(transport: &mut Option<Box<dyn Transport>>) -> TransportResult<TransportFrame> {
    match transport {
        Some(transport) => transport.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
