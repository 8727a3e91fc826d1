//! Self-healing endpoints.
//!
//! [`ReconnectingClient`] keeps one long-lived [`CallRegistry`] and moves it
//! onto a fresh connection every time the old one dies, so calls that were
//! waiting are sent again and resolved exactly once. [`ReconnectingServer`]
//! serves one peer at a time from an acceptor and starts over with a clean
//! dispatcher when that peer goes away.

use crate::cancel::CancellationToken;
use crate::codec::TypedMessage;
use crate::config::ReconnectConfig;
use crate::dispatcher::HandlerTable;
use crate::error::{Result, RpcError};
use crate::message::{Frame, Side};
use crate::registry::CallRegistry;
use crate::retry::retry_async;
use crate::session::Session;
use crate::transport::{Acceptor, BoxedStream, Connector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hook run on every new session before it starts.
pub type SessionSetup = Arc<dyn Fn(&Session) + Send + Sync>;

/// Lifecycle of a reconnecting endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Connecting or waiting for a peer.
    Connecting,
    Connected,
    /// The last connection died; a new one is about to be attempted.
    Disconnected,
    /// Terminal.
    Disposed,
}

fn set_state(tx: &watch::Sender<LinkState>, next: LinkState) {
    tx.send_if_modified(|state| {
        if *state == LinkState::Disposed || *state == next {
            return false;
        }
        *state = next;
        true
    });
}

async fn wait_for_connected(mut rx: watch::Receiver<LinkState>) -> Result<()> {
    let state = *rx
        .wait_for(|s| matches!(s, LinkState::Connected | LinkState::Disposed))
        .await
        .map_err(|_| RpcError::Disposed)?;
    match state {
        LinkState::Connected => Ok(()),
        _ => Err(RpcError::Disposed),
    }
}

/// Only cancel notifications are worth carrying to the next connection;
/// pending calls are replayed from the registry.
fn carry_over(frames: Vec<Frame>) -> Vec<Frame> {
    frames
        .into_iter()
        .filter(|frame| matches!(frame, Frame::Request(request) if request.is_control()))
        .collect()
}

/// Builder for [`ReconnectingClient`].
pub struct ReconnectingClientBuilder<C: Connector> {
    connector: C,
    config: ReconnectConfig,
    table: Option<HandlerTable>,
}

impl<C: Connector> ReconnectingClientBuilder<C> {
    pub fn config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve reverse calls from the peer; each connection gets a fresh dispatcher.
    pub fn handlers(mut self, table: HandlerTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Spawn the supervisor and begin connecting.
    pub fn start(self) -> ReconnectingClient {
        let registry = Arc::new(CallRegistry::new(Side::Initiator));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let state_tx = Arc::new(state_tx);
        let generation = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();

        tokio::spawn(supervise_client(
            self.connector,
            self.config,
            self.table,
            registry.clone(),
            state_tx.clone(),
            generation.clone(),
            stop.clone(),
        ));

        ReconnectingClient {
            registry,
            state_tx,
            state_rx,
            generation,
            stop,
        }
    }
}

/// A client that reconnects on its own and keeps pending calls alive.
pub struct ReconnectingClient {
    registry: Arc<CallRegistry>,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    generation: Arc<AtomicU64>,
    stop: CancellationToken,
}

impl ReconnectingClient {
    /// Start connecting with the default reconnect policy.
    pub fn connect<C: Connector>(connector: C) -> Self {
        Self::builder(connector).start()
    }

    pub fn builder<C: Connector>(connector: C) -> ReconnectingClientBuilder<C> {
        ReconnectingClientBuilder {
            connector,
            config: ReconnectConfig::default(),
            table: None,
        }
    }

    /// The registry to make calls through. It stays valid across reconnections.
    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    /// Typed call through the long-lived registry.
    pub async fn call<Req: TypedMessage, Resp: TypedMessage>(
        &self,
        function_name: &str,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp> {
        self.registry.call(function_name, request, cancel).await
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Wait until a connection is up. Fails with `Disposed` once disposed.
    pub async fn wait_connected(&self) -> Result<()> {
        wait_for_connected(self.state_rx.clone()).await
    }

    /// Number of connections established so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stop reconnecting, close the connection and cancel pending calls.
    pub fn dispose(&self) {
        self.state_tx.send_replace(LinkState::Disposed);
        self.stop.cancel();
        self.registry.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == LinkState::Disposed
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("registry", &self.registry)
            .finish()
    }
}

async fn connect_once<C: Connector>(
    connector: &C,
    config: &ReconnectConfig,
) -> Result<BoxedStream> {
    match tokio::time::timeout(config.connect_timeout, connector.connect()).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(config.connect_timeout)),
    }
}

async fn supervise_client<C: Connector>(
    connector: C,
    config: ReconnectConfig,
    table: Option<HandlerTable>,
    registry: Arc<CallRegistry>,
    state: Arc<watch::Sender<LinkState>>,
    generation: Arc<AtomicU64>,
    stop: CancellationToken,
) {
    let mut carried = Vec::new();

    loop {
        set_state(&state, LinkState::Connecting);

        let (result, attempts) = tokio::select! {
            _ = stop.cancelled() => break,
            attempt = retry_async(
                &config.retry,
                || connect_once(&connector, &config),
                RpcError::is_retryable,
            ) => attempt,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                error!("Giving up after {} connect attempts: {}", attempts, e);
                registry.dispose();
                break;
            }
        };

        let mut builder = Session::builder(Side::Initiator)
            .registry(registry.clone())
            .carry(std::mem::take(&mut carried));
        if let Some(table) = &table {
            builder = builder.handlers(table.clone());
        }
        let session = builder.build(stream);
        session.start();

        let current = generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Connected (generation {}, {} pending calls replayed)",
            current,
            registry.pending_count()
        );
        set_state(&state, LinkState::Connected);

        let event = tokio::select! {
            _ = stop.cancelled() => {
                session.dispose();
                break;
            }
            event = session.disconnected() => event,
        };

        set_state(&state, LinkState::Disconnected);
        match event {
            Some(event) => warn!(
                "Connection {} lost ({}); reconnecting",
                event.connection_id, event.message
            ),
            None => debug!("Connection {} closed; reconnecting", session.id()),
        }

        session.dispose();
        carried = carry_over(session.connection().drain_outbound());
    }

    state.send_replace(LinkState::Disposed);
    debug!("Client supervisor stopped");
}

/// Builder for [`ReconnectingServer`].
pub struct ReconnectingServerBuilder<A: Acceptor> {
    acceptor: A,
    table: HandlerTable,
    config: ReconnectConfig,
    calls: bool,
    setup: Option<SessionSetup>,
}

impl<A: Acceptor> ReconnectingServerBuilder<A> {
    pub fn config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Give every session a registry so the server can call the peer back.
    pub fn bidirectional(mut self) -> Self {
        self.calls = true;
        self
    }

    /// Run `setup` on each new session before it starts.
    pub fn setup(mut self, setup: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    pub fn start(self) -> ReconnectingServer {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let state_tx = Arc::new(state_tx);
        let generation = Arc::new(AtomicU64::new(0));
        let current = Arc::new(Mutex::new(None));
        let stop = CancellationToken::new();

        tokio::spawn(supervise_server(
            self,
            state_tx.clone(),
            generation.clone(),
            current.clone(),
            stop.clone(),
        ));

        ReconnectingServer {
            state_tx,
            state_rx,
            generation,
            current,
            stop,
        }
    }
}

/// A listener-bound server that serves one peer at a time.
///
/// When the peer disconnects, its session and every call in flight are
/// dropped; a peer that reconnects must send its calls again.
pub struct ReconnectingServer {
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    generation: Arc<AtomicU64>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    stop: CancellationToken,
}

impl ReconnectingServer {
    /// Serve `table` to peers from `acceptor` with default settings.
    pub fn serve<A: Acceptor>(acceptor: A, table: HandlerTable) -> Self {
        Self::builder(acceptor, table).start()
    }

    pub fn builder<A: Acceptor>(acceptor: A, table: HandlerTable) -> ReconnectingServerBuilder<A> {
        ReconnectingServerBuilder {
            acceptor,
            table,
            config: ReconnectConfig::default(),
            calls: false,
            setup: None,
        }
    }

    /// The session of the connected peer, if any. Do not hold on to it.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub async fn wait_connected(&self) -> Result<()> {
        wait_for_connected(self.state_rx.clone()).await
    }

    /// Number of peers served so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stop accepting and close the current session.
    pub fn dispose(&self) {
        self.state_tx.send_replace(LinkState::Disposed);
        self.stop.cancel();
        if let Some(session) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            session.dispose();
        }
    }
}

impl Drop for ReconnectingServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ReconnectingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingServer")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

async fn supervise_server<A: Acceptor>(
    options: ReconnectingServerBuilder<A>,
    state: Arc<watch::Sender<LinkState>>,
    generation: Arc<AtomicU64>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    stop: CancellationToken,
) {
    let ReconnectingServerBuilder {
        acceptor,
        table,
        config,
        calls,
        setup,
    } = options;

    loop {
        set_state(&state, LinkState::Connecting);

        let (result, attempts) = tokio::select! {
            _ = stop.cancelled() => break,
            attempt = retry_async(
                &config.retry,
                || acceptor.accept(),
                RpcError::is_retryable,
            ) => attempt,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                error!("Giving up after {} accept attempts: {}", attempts, e);
                break;
            }
        };

        let mut builder = Session::builder(Side::Acceptor).handlers(table.clone());
        if calls {
            builder = builder.with_calls();
        }
        let session = Arc::new(builder.build(stream));
        if let Some(setup) = &setup {
            setup(&session);
        }
        session.start();

        let peer = generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Serving peer {} on connection {}", peer, session.id());
        *current.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        set_state(&state, LinkState::Connected);

        let event = tokio::select! {
            _ = stop.cancelled() => {
                session.dispose();
                break;
            }
            event = session.disconnected() => event,
        };

        set_state(&state, LinkState::Disconnected);
        if let Some(event) = event {
            info!("Peer {} disconnected: {}", peer, event.message);
        }
        // In-flight calls are dropped; the peer resends after reconnecting
        current.lock().unwrap_or_else(|e| e.into_inner()).take();
        session.dispose();
    }

    state.send_replace(LinkState::Disposed);
    if let Some(session) = current.lock().unwrap_or_else(|e| e.into_inner()).take() {
        session.dispose();
    }
    debug!("Server supervisor stopped");
}
