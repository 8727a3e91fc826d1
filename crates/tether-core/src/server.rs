//! Multi-peer listener server.
//!
//! Accepts any number of peers from an [`Acceptor`] and runs one server
//! session per accepted stream. A session is removed and disposed as soon as
//! its connection reports Disconnected.
//!
//! # Thread Safety
//!
//! The accept loop and one watcher per session run as tokio tasks. The
//! session map is shared behind a `Mutex` that is never held across an
//! await.

use crate::config::ConnectionConfig;
use crate::dispatcher::HandlerTable;
use crate::message::Side;
use crate::reconnect::SessionSetup;
use crate::session::Session;
use crate::transport::Acceptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

type SessionMap = Arc<Mutex<HashMap<u64, Arc<Session>>>>;

fn lock(sessions: &SessionMap) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<Session>>> {
    sessions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a running server. Dropping shuts down the server.
pub struct ServerHandle {
    sessions: SessionMap,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Number of peers currently connected.
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Snapshot of the live sessions, e.g. for reverse calls.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Shut down the server.
    ///
    /// Stops accepting new peers and disposes every live session.
    pub fn shutdown(&mut self) {
        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Signal all session watchers to close
        let _ = self.conn_shutdown_tx.send(true);

        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.dispose();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Server configuration: the handlers every session serves.
pub struct Server {
    table: HandlerTable,
    calls: bool,
    setup: Option<SessionSetup>,
}

impl Server {
    pub fn new(table: HandlerTable) -> Self {
        Self {
            table,
            calls: false,
            setup: None,
        }
    }

    /// Start serving `table` on `acceptor`.
    pub fn serve<A: Acceptor>(acceptor: A, table: HandlerTable) -> ServerHandle {
        Self::new(table).start(acceptor)
    }

    /// Give each session a registry so handlers can call the peer back.
    pub fn bidirectional(mut self) -> Self {
        self.calls = true;
        self
    }

    /// Run `setup` on every accepted session before it starts.
    pub fn on_session(mut self, setup: impl Fn(&Session) + Send + Sync + 'static) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Spawn the accept loop.
    pub fn start<A: Acceptor>(self, acceptor: A) -> ServerHandle {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(self.accept_loop(
            acceptor,
            sessions.clone(),
            shutdown_rx,
            conn_shutdown_rx,
        ));

        ServerHandle {
            sessions,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    fn open_session(&self, stream: crate::transport::BoxedStream) -> Arc<Session> {
        let mut builder = Session::builder(Side::Acceptor).handlers(self.table.clone());
        if self.calls {
            builder = builder.with_calls();
        }
        let session = Arc::new(builder.build(stream));
        if let Some(setup) = &self.setup {
            setup(&session);
        }
        session.start();
        session
    }

    async fn accept_loop<A: Acceptor>(
        self,
        acceptor: A,
        sessions: SessionMap,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Server shutting down");
                    break;
                }
                accept_result = acceptor.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            let current = lock(&sessions).len();
                            if current >= ConnectionConfig::MAX_SESSIONS {
                                warn!(
                                    "Rejecting peer: at max capacity ({})",
                                    ConnectionConfig::MAX_SESSIONS
                                );
                                continue;
                            }

                            let session = self.open_session(stream);
                            let id = session.id();
                            debug!("Session {} opened", id);
                            lock(&sessions).insert(id, session.clone());

                            let sessions = sessions.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    event = session.disconnected() => {
                                        if let Some(event) = event {
                                            debug!("Session {} ended: {}", id, event.message);
                                        }
                                    }
                                    _ = conn_shutdown.changed() => {}
                                }
                                lock(&sessions).remove(&id);
                                session.dispose();
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(ConnectionConfig::ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        let remaining: Vec<Arc<Session>> = lock(&sessions).drain().map(|(_, s)| s).collect();
        for session in remaining {
            session.dispose();
        }
    }
}
