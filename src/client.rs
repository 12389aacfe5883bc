//! Unix domain socket client with optional auto-reconnect.
//!
//! A [`Client`] holds at most one [`Connection`]. Once connected, a background
//! supervisor task runs the read loop; when the loop ends without an explicit
//! [`Client::close`] and reconnect is enabled, the same task redials until it
//! succeeds or the client is closed, then resumes reading.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──► Connected
//!      ▲                          │              │ read loop ends
//!      └──────── dial failed ─────┘◄─────────────┘ (reconnect: redial)
//!                       close() from anywhere ──► Closed
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::{generate_connection_id, Connection};
use crate::context::ContextStore;
use crate::dispatch::{read_loop, Handler, HandlerTable, ReadExit};
use crate::error::{Error, Result};
use crate::logging::{LogFacade, Logger};

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No live connection.
    Disconnected,
    /// Dialing the server.
    Connecting,
    /// A connection is live and its read loop is running.
    Connected,
    /// [`Client::close`] was called. Terminal.
    Closed,
}

struct ClientInner {
    config: ClientConfig,
    logger: Arc<dyn Logger>,
    handlers: HandlerTable<Client>,
    conn: Mutex<Option<Arc<Connection>>>,
    state: watch::Sender<ClientState>,
    /// Serializes dials so `connect()` and the reconnect path never race
    /// each other into two connections.
    dial_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    context: ContextStore,
}

/// Unix domain socket client.
///
/// Cheap to clone; handlers receive a clone so they can reply with
/// [`Client::send`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("socket_path", &self.inner.config.socket_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a disconnected client that logs through the `log` crate.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_logger(config, Arc::new(LogFacade::new()))
    }

    /// Create a disconnected client with a custom logger.
    pub fn with_logger(config: ClientConfig, logger: Arc<dyn Logger>) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                logger,
                handlers: HandlerTable::default(),
                conn: Mutex::new(None),
                state,
                dial_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                context: ContextStore::new(),
            }),
        }
    }

    /// Register a closure for messages of type `kind`, replacing any earlier
    /// handler for that type. Register before connecting so no message is
    /// missed.
    pub fn handle<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Client, crate::message::Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.handlers.insert(kind, handler);
    }

    /// Register a [`Handler`] implementation for messages of type `kind`.
    pub fn handle_with(&self, kind: impl Into<String>, handler: impl Handler<Client>) {
        self.inner.handlers.insert(kind, handler);
    }

    /// Dial the server once and start reading in the background.
    ///
    /// A no-op if already connected.
    ///
    /// # Errors
    ///
    /// [`Error::ClientClosed`] after [`close`](Self::close),
    /// [`Error::Config`] for an unusable configuration, or [`Error::Connect`]
    /// if the dial fails.
    pub async fn connect(&self) -> Result<()> {
        let _dial = self.inner.dial_lock.lock().await;
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        self.inner.config.validate()?;
        if self.is_connected() {
            return Ok(());
        }

        let (conn, reader) = self.dial().await?;
        self.install(&conn)?;
        tokio::spawn(self.clone().supervise(conn, reader));
        Ok(())
    }

    /// Connect, retrying every `reconnect_delay` until it works.
    ///
    /// With reconnect disabled this is a single [`connect`](Self::connect).
    /// The wait between attempts ends early if the client is closed, in which
    /// case [`Error::ClientClosed`] is returned.
    pub async fn connect_with_retry(&self) -> Result<()> {
        let delay = self.inner.config.reconnect_delay;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e @ (Error::ClientClosed | Error::Config(_))) => return Err(e),
                Err(e) if !self.inner.config.reconnect => return Err(e),
                Err(e) => {
                    self.inner.logger.warn_fmt(format_args!(
                        "[Client] Failed to connect ({e}), retrying in {delay:?}..."
                    ));
                }
            }

            tokio::select! {
                () = self.inner.shutdown.cancelled() => return Err(Error::ClientClosed),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Send an envelope of type `kind` to the server.
    ///
    /// # Errors
    ///
    /// [`Error::ClientClosed`] after close, [`Error::NotConnected`] when there
    /// is no live connection (including during a reconnect outage), otherwise
    /// the marshal or write error.
    pub async fn send<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        let conn = self.current_connection().ok_or(Error::NotConnected)?;
        conn.send(kind, payload).await
    }

    /// Close the client and its connection. Idempotent.
    ///
    /// Stops any pending reconnect wait and the background read loop.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.state.send_replace(ClientState::Closed);

        let conn = self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = conn {
            conn.close();
        }
        self.inner.logger.info("[Client] Client closed");
    }

    /// Whether a live connection is held.
    pub fn is_connected(&self) -> bool {
        self.current_connection().is_some()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Current connection state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Wait until the client is connected.
    ///
    /// Returns [`Error::ClientClosed`] if the client is closed first. Pair
    /// with `tokio::time::timeout` to bound the wait.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, ClientState::Connected | ClientState::Closed))
            .await
            .map_err(|_| Error::ClientClosed)?;
        match *state {
            ClientState::Connected => Ok(()),
            _ => Err(Error::ClientClosed),
        }
    }

    /// Store `value` under `key` in the client's context.
    pub fn set_context<T: std::any::Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.context.set(key, value);
    }

    /// Fetch a clone of the client context value under `key`.
    pub fn get_context<T: std::any::Any + Clone>(&self, key: &str) -> Option<T> {
        self.inner.context.get(key)
    }

    /// Full client context store.
    pub fn context(&self) -> &ContextStore {
        &self.inner.context
    }

    fn current_connection(&self) -> Option<Arc<Connection>> {
        self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Move to `next` unless the client is already closed.
    fn set_state(&self, next: ClientState) {
        self.inner.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn dial(&self) -> Result<(Arc<Connection>, OwnedReadHalf)> {
        let config = &self.inner.config;
        self.set_state(ClientState::Connecting);

        let stream = match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => stream,
            Err(source) => {
                self.set_state(ClientState::Disconnected);
                return Err(Error::Connect {
                    path: config.socket_path.clone(),
                    source,
                });
            }
        };

        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection::new(
            generate_connection_id("client"),
            write_half,
            self.inner.shutdown.child_token(),
            config.read_timeout,
            config.write_timeout,
        ));
        Ok((conn, read_half))
    }

    /// Publish a freshly dialed connection.
    fn install(&self, conn: &Arc<Connection>) -> Result<()> {
        {
            let mut slot = self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner);
            // close() may have run while dialing; the child token is then
            // already cancelled.
            if self.is_closed() {
                conn.close();
                return Err(Error::ClientClosed);
            }
            *slot = Some(Arc::clone(conn));
        }
        self.set_state(ClientState::Connected);
        self.inner.logger.info_fmt(format_args!(
            "[Client] Connected to server at {}",
            self.inner.config.socket_path.display()
        ));
        Ok(())
    }

    /// Drop `conn` from the slot if it is still the current connection.
    fn clear_connection(&self, conn: &Arc<Connection>) {
        let mut slot = self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, conn)) {
            *slot = None;
        }
    }

    /// Read loop plus reconnect, runs as a tokio task per successful
    /// `connect()`.
    async fn supervise(self, mut conn: Arc<Connection>, mut reader: OwnedReadHalf) {
        loop {
            let exit = read_loop(
                &conn,
                reader,
                self.inner.config.max_message_size,
                &self,
                &self.inner.handlers,
                self.inner.logger.as_ref(),
            )
            .await;

            if let ReadExit::Failed(e) = &exit {
                if !self.is_closed() {
                    self.inner
                        .logger
                        .error_fmt(format_args!("[Client] Failed to decode message: {e}"));
                }
            }

            conn.close();
            self.clear_connection(&conn);
            if self.is_closed() {
                return;
            }
            self.set_state(ClientState::Disconnected);

            if !self.inner.config.reconnect {
                self.inner.logger.info("[Client] Disconnected from server");
                return;
            }

            self.inner.logger.info("[Client] Connection lost, attempting to reconnect...");
            match self.redial().await {
                Some((next_conn, next_reader)) => {
                    conn = next_conn;
                    reader = next_reader;
                }
                None => return,
            }
        }
    }

    /// Dial until connected. `None` if the client closed, or if someone else
    /// connected in the meantime and now owns the read loop.
    async fn redial(&self) -> Option<(Arc<Connection>, OwnedReadHalf)> {
        let delay = self.inner.config.reconnect_delay;
        loop {
            {
                let _dial = self.inner.dial_lock.lock().await;
                if self.is_closed() || self.is_connected() {
                    return None;
                }
                match self.dial().await {
                    Ok((conn, reader)) => {
                        return self.install(&conn).ok().map(|()| (conn, reader));
                    }
                    Err(e) => {
                        self.inner.logger.warn_fmt(format_args!(
                            "[Client] Reconnect failed ({e}), retrying in {delay:?}..."
                        ));
                    }
                }
            }

            tokio::select! {
                () = self.inner.shutdown.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
