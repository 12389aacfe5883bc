//! Unix domain socket server.
//!
//! Listens on a socket path, wraps each accepted stream in a [`Connection`],
//! and runs one read loop per connection that dispatches envelopes to the
//! handlers registered with [`Server::handle`].
//!
//! ```text
//! start() ──► accept loop ──► Connection ──► read loop ──► handler(conn, msg)
//!                 │                              │
//!                 └── registry (id → conn) ◄─────┘ removed on exit
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::connection::{generate_connection_id, Connection};
use crate::dispatch::{read_loop, Handler, HandlerTable, ReadExit};
use crate::error::{Error, Result};
use crate::logging::{LogFacade, Logger};
use crate::message::Envelope;

/// `sun_path` is 104 bytes on macOS and 108 on Linux; use the smaller.
const MAX_SOCKET_PATH: usize = 104;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a server: `Created → Listening → Stopped`.
#[derive(Debug)]
enum Lifecycle {
    Created,
    Listening { accept_handle: JoinHandle<()> },
    Stopped,
}

struct ServerInner {
    config: ServerConfig,
    logger: Arc<dyn Logger>,
    handlers: HandlerTable<Arc<Connection>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
}

/// Unix domain socket server.
///
/// Cheap to clone; clones share the same listener, registry and handlers, so
/// a handler can capture a clone to broadcast.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("socket_path", &self.inner.config.socket_path)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server that logs through the `log` crate.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_logger(config, Arc::new(LogFacade::new()))
    }

    /// Create a server with a custom logger.
    pub fn with_logger(config: ServerConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                logger,
                handlers: HandlerTable::default(),
                connections: RwLock::new(HashMap::new()),
                lifecycle: Mutex::new(Lifecycle::Created),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a closure for messages of type `kind`, replacing any earlier
    /// handler for that type.
    ///
    /// ```no_run
    /// # let server = msgsock::Server::new(msgsock::ServerConfig::new("/tmp/app.sock"));
    /// server.handle("echo", |conn, msg| async move {
    ///     let text: String = msg.decode_payload()?;
    ///     conn.send("echo_response", &format!("{text}_response")).await?;
    ///     Ok(())
    /// });
    /// ```
    pub fn handle<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Connection>, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.handlers.insert(kind, handler);
    }

    /// Register a [`Handler`] implementation for messages of type `kind`.
    pub fn handle_with(&self, kind: impl Into<String>, handler: impl Handler<Arc<Connection>>) {
        self.inner.handlers.insert(kind, handler);
    }

    /// Bind the socket and start accepting connections in the background.
    ///
    /// Removes any stale file at the socket path, creates the parent
    /// directory, binds, and applies the configured permission mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already started or stopped, or the
    /// socket cannot be prepared, bound or permissioned.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Listening { .. } => return Err(Error::AlreadyStarted),
            Lifecycle::Stopped => return Err(Error::ServerStopped),
        }

        let config = &self.inner.config;
        config.validate()?;
        let listener = bind_socket(&config.socket_path, config.socket_mode)?;

        self.inner.logger.info_fmt(format_args!(
            "[Server] Listening on {}",
            config.socket_path.display()
        ));

        let accept_handle = tokio::spawn(Self::accept_loop(Arc::clone(&self.inner), listener));
        *lifecycle = Lifecycle::Listening { accept_handle };
        Ok(())
    }

    /// Stop accepting, close every connection and remove the socket file.
    ///
    /// Idempotent: only the first call does the work and can see an error;
    /// later calls return `Ok(())`. Calling it before [`start`](Self::start)
    /// is allowed and prevents the server from starting later.
    pub async fn stop(&self) -> Result<()> {
        let previous = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };

        let accept_handle = match previous {
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Created => None,
            Lifecycle::Listening { accept_handle } => Some(accept_handle),
        };

        self.inner.shutdown.cancel();

        // Waiting for the accept loop drops the listener and guarantees no
        // connection is registered after the sweep below.
        if let Some(handle) = accept_handle {
            if let Err(e) = handle.await {
                self.inner
                    .logger
                    .error_fmt(format_args!("[Server] Accept loop ended abnormally: {e}"));
            }
        }

        let connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for conn in connections {
            conn.close();
        }

        let socket_path = &self.inner.config.socket_path;
        let result = match std::fs::remove_file(socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::RemoveSocket {
                path: socket_path.clone(),
                source,
            }),
        };

        self.inner.logger.info_fmt(format_args!("[Server] Stopped {}", socket_path.display()));
        result
    }

    /// Send one envelope of type `kind` to every live connection.
    ///
    /// Per-connection failures are logged and skipped. Fails only if the
    /// payload cannot be serialized.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<()> {
        let envelope = Envelope::new(kind, payload)?;

        let recipients = self.connections();
        for conn in recipients {
            if let Err(e) = conn.send_envelope(&envelope).await {
                self.inner.logger.error_fmt(format_args!(
                    "[Server] Failed to broadcast to {}: {e}",
                    conn.id()
                ));
            }
        }
        Ok(())
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Look up a live connection by id.
    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the server is currently accepting connections.
    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner),
            Lifecycle::Listening { .. }
        )
    }

    /// Path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        &self.inner.config.socket_path
    }

    /// Accept loop, runs as a tokio task until shutdown.
    async fn accept_loop(inner: Arc<ServerInner>, listener: UnixListener) {
        loop {
            let accepted = tokio::select! {
                () = inner.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _addr)) => Self::register(&inner, stream),
                Err(e) => {
                    if inner.shutdown.is_cancelled() {
                        break;
                    }
                    inner
                        .logger
                        .error_fmt(format_args!("[Server] Failed to accept connection: {e}"));
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    fn register(inner: &Arc<ServerInner>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection::new(
            generate_connection_id("conn"),
            write_half,
            inner.shutdown.child_token(),
            inner.config.read_timeout,
            inner.config.write_timeout,
        ));

        inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.id().to_owned(), Arc::clone(&conn));
        inner.logger.info_fmt(format_args!("[Server] New connection established: {}", conn.id()));

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let exit = read_loop(
                &conn,
                read_half,
                inner.config.max_message_size,
                &conn,
                &inner.handlers,
                inner.logger.as_ref(),
            )
            .await;

            match exit {
                ReadExit::Eof | ReadExit::Closed => {}
                ReadExit::Failed(e) => {
                    if !inner.shutdown.is_cancelled() {
                        inner.logger.error_fmt(format_args!(
                            "[Server] Failed to decode message from {}: {e}",
                            conn.id()
                        ));
                    }
                }
            }

            conn.close();
            inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(conn.id());
            inner.logger.info_fmt(format_args!("[Server] Connection closed: {}", conn.id()));
        });
    }
}

/// Remove a stale socket, bind a fresh listener and apply `mode`.
fn bind_socket(socket_path: &Path, mode: u32) -> Result<UnixListener> {
    let path_len = socket_path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        return Err(Error::PathTooLong {
            path: socket_path.to_path_buf(),
            len: path_len,
            max: MAX_SOCKET_PATH - 1,
        });
    }

    match std::fs::remove_file(socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(Error::RemoveSocket {
                path: socket_path.to_path_buf(),
                source,
            })
        }
    }

    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| Error::Bind {
                path: socket_path.to_path_buf(),
                source,
            })?;
        }
    }

    let listener =
        std::os::unix::net::UnixListener::bind(socket_path).map_err(|source| Error::Bind {
            path: socket_path.to_path_buf(),
            source,
        })?;

    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(socket_path, permissions).map_err(|source| {
            Error::Permissions {
                path: socket_path.to_path_buf(),
                source,
            }
        })?;
    }

    // Convert std listener to tokio async listener
    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}
