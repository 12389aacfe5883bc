//! msgsock - typed JSON messaging over Unix domain sockets.
//!
//! A [`Server`] listens on a socket path and a [`Client`] dials it. Both sides
//! exchange [`Envelope`]s (`{"type": ..., "payload": ...}`) and route them to
//! handlers registered per message type.
//!
//! # Architecture
//!
//! - **Server** - accept loop, connection registry, broadcast
//! - **Client** - single connection with optional auto-reconnect
//! - **Connection** - serialized writes, close-once shutdown, context
//! - **Framing** - streaming JSON decoder behind a cumulative size limit
//!
//! # Modules
//!
//! - [`server`] - Unix socket listener and per-connection read loops
//! - [`client`] - Dialing, reconnect supervisor, client state
//! - [`framing`] - [`MessageDecoder`] and [`LimitedReader`]
//! - [`config`] - Configuration loading and env overrides
//!
//! # Example
//!
//! ```no_run
//! use msgsock::{Client, ClientConfig, Server, ServerConfig};
//!
//! # async fn run() -> msgsock::Result<()> {
//! let server = Server::new(ServerConfig::new("/tmp/app.sock"));
//! server.handle("echo", |conn, msg| async move {
//!     let text: String = msg.decode_payload()?;
//!     conn.send("echo_response", &format!("{text}_response")).await?;
//!     Ok(())
//! });
//! server.start()?;
//!
//! let client = Client::new(ClientConfig::new("/tmp/app.sock"));
//! client.handle("echo_response", |_client, msg| async move {
//!     println!("{}", msg.decode_payload::<String>()?);
//!     Ok(())
//! });
//! client.connect().await?;
//! client.send("echo", "hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod logging;
pub mod message;
pub mod server;

// Re-export commonly used types
pub use client::{Client, ClientState};
pub use config::{ClientConfig, ServerConfig};
pub use connection::Connection;
pub use context::{ContextStore, ContextValue};
pub use dispatch::{Handler, HandlerTable};
pub use error::{Error, Result};
pub use framing::{LimitedReader, MessageDecoder};
pub use logging::{init_logging, Level, LogFacade, Logger, NoopLogger};
pub use message::Envelope;
pub use server::Server;
