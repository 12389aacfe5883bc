//! Handler registration and the per-connection read loop.
//!
//! Servers and clients share the same machinery: a [`HandlerTable`] keyed by
//! message type, and [`read_loop`], which decodes envelopes from one socket and
//! invokes handlers in wire order. What differs is the `peer` value handed to
//! handlers (`Arc<Connection>` on the server, `Client` on the client) and what
//! each side does once the loop exits.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::connection::Connection;
use crate::error::Error;
use crate::framing::{classify_read_error, LimitedReader, MessageDecoder};
use crate::logging::Logger;
use crate::message::Envelope;

/// Read buffer size per socket read.
const READ_CHUNK: usize = 64 * 1024;

/// Processes messages of one type.
///
/// Any `Fn(P, Envelope) -> impl Future<Output = anyhow::Result<()>>` closure is
/// a handler. Errors are logged by the caller and never close the connection.
#[async_trait]
pub trait Handler<P>: Send + Sync + 'static {
    /// Handle one message from `peer`.
    async fn call(&self, peer: P, msg: Envelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<P, F, Fut> Handler<P> for F
where
    P: Send + 'static,
    F: Fn(P, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, peer: P, msg: Envelope) -> anyhow::Result<()> {
        (self)(peer, msg).await
    }
}

/// Message type → handler map. Registration overwrites.
pub struct HandlerTable<P> {
    handlers: RwLock<HashMap<String, Arc<dyn Handler<P>>>>,
}

impl<P> Default for HandlerTable<P> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> fmt::Debug for HandlerTable<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<&String> = handlers.keys().collect();
        kinds.sort();
        f.debug_struct("HandlerTable").field("types", &kinds).finish()
    }
}

impl<P> HandlerTable<P> {
    /// Register `handler` for `kind`, replacing any previous one.
    pub fn insert(&self, kind: impl Into<String>, handler: impl Handler<P>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), Arc::new(handler));
    }

    /// Look up the handler for `kind`.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler<P>>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    /// Whether a handler is registered for `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }
}

/// Why a read loop stopped.
#[derive(Debug)]
pub(crate) enum ReadExit {
    /// Peer closed the stream cleanly between messages.
    Eof,
    /// The connection (or its owner) was shut down locally.
    Closed,
    /// Decode, size-limit, timeout or transport failure.
    Failed(Error),
}

/// Decode messages from `reader` and dispatch them until the stream ends, the
/// connection is closed, or a framing error occurs.
///
/// Handlers run inline, so a slow handler delays later messages on the same
/// connection but never reorders them.
pub(crate) async fn read_loop<R, P>(
    conn: &Connection,
    reader: R,
    max_message_size: u64,
    peer: &P,
    handlers: &HandlerTable<P>,
    logger: &dyn Logger,
) -> ReadExit
where
    R: AsyncRead + Unpin,
    P: Clone + Send + 'static,
{
    let mut reader = LimitedReader::new(reader, max_message_size);
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let read_timeout = conn.read_timeout();

    loop {
        let read = async {
            if read_timeout.is_zero() {
                reader.read(&mut buf).await.map_err(classify_read_error)
            } else {
                match tokio::time::timeout(read_timeout, reader.read(&mut buf)).await {
                    Ok(result) => result.map_err(classify_read_error),
                    Err(_) => Err(Error::Timeout {
                        op: "read",
                        timeout: read_timeout,
                    }),
                }
            }
        };

        let n = tokio::select! {
            biased;
            () = conn.closed() => return ReadExit::Closed,
            result = read => match result {
                Ok(n) => n,
                Err(e) => return ReadExit::Failed(e),
            },
        };

        if n == 0 {
            if decoder.has_partial() {
                return ReadExit::Failed(Error::Truncated(decoder.pending_len()));
            }
            return ReadExit::Eof;
        }

        decoder.push(&buf[..n]);
        loop {
            let msg = match decoder.next_message() {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => return ReadExit::Failed(e),
            };
            if conn.is_closed() {
                return ReadExit::Closed;
            }
            dispatch(conn, msg, peer, handlers, logger).await;
        }
    }
}

async fn dispatch<P: Clone + Send + 'static>(
    conn: &Connection,
    msg: Envelope,
    peer: &P,
    handlers: &HandlerTable<P>,
    logger: &dyn Logger,
) {
    let Some(handler) = handlers.get(msg.kind()) else {
        logger.warn_fmt(format_args!(
            "[Dispatch] No handler for message type '{}' from {}",
            msg.kind(),
            conn.id()
        ));
        return;
    };

    let kind = msg.kind().to_owned();
    if let Err(e) = handler.call(peer.clone(), msg).await {
        logger.error_fmt(format_args!(
            "[Dispatch] Handler error for message type '{}' from {}: {e:#}",
            kind,
            conn.id()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closure_is_a_handler() {
        let table: HandlerTable<u32> = HandlerTable::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        table.insert("inc", move |peer: u32, msg: Envelope| {
            let counter = Arc::clone(&counter);
            async move {
                let by: usize = msg.decode_payload()?;
                counter.fetch_add(by + peer as usize, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        });

        let handler = table.get("inc").unwrap();
        handler.call(1, Envelope::new("inc", &2).unwrap()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_registration_overwrites() {
        let table: HandlerTable<()> = HandlerTable::default();
        table.insert("t", |(), _msg: Envelope| async {
            Err::<(), _>(anyhow::anyhow!("old handler"))
        });
        table.insert("t", |(), _msg: Envelope| async { Ok::<_, anyhow::Error>(()) });

        let handler = table.get("t").unwrap();
        assert!(handler.call((), Envelope::new("t", &()).unwrap()).await.is_ok());
    }

    struct Rejector;

    #[async_trait]
    impl Handler<()> for Rejector {
        async fn call(&self, (): (), msg: Envelope) -> anyhow::Result<()> {
            anyhow::bail!("rejected {}", msg.kind())
        }
    }

    #[tokio::test]
    async fn test_struct_handler() {
        let table: HandlerTable<()> = HandlerTable::default();
        table.insert("no", Rejector);
        assert!(table.contains("no"));
        assert!(!table.contains("yes"));

        let err = table
            .get("no")
            .unwrap()
            .call((), Envelope::new("no", &()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "rejected no");
    }
}
