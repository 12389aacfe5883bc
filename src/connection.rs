//! One end of a socket conversation.
//!
//! A `Connection` owns the write half of a Unix stream plus a close-once
//! shutdown signal. The read half lives in the read loop that created the
//! connection; cancelling the signal makes that loop exit and drop it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::ContextStore;
use crate::error::{Error, Result};
use crate::message::Envelope;

/// Live socket endpoint that handlers reply through.
///
/// Shared as `Arc<Connection>`: the registry, the read loop, broadcast and
/// handlers may all hold a reference and write concurrently. Writes are
/// serialized by an internal lock so envelopes never interleave on the wire.
pub struct Connection {
    id: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    context: ContextStore,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap the write half of a stream.
    ///
    /// `shutdown` is usually a child of the owner's token, so stopping the
    /// owner closes every connection it created.
    pub(crate) fn new(
        id: String,
        writer: OwnedWriteHalf,
        shutdown: CancellationToken,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            shutdown,
            context: ContextStore::new(),
            read_timeout,
            write_timeout,
        }
    }

    /// Unique identifier for this connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serialize `payload` into an envelope of type `kind` and write it.
    ///
    /// Returns the marshal or write error; nothing is retried.
    pub async fn send<T: Serialize + ?Sized>(&self, kind: &str, payload: &T) -> Result<()> {
        let envelope = Envelope::new(kind, payload)?;
        self.send_envelope(&envelope).await
    }

    /// Write an already built envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let bytes = envelope.to_wire()?;

        let mut guard = self.writer.lock().await;
        if self.is_closed() {
            guard.take();
            return Err(Error::ConnectionClosed(self.id.clone()));
        }
        let Some(writer) = guard.as_mut() else {
            return Err(Error::ConnectionClosed(self.id.clone()));
        };

        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        let write_timeout = self.write_timeout;
        let result = tokio::select! {
            () = self.shutdown.cancelled() => Err(Error::ConnectionClosed(self.id.clone())),
            result = with_deadline(write_timeout, write) => result,
        };

        if self.is_closed() {
            // Release the transport on behalf of a close() that raced this write
            guard.take();
        }
        result
    }

    /// Close the connection.
    ///
    /// Idempotent and safe to call from any task, including a handler running
    /// on this connection's own read loop. Returns `true` only for the call
    /// that actually performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.cancel();
        // A write in flight holds the lock; it drops the writer itself once the
        // cancellation interrupts it.
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
        true
    }

    /// Whether [`close`](Self::close) has run or the owner shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Store `value` under `key` in this connection's context.
    pub fn set_context<T: std::any::Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.context.set(key, value);
    }

    /// Fetch a clone of the context value under `key`, if present and a `T`.
    pub fn get_context<T: std::any::Any + Clone>(&self, key: &str) -> Option<T> {
        self.context.get(key)
    }

    /// Full context store for this connection.
    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

async fn with_deadline<F>(timeout: Duration, write: F) -> Result<()>
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if timeout.is_zero() {
        return write.await.map_err(Error::Io);
    }
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result.map_err(Error::Io),
        Err(_) => Err(Error::Timeout {
            op: "write",
            timeout,
        }),
    }
}

/// Generate a unique connection ID using a monotonic counter + random suffix.
pub(crate) fn generate_connection_id(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("{prefix}:{seq:x}{rand:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::MessageDecoder;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    fn pair() -> (Connection, tokio::net::unix::OwnedReadHalf, UnixStream) {
        let (local, remote) = UnixStream::pair().unwrap();
        let (read_half, write_half) = local.into_split();
        let conn = Connection::new(
            generate_connection_id("conn"),
            write_half,
            CancellationToken::new(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        (conn, read_half, remote)
    }

    #[tokio::test]
    async fn test_send_writes_envelope() {
        let (conn, _read_half, mut remote) = pair();
        conn.send("echo_response", "hello_response").await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), remote.read(&mut buf))
            .await
            .expect("Timed out")
            .expect("Read failed");

        let mut decoder = MessageDecoder::new();
        let msgs = decoder.feed(&buf[..n]).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].kind(), "echo_response");
        assert_eq!(msgs[0].decode_payload::<String>().unwrap(), "hello_response");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _read_half, _remote) = pair();
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_close_closes_once() {
        let (conn, _read_half, _remote) = pair();
        let conn = Arc::new(conn);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.close() })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, _read_half, _remote) = pair();
        conn.close();
        let err = conn.send("x", &1).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(id) if id == conn.id()));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (conn, _read_half, _remote) = pair();
        let conn = Arc::new(conn);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_parent_shutdown_closes_connection() {
        let parent = CancellationToken::new();
        let (local, _remote) = UnixStream::pair().unwrap();
        let (_read_half, write_half) = local.into_split();
        let conn = Connection::new(
            "conn:test".into(),
            write_half,
            parent.child_token(),
            Duration::ZERO,
            Duration::ZERO,
        );
        parent.cancel();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_fails() {
        let (conn, _read_half, remote) = pair();
        drop(remote);

        // The first write may land in the socket buffer; keep writing until
        // the broken pipe surfaces.
        let mut failed = false;
        for _ in 0..64 {
            if conn.send("x", &"payload".repeat(1024)).await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "writes to a dropped peer should eventually fail");
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let ids: std::collections::HashSet<String> =
            (0..100).map(|_| generate_connection_id("conn")).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.starts_with("conn:")));
    }

    #[tokio::test]
    async fn test_context_round_trip() {
        let (conn, _read_half, _remote) = pair();
        conn.set_context("k", "v".to_string());
        assert_eq!(conn.get_context::<String>("k"), Some("v".to_string()));
        assert_eq!(conn.get_context::<String>("unset"), None);
    }
}
