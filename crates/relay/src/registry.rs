//! Registry of authenticated connections.
//!
//! The registry maps a user id to the live connection that user logged in
//! on. The map is guarded by a single mutex that is only held for lookups
//! and mutations; frames are always written after the lock is released, so a
//! slow peer can only stall writes to itself. Writes to one connection are
//! serialized by that connection's own [`PacketWriter`] lock and bounded by
//! its write timeout; a connection whose write times out is unregistered.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use protocol::{Envelope, PacketCodec, UserId};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Identifies one accepted TCP connection, independent of who logged in on it.
pub type ConnectionId = u64;

/// Write half of a connection, type-erased so tests can use in-memory pipes.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default deadline for writing one frame to a client.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The write half of a connection behind a per-connection lock.
///
/// Frames are encoded before the lock is taken so the critical section only
/// covers the socket write. A write that misses the deadline may have left
/// part of a frame on the wire, so the writer is marked broken and refuses
/// every later frame.
pub struct PacketWriter {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    codec: PacketCodec,
    write_timeout: Duration,
    broken: AtomicBool,
    inner: AsyncMutex<BoxedWriter>,
}

impl PacketWriter {
    pub fn new(writer: BoxedWriter, peer_addr: Option<SocketAddr>, codec: PacketCodec) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            codec,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            broken: AtomicBool::new(false),
            inner: AsyncMutex::new(writer),
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// True once a write has timed out.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Encode and write one envelope.
    pub async fn send(&self, envelope: &Envelope) -> protocol::Result<()> {
        let frame = self.codec.encode(envelope)?;
        self.send_frame(&frame).await
    }

    /// Write an already-encoded frame within the write timeout.
    pub async fn send_frame(&self, frame: &[u8]) -> protocol::Result<()> {
        if self.is_broken() {
            let err = io::Error::new(io::ErrorKind::BrokenPipe, "connection write timed out");
            return Err(err.into());
        }

        let write = async {
            let mut writer = self.inner.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                self.broken.store(true, Ordering::Relaxed);
                warn!(connection_id = self.id, timeout = ?self.write_timeout, "Write timed out");
                Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded").into())
            }
        }
    }

    /// Shut down the write half; the peer sees end-of-stream.
    pub async fn shutdown(&self) {
        let shutdown = async {
            let mut writer = self.inner.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection_id = self.id, error = %e, "Shutdown of write half failed")
            }
            Err(_) => debug!(connection_id = self.id, "Shutdown of write half timed out"),
        }
    }
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// An authenticated connection owned by the registry.
#[derive(Debug)]
pub struct Connection {
    user_id: UserId,
    session_token: String,
    writer: Arc<PacketWriter>,
    last_activity: AtomicU64,
}

impl Connection {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.writer.id()
    }

    /// Unix time in milliseconds of the last frame read from this connection.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity
            .store(protocol::content::now_millis(), Ordering::Relaxed);
    }
}

/// Maps authenticated users to their live connection.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<UserId, Arc<Connection>>>,
    codec: PacketCodec,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(PacketCodec::new())
    }
}

impl ConnectionRegistry {
    pub fn new(codec: PacketCodec) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            codec,
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<UserId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `writer` as the live connection for `user_id`.
    ///
    /// A later login replaces an earlier one; the replaced connection is
    /// returned so the caller can close it.
    pub fn register(
        &self,
        user_id: UserId,
        writer: Arc<PacketWriter>,
        session_token: impl Into<String>,
    ) -> Option<Arc<Connection>> {
        let connection = Arc::new(Connection {
            user_id,
            session_token: session_token.into(),
            writer,
            last_activity: AtomicU64::new(0),
        });
        connection.touch();

        let previous = self.map().insert(user_id, connection);
        debug!(user_id, replaced = previous.is_some(), "Connection registered");
        previous
    }

    /// Remove whatever connection is registered for `user_id`.
    pub fn unregister(&self, user_id: UserId) -> Option<Arc<Connection>> {
        let removed = self.map().remove(&user_id);
        if removed.is_some() {
            debug!(user_id, "Connection unregistered");
        }
        removed
    }

    /// Remove the registration for `user_id` only if it still belongs to
    /// `connection_id`. Used on disconnect so a stale loop cannot evict a
    /// newer login.
    pub fn unregister_connection(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut map = self.map();
        match map.get(&user_id) {
            Some(conn) if conn.connection_id() == connection_id => {
                map.remove(&user_id);
                debug!(user_id, connection_id, "Connection unregistered on disconnect");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.map().get(&user_id).cloned()
    }

    /// True if `token` is the session token of the live connection for `user_id`.
    pub fn is_current_session(&self, user_id: UserId, token: &str) -> bool {
        self.map()
            .get(&user_id)
            .is_some_and(|conn| conn.session_token == token)
    }

    /// Record activity for `user_id`.
    pub fn touch(&self, user_id: UserId) {
        if let Some(conn) = self.get(user_id) {
            conn.touch();
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.map().contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.map().keys().copied().collect()
    }

    /// Deliver `envelope` to `user_id` if online.
    ///
    /// Returns false when the user is offline or the write failed; neither is
    /// an error for the caller.
    pub async fn send_to(&self, user_id: UserId, envelope: &Envelope) -> bool {
        let Some(conn) = self.get(user_id) else {
            debug!(user_id, kind = ?envelope.kind, "Recipient offline, skipping");
            return false;
        };

        match conn.writer.send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to deliver envelope");
                self.drop_if_broken(&conn);
                false
            }
        }
    }

    /// Unregister a connection whose writer can no longer be used.
    fn drop_if_broken(&self, conn: &Connection) {
        if conn.writer.is_broken()
            && self.unregister_connection(conn.user_id, conn.connection_id())
        {
            warn!(user_id = conn.user_id, "Unregistered stalled connection");
        }
    }

    /// Deliver `envelope` to every online user in `user_ids`.
    ///
    /// The frame is encoded once and written to all recipients concurrently.
    /// Returns the number of successful deliveries.
    pub async fn broadcast(&self, envelope: &Envelope, user_ids: &[UserId]) -> usize {
        let frame = match self.codec.encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = ?envelope.kind, error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let targets: Vec<Arc<Connection>> = {
            let map = self.map();
            user_ids
                .iter()
                .filter_map(|id| map.get(id).cloned())
                .collect()
        };

        let results = join_all(targets.iter().map(|conn| {
            let frame = frame.as_slice();
            async move {
                match conn.writer.send_frame(frame).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(user_id = conn.user_id, error = %e, "Broadcast write failed");
                        self.drop_if_broken(conn);
                        false
                    }
                }
            }
        }))
        .await;

        results.into_iter().filter(|delivered| *delivered).count()
    }
}
