//! Packet connection to the relay with request/response correlation.
//!
//! Every request registers a pending slot keyed by its sequence id *before*
//! the frame is written, so a reply that races the write still finds its
//! caller. A background reader resolves pending slots from `Response`,
//! `Error` and `Pong` envelopes and forwards everything else (relayed
//! messages, membership changes, file notices) on the push channel.
//!
//! The push channel is unbounded: the reader never waits on the push
//! consumer, because that consumer may itself be waiting on a reply only
//! the reader can deliver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use protocol::messages::{Credentials, Heartbeat, LoginResult};
use protocol::{Envelope, ErrorBody, Kind, PacketCodec, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};

/// Default time to wait for a reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingMap = HashMap<i64, oneshot::Sender<Envelope>>;

/// Credentials issued by the relay on login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub user_id: UserId,
    pub token: String,
}

#[derive(Default)]
struct Pending {
    slots: Mutex<PendingMap>,
}

impl Pending {
    fn map(&self) -> MutexGuard<'_, PendingMap> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live connection to the relay's packet port.
pub struct RelayConnection {
    writer: AsyncMutex<BoxedWriter>,
    codec: PacketCodec,
    pending: Arc<Pending>,
    session: RwLock<Option<ClientSession>>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect to the relay.
    ///
    /// Returns the connection and the receiver for unsolicited envelopes.
    pub async fn connect(
        addr: impl ToSocketAddrs,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_parts(read_half, write_half, PacketCodec::new()))
    }

    /// Build a connection over any byte stream halves.
    pub fn from_parts<R, W>(
        reader: R,
        writer: W,
        codec: PacketCodec,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Pending::default());
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(reader, codec, Arc::clone(&pending), push_tx));

        let connection = Self {
            writer: AsyncMutex::new(Box::new(writer)),
            codec,
            pending,
            session: RwLock::new(None),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            reader,
        };
        (connection, push_rx)
    }

    /// Sets the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.map().len()
    }

    /// The current session, if logged in.
    pub fn session(&self) -> Option<ClientSession> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.session().map(|s| s.user_id)
    }

    /// True while the background reader is running.
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Write one envelope without waiting for a reply.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = self.codec.encode(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send `envelope` and wait for the reply that echoes its sequence id.
    ///
    /// An `Error` reply becomes [`ClientError::Rejected`]. On timeout the
    /// pending slot is removed before returning.
    pub async fn call(&self, envelope: Envelope) -> Result<Envelope> {
        let sequence_id = envelope.sequence_id;
        let (tx, rx) = oneshot::channel();
        self.pending.map().insert(sequence_id, tx);

        if let Err(e) = self.send(&envelope).await {
            self.pending.map().remove(&sequence_id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(ClientError::ConnectionClosed(
                    "connection ended before the reply arrived".to_string(),
                ))
            }
            Err(_) => {
                self.pending.map().remove(&sequence_id);
                tracing::debug!(sequence = sequence_id, kind = ?envelope.kind, "Request timed out");
                return Err(ClientError::Timeout {
                    sequence_id,
                    timeout: self.timeout,
                });
            }
        };

        if reply.kind == Kind::Error {
            let body: ErrorBody = reply.body()?;
            return Err(body.into());
        }
        Ok(reply)
    }

    /// Send an authenticated request with a JSON body and decode the reply body.
    pub async fn request<T, R>(&self, kind: Kind, body: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let envelope = self.authenticate(Envelope::with_body(kind, body)?)?;
        let reply = self.call(envelope).await?;
        Ok(reply.body()?)
    }

    /// Attach the session credentials to `envelope`.
    pub fn authenticate(&self, envelope: Envelope) -> Result<Envelope> {
        let session = self.session().ok_or(ClientError::NotAuthenticated)?;
        Ok(envelope.authenticated(session.user_id, session.token))
    }

    /// Create an account and log in.
    pub async fn register(&self, username: &str, password: &str) -> Result<LoginResult> {
        self.open_session(Kind::Register, username, password).await
    }

    /// Log in with existing credentials.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResult> {
        self.open_session(Kind::Login, username, password).await
    }

    async fn open_session(&self, kind: Kind, username: &str, password: &str) -> Result<LoginResult> {
        let creds = Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };
        let reply = self.call(Envelope::with_body(kind, &creds)?).await?;
        if reply.kind != Kind::Response {
            return Err(ClientError::UnexpectedReply(reply.kind));
        }
        let result: LoginResult = reply.body()?;

        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(ClientSession {
            user_id: result.user_id,
            token: result.session_token.clone(),
        });
        tracing::info!(user_id = result.user_id, "Logged in");
        Ok(result)
    }

    /// Revoke the session; the connection stays open.
    pub async fn logout(&self) -> Result<()> {
        let envelope = self.authenticate(Envelope::new(Kind::Logout, "{}"))?;
        self.call(envelope).await?;
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    /// Round-trip a heartbeat. Returns the echoed timestamp.
    pub async fn ping(&self) -> Result<u64> {
        let envelope = self.authenticate(Envelope::with_body(
            Kind::Ping,
            &Heartbeat {
                timestamp: protocol::content::now_millis(),
            },
        )?)?;
        let reply = self.call(envelope).await?;
        if reply.kind != Kind::Pong {
            return Err(ClientError::UnexpectedReply(reply.kind));
        }
        Ok(reply.body::<Heartbeat>()?.timestamp)
    }

    /// Shut down the write half; the relay sees end-of-stream.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "Shutdown of write half failed");
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut reader: R,
    codec: PacketCodec,
    pending: Arc<Pending>,
    push_tx: mpsc::UnboundedSender<Envelope>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let envelope = match codec.read_envelope(&mut reader).await {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Relay connection reader stopped");
                break;
            }
        };

        if matches!(envelope.kind, Kind::Response | Kind::Error | Kind::Pong) {
            let slot = pending.map().remove(&envelope.sequence_id);
            if let Some(slot) = slot {
                // The caller may have timed out in the meantime.
                let _ = slot.send(envelope);
                continue;
            }
        }

        if push_tx.send(envelope).is_err() {
            tracing::trace!("Push receiver dropped, discarding envelope");
        }
    }

    // Dropping the senders wakes every waiter with ConnectionClosed.
    pending.map().clear();
}
