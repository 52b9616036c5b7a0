//! Packet-port listener and the per-connection state machine.
//!
//! A connection starts in [`ConnectionState::Connecting`], where only
//! `Register` and `Login` are accepted; anything else gets a
//! `session_required` error and the connection stays open. A successful
//! login registers the connection and moves it to
//! [`ConnectionState::Authenticated`]. Any read failure, or a write that
//! missed its deadline, ends the loop and unregisters the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::{Envelope, Kind, PacketCodec};
use tokio::io::{AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::RelayEvent;
use crate::registry::{PacketWriter, DEFAULT_WRITE_TIMEOUT};
use crate::router::{MessageRouter, RouterError, Session};

/// Lifecycle of one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not logged in.
    Connecting,
    /// Logged in and registered.
    Authenticated(Session),
    /// The read loop has ended.
    Closed,
}

/// Listener serving the packet protocol.
pub struct RelayServer {
    listener: TcpListener,
    router: Arc<MessageRouter>,
    codec: PacketCodec,
    events: broadcast::Sender<RelayEvent>,
    write_timeout: Duration,
}

impl RelayServer {
    /// Bind the packet port.
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<MessageRouter>,
        codec: PacketCodec,
        events: broadcast::Sender<RelayEvent>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            codec,
            events,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// Deadline for each frame written to an accepted connection.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Relay server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Relay server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let router = self.router.clone();
                            let codec = self.codec;
                            let write_timeout = self.write_timeout;
                            let events = self.events.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                serve_stream(
                                    stream,
                                    peer,
                                    router,
                                    codec,
                                    write_timeout,
                                    events,
                                    shutdown,
                                )
                                .await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }
    }
}

async fn serve_stream(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<MessageRouter>,
    codec: PacketCodec,
    write_timeout: Duration,
    events: broadcast::Sender<RelayEvent>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(
        PacketWriter::new(Box::new(write_half), Some(peer), codec).with_write_timeout(write_timeout),
    );

    let mut handler = ConnectionHandler::new(router, writer.clone(), events);
    handler
        .run(&mut BufReader::new(read_half), &codec, shutdown)
        .await;
    writer.shutdown().await;
}

/// Drives one connection through its [`ConnectionState`]s.
pub struct ConnectionHandler {
    router: Arc<MessageRouter>,
    writer: Arc<PacketWriter>,
    events: broadcast::Sender<RelayEvent>,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub fn new(
        router: Arc<MessageRouter>,
        writer: Arc<PacketWriter>,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        Self {
            router,
            writer,
            events,
            state: ConnectionState::Connecting,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Read and handle envelopes until the stream fails or `shutdown` fires.
    pub async fn run<R>(&mut self, reader: &mut R, codec: &PacketCodec, shutdown: CancellationToken)
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let reason = loop {
            let read = tokio::select! {
                _ = shutdown.cancelled() => break "relay shutting down".to_string(),
                read = codec.read_envelope(reader) => read,
            };

            match read {
                // A timed-out write may have left half a frame on the wire.
                Ok(_) if self.writer.is_broken() => break "write timed out".to_string(),
                Ok(envelope) => self.handle(envelope).await,
                Err(e) => break e.to_string(),
            }
        };
        self.close(&reason);
    }

    /// Handle one envelope and write the reply, if any.
    pub async fn handle(&mut self, envelope: Envelope) {
        let Some(reply) = self.dispatch(&envelope).await else {
            return;
        };
        if let Err(e) = self.writer.send(&reply).await {
            warn!(
                connection_id = self.writer.id(),
                error = %e,
                "Failed to write reply"
            );
        }
    }

    async fn dispatch(&mut self, envelope: &Envelope) -> Option<Envelope> {
        if envelope.kind.is_session_opener() {
            return Some(self.open_session(envelope));
        }

        let session = match &self.state {
            ConnectionState::Authenticated(session)
                if self
                    .router
                    .is_session_valid(session, envelope.session_token.as_deref()) =>
            {
                session.clone()
            }
            _ => {
                debug!(
                    connection_id = self.writer.id(),
                    kind = ?envelope.kind,
                    "Rejected envelope without a valid session"
                );
                return Some(RouterError::SessionRequired.to_envelope(envelope));
            }
        };

        if envelope.kind == Kind::Logout {
            self.end_session(&session, "logout");
            self.state = ConnectionState::Connecting;
            return Some(envelope.reply(Kind::Response, "{}"));
        }

        match self.router.route(envelope, &session).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(user_id = session.user_id, kind = ?envelope.kind, error = %e, "Request failed");
                Some(e.to_envelope(envelope))
            }
        }
    }

    fn open_session(&mut self, envelope: &Envelope) -> Envelope {
        match self.router.open_session(envelope, &self.writer) {
            Ok((reply, session)) => {
                if let ConnectionState::Authenticated(previous) = &self.state {
                    if previous.user_id != session.user_id {
                        let previous = previous.clone();
                        self.end_session(&previous, "switched user");
                    }
                }
                let _ = self.events.send(RelayEvent::UserOnline {
                    user_id: session.user_id,
                });
                self.state = ConnectionState::Authenticated(session);
                reply
            }
            Err(e) => {
                info!(connection_id = self.writer.id(), error = %e, "Login failed");
                e.to_envelope(envelope)
            }
        }
    }

    fn end_session(&self, session: &Session, reason: &str) {
        self.router.close_session(session, self.writer.id());
        let _ = self.events.send(RelayEvent::UserOffline {
            user_id: session.user_id,
            reason: reason.to_string(),
        });
    }

    fn close(&mut self, reason: &str) {
        let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
        if let ConnectionState::Authenticated(session) = state {
            info!(user_id = session.user_id, reason, "Connection closed");
            self.end_session(&session, reason);
        } else {
            debug!(connection_id = self.writer.id(), reason, "Anonymous connection closed");
        }
    }
}
