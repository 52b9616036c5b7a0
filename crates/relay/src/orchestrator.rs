//! Relay orchestrator wiring together all components.
//!
//! The `RelayOrchestrator` owns the collaborators, binds the packet and file
//! listeners, forwards staged uploads to the router for "file available"
//! notifications, and runs the periodic retention sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::{PacketCodec, UserId};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chats::{ChatStore, MemoryChatStore};
use crate::config::Config;
use crate::files::{TransferRecord, TransferServer, TransferStore};
use crate::identity::{IdentityProvider, MemoryIdentityProvider};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::server::RelayServer;

/// Capacity of the staged-upload channel between the file listener and the router.
const STAGED_CHANNEL_CAPACITY: usize = 64;

/// Relay orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A user logged in.
    UserOnline { user_id: UserId },
    /// A user logged out or disconnected.
    UserOffline { user_id: UserId, reason: String },
    /// An upload was staged and its recipients notified.
    FileStaged { transfer_id: String, delivered: usize },
    /// The retention sweep cancelled or dropped expired transfers.
    TransfersSwept { count: usize },
}

/// Relay orchestrator that manages all subsystems.
pub struct RelayOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    router: Arc<MessageRouter>,
    transfers: Arc<TransferStore>,
    packet_addr: Option<SocketAddr>,
    file_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl RelayOrchestrator {
    /// Creates an orchestrator with in-memory identity and chat backends.
    pub fn new(config: Config) -> Self {
        Self::with_backends(
            config,
            Arc::new(MemoryIdentityProvider::new()),
            Arc::new(MemoryChatStore::new()),
        )
    }

    /// Creates an orchestrator using the given identity and chat backends.
    pub fn with_backends(
        config: Config,
        identity: Arc<dyn IdentityProvider>,
        chats: Arc<dyn ChatStore>,
    ) -> Self {
        let transfers = Arc::new(
            TransferStore::new(&config.transfer.staging_dir, config.transfer.max_file_size)
                .with_retention(config.transfer.retention())
                .with_idle_timeout(config.server.io_timeout()),
        );
        let registry = Arc::new(ConnectionRegistry::new(codec_for(&config)));
        let router = Arc::new(MessageRouter::new(
            registry,
            identity,
            chats,
            Arc::clone(&transfers),
        ));
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            router,
            transfers,
            packet_addr: None,
            file_addr: None,
            tasks: Vec::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for relay events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    /// Bind both listeners and start the background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(RelayEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting relay orchestrator...");
        // A token cancelled by an earlier stop or failed start cannot be reused.
        self.shutdown_token = CancellationToken::new();

        if let Err(e) = self.spawn_tasks().await {
            self.shutdown_token.cancel();
            self.packet_addr = None;
            self.file_addr = None;
            *self.state.write().await = OrchestratorState::Stopped;
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(RelayEvent::StateChanged(OrchestratorState::Running));

        info!(
            packet_addr = ?self.packet_addr,
            file_addr = ?self.file_addr,
            "Relay orchestrator started successfully"
        );
        Ok(())
    }

    async fn spawn_tasks(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.transfer.staging_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create staging directory: {}",
                    self.config.transfer.staging_dir.display()
                )
            })?;

        let packet_addr = self.config.server.packet_addr()?;
        let relay_server = RelayServer::bind(
            packet_addr,
            Arc::clone(&self.router),
            codec_for(&self.config),
            self.event_tx.clone(),
        )
        .await
        .with_context(|| format!("Failed to bind packet port {}", packet_addr))?
        .with_write_timeout(self.config.server.io_timeout());
        self.packet_addr = Some(relay_server.local_addr()?);

        let file_addr = self.config.server.file_addr()?;
        let (staged_tx, staged_rx) = mpsc::channel(STAGED_CHANNEL_CAPACITY);
        let transfer_server = TransferServer::bind(file_addr, Arc::clone(&self.transfers), staged_tx)
            .await
            .with_context(|| format!("Failed to bind file port {}", file_addr))?;
        self.file_addr = Some(transfer_server.local_addr()?);

        let token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(relay_server.run(token)));

        let token = self.shutdown_token.clone();
        self.tasks.push(tokio::spawn(transfer_server.run(token)));

        self.tasks.push(tokio::spawn(Self::forward_staged_uploads(
            staged_rx,
            Arc::clone(&self.router),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        )));

        self.tasks.push(tokio::spawn(Self::sweep_loop(
            Arc::clone(&self.transfers),
            self.config.transfer.sweep_interval(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        )));
        debug!("Started background tasks");

        Ok(())
    }

    /// Announces each staged upload to its recipients.
    async fn forward_staged_uploads(
        mut staged_rx: mpsc::Receiver<TransferRecord>,
        router: Arc<MessageRouter>,
        event_tx: broadcast::Sender<RelayEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                record = staged_rx.recv() => {
                    let Some(record) = record else { break };
                    let delivered = router.notify_file_available(&record).await;
                    let _ = event_tx.send(RelayEvent::FileStaged {
                        transfer_id: record.transfer_id,
                        delivered,
                    });
                }
            }
        }
        debug!("Staged upload forwarder stopped");
    }

    /// Periodically removes transfers past their retention window.
    async fn sweep_loop(
        transfers: Arc<TransferStore>,
        interval: std::time::Duration,
        event_tx: broadcast::Sender<RelayEvent>,
        shutdown_token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    let store = Arc::clone(&transfers);
                    match tokio::task::spawn_blocking(move || store.sweep()).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(count)) => {
                            info!(count, "Swept expired transfers");
                            let _ = event_tx.send(RelayEvent::TransfersSwept { count });
                        }
                        Ok(Err(e)) => warn!(error = %e, "Transfer sweep failed"),
                        Err(e) => warn!(error = %e, "Transfer sweep task panicked"),
                    }
                }
            }
        }
        debug!("Transfer sweep stopped");
    }

    /// Stops the relay gracefully.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(RelayEvent::StateChanged(OrchestratorState::ShuttingDown));

        info!("Stopping relay orchestrator...");
        self.shutdown_token.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(RelayEvent::StateChanged(OrchestratorState::Stopped));

        info!("Relay orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: RelayEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Address the packet listener is bound to, once started.
    pub fn packet_addr(&self) -> Option<SocketAddr> {
        self.packet_addr
    }

    /// Address the file listener is bound to, once started.
    pub fn file_addr(&self) -> Option<SocketAddr> {
        self.file_addr
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn transfers(&self) -> &Arc<TransferStore> {
        &self.transfers
    }

    /// Returns the number of logged-in users.
    pub fn connection_count(&self) -> usize {
        self.router.registry().len()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

fn codec_for(config: &Config) -> PacketCodec {
    PacketCodec::with_max_frame_size(config.server.max_frame_size)
}
