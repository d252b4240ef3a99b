use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::allocator::PortAllocator;
use crate::config::ForwardConfig;
use crate::control::{Command, ControlHandle, StateSnapshot};
use crate::error::Result;
use crate::reconciler::Reconciler;
use crate::registry::TunnelRegistry;
use crate::scanner::InventoryScanner;
use crate::transport::Transport;

const SHUTDOWN_POLL: Duration = Duration::from_millis(25);

/// Owns the periodic scan loop and serializes every reconciliation, whether
/// timer-driven or command-driven, onto one task.
pub struct Monitor {
    reconciler: Reconciler,
    registry: TunnelRegistry,
    commands_rx: mpsc::Receiver<Command>,
    // Kept so the command channel never reads as closed, even with no
    // external ControlHandle alive.
    _commands_tx: mpsc::Sender<Command>,
    config: ForwardConfig,
}

impl Monitor {
    pub fn new(
        config: ForwardConfig,
        scanner: Arc<dyn InventoryScanner>,
        transport: Arc<dyn Transport>,
        registry: TunnelRegistry,
    ) -> (Self, ControlHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(StateSnapshot::default());

        let reconciler = Reconciler::new(
            config.clone(),
            scanner,
            transport,
            registry.clone(),
            PortAllocator::new(config.port_range),
            snapshot_tx,
        );

        let handle = ControlHandle {
            commands: commands_tx.clone(),
            snapshots: snapshot_rx,
        };
        let monitor = Self {
            reconciler,
            registry,
            commands_rx,
            _commands_tx: commands_tx,
            config,
        };
        (monitor, handle)
    }

    /// Run until ctrl-c or a fatal error, then drain every tunnel.
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.scan_interval, "monitoring remote ports");

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconciler.tick(Vec::new(), true).await {
                        break Err(e);
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    let mut batch = vec![command];
                    while let Ok(command) = self.commands_rx.try_recv() {
                        batch.push(command);
                    }
                    let fresh = batch.contains(&Command::Refresh);
                    if let Err(e) = self.reconciler.tick(batch, fresh).await {
                        break Err(e);
                    }
                    if fresh {
                        ticker.reset();
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Ask every tunnel to close and wait for the registry to empty, bounded
    /// by the drain timeout plus slack for the serve tasks' own drains.
    async fn shutdown(&mut self) {
        let ports = self.registry.ports();
        if !ports.is_empty() {
            info!(count = ports.len(), "closing tunnels");
            for port in ports {
                self.registry.begin_close(port);
            }
        }

        let deadline =
            tokio::time::Instant::now() + self.config.drain_timeout + Duration::from_secs(1);
        while !self.registry.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.registry.len(),
                    "shutdown drain timeout exceeded"
                );
                return;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        info!("all tunnels closed");
    }
}
