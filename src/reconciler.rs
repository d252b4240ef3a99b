use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::allocator::PortAllocator;
use crate::config::ForwardConfig;
use crate::control::{Command, StateSnapshot};
use crate::error::{Error, Result};
use crate::pump;
use crate::registry::{TunnelRegistry, TunnelStatus, TunnelView};
use crate::scanner::{InventoryScanner, RemotePortRecord};
use crate::transport::Transport;

/// One step of convergence, applied destroys first, then creates, then
/// updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Destroy {
        remote_port: u16,
    },
    Create {
        remote_port: u16,
        process_name: Option<String>,
        manual: bool,
    },
    UpdateProcessName {
        remote_port: u16,
        process_name: Option<String>,
    },
}

/// The control loop's brain: diff observed remote state against the registry
/// and converge.
///
/// `plan` is pure bookkeeping over immutable views; `apply` performs the
/// allocation, binding, and task spawning the plan calls for. Both run on
/// the single monitor task, so automatic and manual actions never race.
pub struct Reconciler {
    config: ForwardConfig,
    scanner: Arc<dyn InventoryScanner>,
    transport: Arc<dyn Transport>,
    registry: TunnelRegistry,
    allocator: PortAllocator,
    snapshot_tx: watch::Sender<StateSnapshot>,
    last_inventory: Vec<RemotePortRecord>,
    /// Manually closed ports, not recreated until they cycle out of the
    /// remote inventory or are toggled back on.
    suppressed: HashSet<u16>,
    /// Ports whose tunnels failed, damped from automatic retry until the
    /// remote listener cycles.
    failed_ports: HashSet<u16>,
}

impl Reconciler {
    pub fn new(
        config: ForwardConfig,
        scanner: Arc<dyn InventoryScanner>,
        transport: Arc<dyn Transport>,
        registry: TunnelRegistry,
        allocator: PortAllocator,
        snapshot_tx: watch::Sender<StateSnapshot>,
    ) -> Self {
        Self {
            config,
            scanner,
            transport,
            registry,
            allocator,
            snapshot_tx,
            last_inventory: Vec::new(),
            suppressed: HashSet::new(),
            failed_ports: HashSet::new(),
        }
    }

    /// Run one reconciliation: scan (when `fresh`), plan, apply, publish.
    ///
    /// The only error returned is total transport loss; everything else is
    /// absorbed with a log line and retried on a later tick.
    pub async fn tick(&mut self, commands: Vec<Command>, fresh: bool) -> Result<()> {
        for port in self.registry.take_recent_failures() {
            self.failed_ports.insert(port);
        }

        let scan = if fresh { self.run_scan().await? } else { None };

        let view = self.registry.view();
        let actions = self.plan(scan.as_deref(), &view, &commands);
        if !actions.is_empty() {
            debug!(count = actions.len(), "reconciling");
        }
        self.apply(actions).await;
        self.publish();
        Ok(())
    }

    async fn run_scan(&mut self) -> Result<Option<Vec<RemotePortRecord>>> {
        let reason = match timeout(self.config.scan_timeout, self.scanner.scan()).await {
            Ok(Ok(inventory)) => return Ok(Some(inventory)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "scan timed out".to_string(),
        };

        if !self.transport.is_connected() {
            warn!("transport connection lost, failing all tunnels");
            self.registry.fail_all();
            self.publish();
            return Err(Error::ConnectionLost);
        }

        // Transient: keep every tunnel as-is and try again next tick.
        warn!(%reason, "scan failed, keeping current tunnels");
        Ok(None)
    }

    /// Diff the inventory against the registry view. `scan` is None when no
    /// fresh information exists; manual commands still apply then, automatic
    /// creates and destroys do not.
    fn plan(
        &mut self,
        scan: Option<&[RemotePortRecord]>,
        view: &[TunnelView],
        commands: &[Command],
    ) -> Vec<Action> {
        if let Some(inventory) = scan {
            let present: HashSet<u16> = inventory.iter().map(|r| r.port).collect();
            // Manual-close suppression and failure damping both last until
            // the remote port cycles out of the inventory.
            self.suppressed.retain(|p| present.contains(p));
            self.failed_ports.retain(|p| present.contains(p));
            self.last_inventory = inventory.to_vec();
        }

        let live: BTreeMap<u16, &TunnelView> = view
            .iter()
            .filter(|t| matches!(t.status, TunnelStatus::Pending | TunnelStatus::Active))
            .map(|t| (t.remote_port, t))
            .collect();
        let tracked: HashSet<u16> = view.iter().map(|t| t.remote_port).collect();
        let own_local_ports: HashSet<u16> = view.iter().map(|t| t.local_port).collect();

        let mut to_destroy: BTreeSet<u16> = BTreeSet::new();
        let mut to_create: BTreeMap<u16, (Option<String>, bool)> = BTreeMap::new();
        let mut updates: BTreeMap<u16, Option<String>> = BTreeMap::new();

        if let Some(inventory) = scan {
            let present: HashSet<u16> = inventory.iter().map(|r| r.port).collect();

            for t in live.values() {
                if !present.contains(&t.remote_port) {
                    to_destroy.insert(t.remote_port);
                }
            }

            for record in inventory {
                if !self.config.auto_forwardable(record.port)
                    || tracked.contains(&record.port)
                    || self.suppressed.contains(&record.port)
                    || self.failed_ports.contains(&record.port)
                {
                    continue;
                }
                // A remote port matching one of our own local listeners is
                // one of our tunnels echoed back by the scan.
                if own_local_ports.contains(&record.port) {
                    debug!(port = record.port, "skipping own listener");
                    continue;
                }
                to_create.insert(record.port, (record.process_name.clone(), false));
            }

            for record in inventory {
                if let Some(t) = live.get(&record.port) {
                    if t.process_name != record.process_name {
                        updates.insert(record.port, record.process_name.clone());
                    }
                }
            }
        }

        // Manual toggles resolve last and win for their port.
        for command in commands {
            let Command::Toggle(port) = *command else {
                continue;
            };
            match view.iter().find(|t| t.remote_port == port) {
                Some(t) if matches!(t.status, TunnelStatus::Pending | TunnelStatus::Active) => {
                    info!(remote_port = port, "manual close requested");
                    to_create.remove(&port);
                    updates.remove(&port);
                    to_destroy.insert(port);
                    self.suppressed.insert(port);
                }
                Some(_) => {
                    debug!(remote_port = port, "tunnel still draining, toggle ignored");
                }
                None => {
                    self.suppressed.remove(&port);
                    self.failed_ports.remove(&port);
                    match self.last_inventory.iter().find(|r| r.port == port) {
                        Some(record) => {
                            info!(remote_port = port, "manual open requested");
                            to_create.insert(port, (record.process_name.clone(), true));
                        }
                        None => {
                            warn!(
                                remote_port = port,
                                "port not observed on remote, toggle ignored"
                            );
                        }
                    }
                }
            }
        }

        let mut actions: Vec<Action> = Vec::new();
        actions.extend(
            to_destroy
                .into_iter()
                .map(|remote_port| Action::Destroy { remote_port }),
        );
        actions.extend(
            to_create
                .into_iter()
                .map(|(remote_port, (process_name, manual))| Action::Create {
                    remote_port,
                    process_name,
                    manual,
                }),
        );
        actions.extend(
            updates
                .into_iter()
                .map(|(remote_port, process_name)| Action::UpdateProcessName {
                    remote_port,
                    process_name,
                }),
        );
        actions
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Destroy { remote_port } => {
                    if self.registry.begin_close(remote_port) {
                        debug!(remote_port, "tunnel teardown requested");
                    }
                }
                Action::Create {
                    remote_port,
                    process_name,
                    manual,
                } => {
                    self.create_tunnel(remote_port, process_name, manual).await;
                }
                Action::UpdateProcessName {
                    remote_port,
                    process_name,
                } => {
                    debug!(
                        remote_port,
                        process = process_name.as_deref().unwrap_or("unknown"),
                        "process name changed"
                    );
                    self.registry.update_process_name(remote_port, process_name);
                }
            }
        }
    }

    async fn create_tunnel(&mut self, remote_port: u16, process_name: Option<String>, manual: bool) {
        let in_use = self.registry.local_ports_in_use();
        let local_port = match self.allocator.allocate(remote_port, &in_use) {
            Ok(port) => port,
            Err(e) => {
                warn!(remote_port, error = %e, "cannot allocate local port");
                self.failed_ports.insert(remote_port);
                return;
            }
        };

        let Some(handles) =
            self.registry
                .insert_pending(remote_port, local_port, process_name.clone(), manual)
        else {
            warn!(remote_port, "tunnel already exists, create skipped");
            return;
        };

        let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(remote_port, local_port, error = %e, "failed to bind local listener");
                self.registry.abort_pending(remote_port);
                self.failed_ports.insert(remote_port);
                return;
            }
        };

        if !self.registry.mark_active(remote_port) {
            return;
        }
        info!(
            remote_port,
            local_port,
            process = process_name.as_deref().unwrap_or("unknown"),
            "tunnel active"
        );

        tokio::spawn(pump::serve_tunnel(
            listener,
            Arc::clone(&self.transport),
            self.registry.clone(),
            remote_port,
            handles,
            self.config.clone(),
        ));
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(StateSnapshot {
            tunnels: self.registry.snapshot_rows(),
            remote_ports: self.last_inventory.clone(),
        });
    }
}
