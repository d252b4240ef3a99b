use tokio::sync::{mpsc, watch};

use crate::registry::TunnelSnapshot;
use crate::scanner::RemotePortRecord;

/// Manual commands from the CLI/dashboard. Fire-and-forget; effects show up
/// in the next snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a tunnel for the remote port, or close the existing one.
    Toggle(u16),
    /// Scan now instead of waiting for the next interval.
    Refresh,
}

/// Consistent point-in-time view published after every reconciliation.
///
/// `remote_ports` is the full last-observed inventory, including ports that
/// were skipped or exceed the auto-forward limit, so a consumer can offer
/// them for manual toggling.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub tunnels: Vec<TunnelSnapshot>,
    pub remote_ports: Vec<RemotePortRecord>,
}

impl StateSnapshot {
    pub fn tunnel(&self, remote_port: u16) -> Option<&TunnelSnapshot> {
        self.tunnels.iter().find(|t| t.remote_port == remote_port)
    }
}

/// The pair of channels an external consumer holds: command sender in,
/// snapshot watcher out.
#[derive(Clone)]
pub struct ControlHandle {
    pub commands: mpsc::Sender<Command>,
    pub snapshots: watch::Receiver<StateSnapshot>,
}

impl ControlHandle {
    /// Returns false when the control loop is gone.
    pub async fn toggle(&self, remote_port: u16) -> bool {
        self.commands.send(Command::Toggle(remote_port)).await.is_ok()
    }

    pub async fn refresh(&self) -> bool {
        self.commands.send(Command::Refresh).await.is_ok()
    }

    pub fn current(&self) -> StateSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Await the next published snapshot.
    pub async fn next_snapshot(&mut self) -> Option<StateSnapshot> {
        self.snapshots.changed().await.ok()?;
        Some(self.snapshots.borrow().clone())
    }
}
