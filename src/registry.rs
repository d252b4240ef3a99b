use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    /// Local port allocated, listener not yet bound.
    Pending,
    /// Listener bound and accepting connections.
    Active,
    /// Teardown requested, existing connections draining.
    Closing,
    /// Terminal: fully drained and removed.
    Closed,
    /// Terminal: allocation/bind error or repeated channel failures.
    Failed,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelStatus::Pending => "pending",
            TunnelStatus::Active => "active",
            TunnelStatus::Closing => "closing",
            TunnelStatus::Closed => "closed",
            TunnelStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Per-tunnel traffic counters, updated by data pumps without taking the
/// registry lock.
#[derive(Debug, Default)]
pub struct TunnelStats {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl TunnelStats {
    pub fn add_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }
}

/// What a serve task needs from its registry entry.
pub struct TunnelHandles {
    pub stats: Arc<TunnelStats>,
    pub close_rx: watch::Receiver<bool>,
}

/// Registry entry removed on finalize, returned for logging.
#[derive(Debug)]
pub struct FinalizedTunnel {
    pub local_port: u16,
    pub status: TunnelStatus,
    pub aborted_connections: u32,
}

/// Read-only row for the reconciler's diff.
#[derive(Debug, Clone)]
pub struct TunnelView {
    pub remote_port: u16,
    pub local_port: u16,
    pub process_name: Option<String>,
    pub status: TunnelStatus,
}

/// Point-in-time copy of one tunnel for external consumers.
#[derive(Debug, Clone)]
pub struct TunnelSnapshot {
    pub remote_port: u16,
    pub local_port: u16,
    pub process_name: Option<String>,
    pub status: TunnelStatus,
    pub active_connections: u32,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub created_at: Instant,
}

struct TunnelEntry {
    local_port: u16,
    process_name: Option<String>,
    status: TunnelStatus,
    created_at: Instant,
    connections: u32,
    manual: bool,
    failure_streak: u32,
    stats: Arc<TunnelStats>,
    close_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    tunnels: HashMap<u16, TunnelEntry>,
    /// Remote ports whose tunnels failed since the last tick, reported by
    /// pump tasks and drained by the reconciler for retry damping.
    recent_failures: HashSet<u16>,
}

/// The single shared source of truth, keyed by remote port.
///
/// Every mutation is a short critical section with no I/O under the lock.
/// Pump tasks report back by key; nothing holds a reference into the map.
#[derive(Clone, Default)]
pub struct TunnelRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a new Pending entry. Returns None when the remote port already
    /// has a tunnel, preserving the one-tunnel-per-port invariant.
    pub fn insert_pending(
        &self,
        remote_port: u16,
        local_port: u16,
        process_name: Option<String>,
        manual: bool,
    ) -> Option<TunnelHandles> {
        let mut inner = self.locked();
        if inner.tunnels.contains_key(&remote_port) {
            return None;
        }

        let (close_tx, close_rx) = watch::channel(false);
        let stats = Arc::new(TunnelStats::default());
        inner.tunnels.insert(
            remote_port,
            TunnelEntry {
                local_port,
                process_name,
                status: TunnelStatus::Pending,
                created_at: Instant::now(),
                connections: 0,
                manual,
                failure_streak: 0,
                stats: Arc::clone(&stats),
                close_tx,
            },
        );

        Some(TunnelHandles { stats, close_rx })
    }

    /// Pending -> Active once the local listener is bound. Returns false if
    /// the entry is gone or no longer pending.
    pub fn mark_active(&self, remote_port: u16) -> bool {
        let mut inner = self.locked();
        match inner.tunnels.get_mut(&remote_port) {
            Some(entry) if entry.status == TunnelStatus::Pending => {
                entry.status = TunnelStatus::Active;
                true
            }
            _ => false,
        }
    }

    /// Drop a Pending entry whose listener never bound. The serve task does
    /// not exist yet, so removal happens here rather than in finalize.
    pub fn abort_pending(&self, remote_port: u16) {
        self.locked().tunnels.remove(&remote_port);
    }

    /// Request teardown: stop accepting, signal every pump to cancel. The
    /// owning serve task completes the drain and removes the entry.
    pub fn begin_close(&self, remote_port: u16) -> bool {
        let mut inner = self.locked();
        let Some(entry) = inner.tunnels.get_mut(&remote_port) else {
            return false;
        };
        if matches!(entry.status, TunnelStatus::Pending | TunnelStatus::Active) {
            entry.status = TunnelStatus::Closing;
        }
        let _ = entry.close_tx.send(true);
        true
    }

    /// Escalate a live tunnel to Failed and signal teardown. Records the
    /// port for retry damping. Returns false if the tunnel is absent or
    /// already closing.
    pub fn mark_failed(&self, remote_port: u16) -> bool {
        let mut inner = self.locked();
        let Some(entry) = inner.tunnels.get_mut(&remote_port) else {
            return false;
        };
        if !matches!(entry.status, TunnelStatus::Pending | TunnelStatus::Active) {
            return false;
        }
        entry.status = TunnelStatus::Failed;
        let _ = entry.close_tx.send(true);
        inner.recent_failures.insert(remote_port);
        true
    }

    /// Total transport loss: every live tunnel becomes Failed and is
    /// signalled to tear down.
    pub fn fail_all(&self) {
        let mut inner = self.locked();
        let mut failed = Vec::new();
        for (port, entry) in inner.tunnels.iter_mut() {
            if matches!(entry.status, TunnelStatus::Pending | TunnelStatus::Active) {
                entry.status = TunnelStatus::Failed;
                failed.push(*port);
            }
            let _ = entry.close_tx.send(true);
        }
        for port in failed {
            inner.recent_failures.insert(port);
        }
    }

    /// Remove the entry once its serve task has drained. A Closing tunnel
    /// finishes as Closed; a Failed tunnel stays Failed.
    pub fn finalize_close(&self, remote_port: u16) -> Option<FinalizedTunnel> {
        let mut inner = self.locked();
        let entry = inner.tunnels.remove(&remote_port)?;
        let status = match entry.status {
            TunnelStatus::Failed => TunnelStatus::Failed,
            _ => TunnelStatus::Closed,
        };
        Some(FinalizedTunnel {
            local_port: entry.local_port,
            status,
            aborted_connections: entry.connections,
        })
    }

    /// Count a new local connection. Refused (false) unless the tunnel is
    /// Active, so closing tunnels stop taking work.
    pub fn connection_opened(&self, remote_port: u16) -> bool {
        let mut inner = self.locked();
        match inner.tunnels.get_mut(&remote_port) {
            Some(entry) if entry.status == TunnelStatus::Active => {
                entry.connections += 1;
                true
            }
            _ => false,
        }
    }

    /// Decremented exactly once per counted connection, whichever side
    /// closed first.
    pub fn connection_closed(&self, remote_port: u16) {
        let mut inner = self.locked();
        if let Some(entry) = inner.tunnels.get_mut(&remote_port) {
            entry.connections = entry.connections.saturating_sub(1);
        }
    }

    /// Bump the consecutive channel-open failure streak, returning the new
    /// value.
    pub fn record_channel_failure(&self, remote_port: u16) -> u32 {
        let mut inner = self.locked();
        match inner.tunnels.get_mut(&remote_port) {
            Some(entry) => {
                entry.failure_streak += 1;
                entry.failure_streak
            }
            None => 0,
        }
    }

    pub fn reset_channel_failures(&self, remote_port: u16) {
        let mut inner = self.locked();
        if let Some(entry) = inner.tunnels.get_mut(&remote_port) {
            entry.failure_streak = 0;
        }
    }

    pub fn update_process_name(&self, remote_port: u16, process_name: Option<String>) {
        let mut inner = self.locked();
        if let Some(entry) = inner.tunnels.get_mut(&remote_port) {
            entry.process_name = process_name;
        }
    }

    /// Ports whose tunnels failed since the last call. Drained by the
    /// reconciler into its damping set.
    pub fn take_recent_failures(&self) -> Vec<u16> {
        self.locked().recent_failures.drain().collect()
    }

    /// Rows for the reconciler's diff, ordered by remote port.
    pub fn view(&self) -> Vec<TunnelView> {
        let inner = self.locked();
        let mut rows: Vec<TunnelView> = inner
            .tunnels
            .iter()
            .map(|(port, entry)| TunnelView {
                remote_port: *port,
                local_port: entry.local_port,
                process_name: entry.process_name.clone(),
                status: entry.status,
            })
            .collect();
        rows.sort_by_key(|r| r.remote_port);
        rows
    }

    /// Every local port currently held, including tunnels still draining.
    /// A port is released only when its entry leaves the map.
    pub fn local_ports_in_use(&self) -> HashSet<u16> {
        self.locked()
            .tunnels
            .values()
            .map(|entry| entry.local_port)
            .collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.locked().tunnels.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_empty(&self) -> bool {
        self.locked().tunnels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.locked().tunnels.len()
    }

    pub fn manual_ports(&self) -> HashSet<u16> {
        self.locked()
            .tunnels
            .iter()
            .filter(|(_, e)| e.manual)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Point-in-time copy for publication, ordered by remote port.
    pub fn snapshot_rows(&self) -> Vec<TunnelSnapshot> {
        let inner = self.locked();
        let mut rows: Vec<TunnelSnapshot> = inner
            .tunnels
            .iter()
            .map(|(port, entry)| TunnelSnapshot {
                remote_port: *port,
                local_port: entry.local_port,
                process_name: entry.process_name.clone(),
                status: entry.status,
                active_connections: entry.connections,
                bytes_up: entry.stats.bytes_up(),
                bytes_down: entry.stats.bytes_down(),
                created_at: entry.created_at,
            })
            .collect();
        rows.sort_by_key(|r| r.remote_port);
        rows
    }
}
