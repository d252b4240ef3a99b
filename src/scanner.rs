use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::transport::Transport;

const SS_COMMAND: &str = "ss -tlnp 2>/dev/null";
const NETSTAT_COMMAND: &str = "netstat -tlnp 2>/dev/null";

#[derive(Error, Debug)]
#[error("remote port scan failed: {reason}")]
pub struct ScanError {
    pub reason: String,
}

/// One TCP port observed listening on the remote host. Rebuilt from scratch
/// on every scan, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePortRecord {
    pub port: u16,
    /// Owning process, when the remote session was privileged enough to see
    /// it.
    pub process_name: Option<String>,
}

/// Source of the remote listening-port inventory.
#[async_trait]
pub trait InventoryScanner: Send + Sync {
    /// Returns the full inventory ordered by port, or a transient error the
    /// reconciler treats as "no new information".
    async fn scan(&self) -> Result<Vec<RemotePortRecord>, ScanError>;
}

/// Scanner that runs `ss` (falling back to `netstat`) through the transport
/// and parses the listening table from stdout.
pub struct CommandScanner {
    transport: Arc<dyn Transport>,
}

impl CommandScanner {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn try_scan(&self) -> Result<Vec<RemotePortRecord>, String> {
        // An empty listening table still prints the `State` header, so a
        // header-less result means the command itself is unusable.
        match self.transport.execute(SS_COMMAND).await {
            Ok(out) if out.success() && out.stdout.contains("State") => {
                return Ok(parse_listening_ports(&out.stdout));
            }
            Ok(_) => debug!("ss produced no usable output, trying netstat"),
            Err(e) => debug!(error = %e, "ss failed, trying netstat"),
        }

        match self.transport.execute(NETSTAT_COMMAND).await {
            Ok(out)
                if out.success()
                    && (out.stdout.contains("Proto") || out.stdout.contains("LISTEN")) =>
            {
                Ok(parse_listening_ports(&out.stdout))
            }
            Ok(_) => Err("neither ss nor netstat produced usable output".to_string()),
            Err(e) => Err(format!("ss and netstat both failed: {e}")),
        }
    }
}

#[async_trait]
impl InventoryScanner for CommandScanner {
    async fn scan(&self) -> Result<Vec<RemotePortRecord>, ScanError> {
        let mut last_error = String::new();
        for attempt in 1..=2 {
            match self.try_scan().await {
                Ok(records) => {
                    debug!(count = records.len(), "remote scan complete");
                    return Ok(records);
                }
                Err(reason) => {
                    debug!(attempt, %reason, "scan attempt failed");
                    last_error = reason;
                }
            }
        }
        Err(ScanError { reason: last_error })
    }
}

/// Parse `ss -tlnp` or `netstat -tlnp` output into the port inventory.
///
/// Rows that do not look like a TCP listening socket are skipped. Ports bound
/// on several addresses (IPv4 + IPv6) collapse into one record, keeping the
/// row that names a process when any does.
pub(crate) fn parse_listening_ports(output: &str) -> Vec<RemotePortRecord> {
    let mut by_port: BTreeMap<u16, Option<String>> = BTreeMap::new();

    for line in output.lines() {
        let Some((port, name)) = parse_line(line) else {
            continue;
        };
        let entry = by_port.entry(port).or_insert(None);
        if entry.is_none() {
            *entry = name;
        }
    }

    by_port
        .into_iter()
        .map(|(port, process_name)| RemotePortRecord { port, process_name })
        .collect()
}

fn parse_line(line: &str) -> Option<(u16, Option<String>)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    // ss:        State  Recv-Q Send-Q Local:Port Peer:Port Process
    // ss -a-ish: Netid  State  Recv-Q Send-Q Local:Port Peer:Port Process
    // netstat:   Proto  Recv-Q Send-Q Local      Foreign   State  PID/Program
    let local_addr = if parts[0] == "LISTEN" {
        parts.get(3)?
    } else if parts[0].starts_with("tcp") {
        if parts.get(1) == Some(&"LISTEN") {
            parts.get(4)?
        } else if parts.iter().any(|&p| p == "LISTEN") {
            parts.get(3)?
        } else {
            return None;
        }
    } else {
        return None;
    };

    let port = parse_port(local_addr)?;
    if port == 0 {
        return None;
    }
    Some((port, extract_process_name(line)))
}

/// Pull the port out of a listen-address token. Handles `0.0.0.0:80`,
/// `127.0.0.1:3000`, `[::]:80`, `:::8080`, `*:22`.
fn parse_port(addr: &str) -> Option<u16> {
    let idx = addr.rfind(':')?;
    addr[idx + 1..].parse().ok()
}

fn extract_process_name(line: &str) -> Option<String> {
    // ss form: users:(("nginx",pid=1234,fd=6))
    if let Some(start) = line.find("users:((\"") {
        let rest = &line[start + 9..];
        if let Some(end) = rest.find('"') {
            let name = &rest[..end];
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    // netstat form: 1234/nginx
    for part in line.split_whitespace().rev() {
        if let Some((pid, name)) = part.split_once('/') {
            if pid.parse::<u32>().is_ok() && !name.is_empty() {
                return Some(name.trim_end_matches(':').to_string());
            }
        }
    }

    None
}
