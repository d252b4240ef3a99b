use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ForwardConfig;
use crate::registry::{TunnelHandles, TunnelRegistry, TunnelStats, TunnelStatus};
use crate::transport::Transport;

/// Remote-side connect target for tunnel channels. Scanned ports are
/// listeners on the remote host itself.
const REMOTE_CHANNEL_HOST: &str = "127.0.0.1";

struct ConnectionContext {
    transport: Arc<dyn Transport>,
    registry: TunnelRegistry,
    remote_port: u16,
    stats: Arc<TunnelStats>,
    close_rx: watch::Receiver<bool>,
    buffer_size: usize,
    fail_threshold: u32,
}

/// Accept loop for one tunnel. Runs until the registry signals close, then
/// drains in-flight connections within the configured bound and removes the
/// registry entry.
pub async fn serve_tunnel(
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    registry: TunnelRegistry,
    remote_port: u16,
    handles: TunnelHandles,
    config: ForwardConfig,
) {
    let TunnelHandles {
        stats,
        mut close_rx,
    } = handles;
    let mut connections: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        if !registry.connection_opened(remote_port) {
                            // Tunnel is closing; refuse new work.
                            continue;
                        }
                        debug!(remote_port, peer = %peer, "accepted local connection");
                        let ctx = ConnectionContext {
                            transport: Arc::clone(&transport),
                            registry: registry.clone(),
                            remote_port,
                            stats: Arc::clone(&stats),
                            close_rx: close_rx.clone(),
                            buffer_size: config.buffer_size,
                            fail_threshold: config.channel_fail_threshold,
                        };
                        connections.spawn(pump_connection(socket, ctx));
                    }
                    Err(e) => {
                        warn!(remote_port, error = %e, "failed to accept local connection");
                    }
                }
            }
            _ = close_rx.changed() => break,
        }

        // Reap finished connection tasks as we go.
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    drain_connections(&mut connections, config.drain_timeout, remote_port).await;

    if let Some(fin) = registry.finalize_close(remote_port) {
        if fin.aborted_connections > 0 {
            warn!(
                remote_port,
                connections = fin.aborted_connections,
                "drain timeout exceeded, connections aborted"
            );
        }
        match fin.status {
            TunnelStatus::Failed => {
                warn!(remote_port, local_port = fin.local_port, "tunnel failed")
            }
            _ => info!(remote_port, local_port = fin.local_port, "tunnel closed"),
        }
    }
}

async fn drain_connections(connections: &mut JoinSet<()>, drain: Duration, remote_port: u16) {
    if connections.is_empty() {
        return;
    }
    debug!(remote_port, count = connections.len(), "draining connections");

    let drained = timeout(drain, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        connections.shutdown().await;
    }
}

/// One local connection: open a matching remote channel, then pump bytes
/// both ways. The connection count is decremented exactly once no matter
/// which side finished first.
async fn pump_connection(socket: TcpStream, mut ctx: ConnectionContext) {
    let channel = match ctx
        .transport
        .open_channel(REMOTE_CHANNEL_HOST, ctx.remote_port)
        .await
    {
        Ok(channel) => {
            ctx.registry.reset_channel_failures(ctx.remote_port);
            channel
        }
        Err(e) => {
            let streak = ctx.registry.record_channel_failure(ctx.remote_port);
            warn!(
                remote_port = ctx.remote_port,
                error = %e,
                streak,
                "failed to open remote channel"
            );
            // One refused connect is not evidence the tunnel is broken;
            // a streak of them is.
            if streak >= ctx.fail_threshold && ctx.registry.mark_failed(ctx.remote_port) {
                error!(
                    remote_port = ctx.remote_port,
                    "tunnel failed: repeated channel-open errors"
                );
            }
            ctx.registry.connection_closed(ctx.remote_port);
            return;
        }
    };

    pump_streams(
        socket,
        channel,
        ctx.buffer_size,
        &ctx.stats,
        &mut ctx.close_rx,
    )
    .await;

    ctx.registry.connection_closed(ctx.remote_port);
    debug!(remote_port = ctx.remote_port, "connection finished");
}

/// Two copy loops over one select: local -> remote and remote -> local.
/// Either side finishing, erroring, or the tunnel closing tears down both
/// legs. Reads apply natural backpressure; nothing is buffered beyond one
/// `buffer_size` chunk per direction.
async fn pump_streams<L, R>(
    local: L,
    remote: R,
    buffer_size: usize,
    stats: &TunnelStats,
    close_rx: &mut watch::Receiver<bool>,
) where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);
    let mut up_buf = vec![0u8; buffer_size];
    let mut down_buf = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            read = local_read.read(&mut up_buf) => match read {
                Ok(0) => {
                    let _ = remote_write.shutdown().await;
                    break;
                }
                Ok(n) => {
                    if remote_write.write_all(&up_buf[..n]).await.is_err() {
                        break;
                    }
                    stats.add_up(n as u64);
                }
                Err(_) => break,
            },
            read = remote_read.read(&mut down_buf) => match read {
                Ok(0) => {
                    let _ = local_write.shutdown().await;
                    break;
                }
                Ok(n) => {
                    if local_write.write_all(&down_buf[..n]).await.is_err() {
                        break;
                    }
                    stats.add_down(n as u64);
                }
                Err(_) => break,
            },
            _ = close_rx.changed() => break,
        }
    }
}
