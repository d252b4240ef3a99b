use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("remote command failed: {0}")]
    Exec(String),

    #[error("failed to open channel to {host}:{port}: {message}")]
    ChannelOpen {
        host: String,
        port: u16,
        message: String,
    },

    #[error("transport connection lost")]
    ConnectionLost,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured output of a one-shot remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    /// Exit status if the remote reported one before closing the channel.
    pub exit_code: Option<u32>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code.unwrap_or(0) == 0
    }
}

/// A bidirectional byte stream to one remote endpoint.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Capabilities the forwarding core needs from an established connection.
///
/// The core never dials or authenticates anything itself; it is handed an
/// implementation of this trait (the russh client in production, an
/// in-memory fake in tests) and treats both operations as slow and fallible.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a one-shot command on the remote host and capture its output.
    async fn execute(&self, command: &str) -> Result<ExecOutput, TransportError>;

    /// Open a byte-stream channel to `host:port` as seen from the remote
    /// side. One channel per local connection.
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn ByteStream>, TransportError>;

    /// Whether the underlying connection is still alive. Used to tell a
    /// transient scan failure apart from total transport loss.
    fn is_connected(&self) -> bool;
}
