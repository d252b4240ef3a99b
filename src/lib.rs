//! Mirror remote listening TCP ports to local listeners over one SSH
//! connection.
//!
//! The pieces, from the outside in:
//! - SSH connection and authentication ([`ssh`])
//! - remote listening-port discovery ([`scanner`])
//! - the reconciliation loop keeping local tunnels in sync ([`reconciler`],
//!   [`monitor`])
//! - per-tunnel state tracking ([`registry`]) and the data pump ([`pump`])

pub mod allocator;
pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod monitor;
pub mod pump;
pub mod reconciler;
pub mod registry;
pub mod scanner;
pub mod ssh;
pub mod transport;

pub use allocator::{AllocationError, PortAllocator};
pub use config::{ConfigError, ForwardConfig};
pub use control::{Command, ControlHandle, StateSnapshot};
pub use error::{Error, Result};
pub use monitor::Monitor;
pub use registry::{TunnelRegistry, TunnelSnapshot, TunnelStatus};
pub use scanner::{CommandScanner, InventoryScanner, RemotePortRecord, ScanError};
pub use ssh::SshClient;
pub use transport::{ByteStream, ExecOutput, Transport, TransportError};
