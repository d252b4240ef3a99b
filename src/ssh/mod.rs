//! SSH connectivity: destination resolution, authentication, and the
//! [`Transport`](crate::transport::Transport) implementation tunnels run on.

pub mod client;
pub mod config;

pub use client::{SshClient, SshTransport};
pub use config::ResolvedHost;
