use thiserror::Error;

use crate::allocator::AllocationError;
use crate::config::ConfigError;
use crate::scanner::ScanError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SSH connection failed: {0}")]
    SshConnection(String),

    #[error("SSH authentication failed: {0}")]
    SshAuth(String),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The SSH connection itself is gone. Fatal: the control loop stops and
    /// every live tunnel is marked failed.
    #[error("SSH connection lost")]
    ConnectionLost,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
