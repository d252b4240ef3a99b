use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::agent::client::AgentClient;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::{client, ChannelMsg, Disconnect};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::{ByteStream, ExecOutput, Transport, TransportError};

use super::config::{self, ResolvedHost};

const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

struct Handler;

impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // TODO: verify against known_hosts instead of trusting every key.
        Ok(true)
    }
}

/// An authenticated SSH connection to the remote host.
pub struct SshClient {
    handle: Arc<client::Handle<Handler>>,
}

impl SshClient {
    /// Connect to a `[user@]host` destination and authenticate.
    ///
    /// Tries the SSH agent first, then each identity file, then falls back
    /// to an interactive password prompt.
    pub async fn connect(destination: &str, port_override: Option<u16>) -> Result<Self> {
        let resolved = config::resolve(destination, port_override);
        info!(
            host = %resolved.hostname,
            port = resolved.port,
            user = %resolved.user,
            "connecting"
        );

        let client_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        });

        let addr_str = format!("{}:{}", resolved.hostname, resolved.port);
        let addr: SocketAddr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| Error::SshConnection(format!("cannot resolve '{addr_str}': {e}")))?
            .next()
            .ok_or_else(|| Error::SshConnection(format!("no addresses for '{addr_str}'")))?;

        let mut handle = client::connect(client_config, addr, Handler)
            .await
            .map_err(|e| Error::SshConnection(e.to_string()))?;

        authenticate(&mut handle, &resolved).await?;

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// The transport used by the scanner and every tunnel.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(SshTransport {
            handle: Arc::clone(&self.handle),
        })
    }

    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

async fn authenticate(handle: &mut client::Handle<Handler>, host: &ResolvedHost) -> Result<()> {
    if try_agent_auth(handle, &host.user).await {
        return Ok(());
    }

    for key_path in &host.identity_files {
        if try_key_auth(handle, &host.user, key_path).await {
            return Ok(());
        }
    }

    info!("no SSH keys accepted, trying password authentication");
    let prompt = format!("Password for {}@{}", host.user, host.hostname);
    let password = tokio::task::spawn_blocking(move || {
        dialoguer::Password::new().with_prompt(prompt).interact()
    })
    .await
    .map_err(|e| Error::SshAuth(format!("password prompt failed: {e}")))?
    .map_err(|e| Error::SshAuth(format!("password prompt failed: {e}")))?;

    let result = handle
        .authenticate_password(&host.user, &password)
        .await
        .map_err(|e| Error::SshAuth(e.to_string()))?;
    if !result.success() {
        return Err(Error::SshAuth("password rejected".to_string()));
    }
    info!(user = %host.user, "password authentication successful");
    Ok(())
}

async fn try_agent_auth(handle: &mut client::Handle<Handler>, user: &str) -> bool {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return false;
    }

    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            debug!(%e, "cannot reach SSH agent");
            return false;
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(e) => {
            debug!(%e, "agent identity listing failed");
            return false;
        }
    };

    for key in identities {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        match handle
            .authenticate_publickey_with(user, key, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => {
                info!(user, "agent authentication successful");
                return true;
            }
            Ok(_) => {}
            Err(e) => debug!(%e, "agent auth attempt failed"),
        }
    }
    false
}

async fn try_key_auth(handle: &mut client::Handle<Handler>, user: &str, key_path: &Path) -> bool {
    if !key_path.exists() {
        return false;
    }
    debug!(key = %key_path.display(), "trying SSH key");

    let key = match load_secret_key(key_path, None) {
        Ok(key) => key,
        Err(e) => {
            // Usually an encrypted key; the agent is the supported path for
            // those.
            debug!(key = %key_path.display(), %e, "cannot load key");
            return false;
        }
    };

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    match handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
    {
        Ok(result) if result.success() => {
            info!(user, key = %key_path.display(), "key authentication successful");
            true
        }
        Ok(_) => {
            debug!(key = %key_path.display(), "key not accepted");
            false
        }
        Err(e) => {
            debug!(key = %key_path.display(), %e, "auth attempt failed");
            false
        }
    }
}

/// `Transport` backed by the SSH session. Cheap to share: every tunnel task
/// holds the same underlying handle.
pub struct SshTransport {
    handle: Arc<client::Handle<Handler>>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn execute(&self, command: &str) -> std::result::Result<ExecOutput, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Exec(format!("channel open failed: {e}")))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Exec(format!("exec failed: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // ExitStatus often arrives after Eof, so only Close or a dead
        // channel ends the loop.
        loop {
            match tokio::time::timeout(EXEC_TIMEOUT, channel.wait()).await {
                Ok(Some(msg)) => match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext } => {
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                },
                Ok(None) => break,
                Err(_) => return Err(TransportError::Exec("command timed out".to_string())),
            }
        }

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        debug!(
            command,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "remote command finished"
        );
        Ok(ExecOutput { stdout, exit_code })
    }

    async fn open_channel(
        &self,
        host: &str,
        port: u16,
    ) -> std::result::Result<Box<dyn ByteStream>, TransportError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| TransportError::ChannelOpen {
                host: host.to_string(),
                port,
                message: e.to_string(),
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }
}
