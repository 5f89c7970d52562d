//! SSH agent probing and authentication.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use russh::{client, keys};
use tracing::{debug, info};

use crate::ssh::client::SshClientHandler;

use super::strategy::AuthStrategy;

/// Checks whether an agent is reachable and holds at least one key.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn has_identities(&self, socket: &Path) -> bool;
}

/// Probes a real agent over its Unix socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshAgentProbe;

#[async_trait]
impl AgentProbe for SshAgentProbe {
    #[cfg(unix)]
    async fn has_identities(&self, socket: &Path) -> bool {
        let mut agent = match keys::agent::client::AgentClient::connect_uds(socket).await {
            Ok(agent) => agent,
            Err(e) => {
                debug!("SSH agent at {} not reachable: {}", socket.display(), e);
                return false;
            }
        };
        match agent.request_identities().await {
            Ok(identities) => {
                debug!("SSH agent holds {} identities", identities.len());
                !identities.is_empty()
            }
            Err(e) => {
                debug!("SSH agent identity listing failed: {}", e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn has_identities(&self, _socket: &Path) -> bool {
        false
    }
}

/// Authenticates with every identity held by the agent until one is accepted.
///
/// No key material is read by this process.
pub struct AgentAuth {
    socket: PathBuf,
}

impl AgentAuth {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    #[cfg(unix)]
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_uds(&self.socket)
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to get identities from SSH agent: {}", e))?;

        if identities.is_empty() {
            return Err("No identities found in SSH agent".to_string());
        }

        for identity in identities {
            debug!("Trying SSH agent identity: {:?}", identity.comment());

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => {
                    info!("Successfully authenticated with SSH agent");
                    return Ok(true);
                }
                Ok(_) => debug!("Agent identity not accepted, trying next"),
                Err(e) => debug!("Agent authentication error: {}, trying next", e),
            }
        }

        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate(
        &self,
        _handle: &mut client::Handle<SshClientHandler>,
        _username: &str,
    ) -> Result<bool, String> {
        Err("SSH agent sockets are only supported on Unix".to_string())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}
