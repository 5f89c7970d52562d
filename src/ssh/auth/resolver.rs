use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::ssh::config::{AuthConfig, expand_tilde};
use crate::ssh::error::{Result, SshCoreError};
use crate::ssh::secrets::SecretStore;
use crate::ssh::types::JumpHostConfig;

use super::agent::AgentProbe;
use super::keys::KeyLoader;
use super::options::AuthOptions;
use super::prompt::{AuthMethodChoice, PromptProvider};

/// Credentials for a target and, when tunneling, for its jump host.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub target: AuthOptions,
    pub jump: Option<AuthOptions>,
}

/// Decides which credentials to present for a `(host, username)`.
///
/// Order, first hit wins:
/// 1. agent, when its socket exists and holds at least one key
/// 2. the explicit key path
/// 3. the first conventional default key that exists
/// 4. an auth method chosen through the [`PromptProvider`]
pub struct AuthResolver {
    config: AuthConfig,
    prompt: Arc<dyn PromptProvider>,
    secrets: Arc<dyn SecretStore>,
    agent: Arc<dyn AgentProbe>,
}

impl AuthResolver {
    pub fn new(
        config: AuthConfig,
        prompt: Arc<dyn PromptProvider>,
        secrets: Arc<dyn SecretStore>,
        agent: Arc<dyn AgentProbe>,
    ) -> Self {
        Self {
            config,
            prompt,
            secrets,
            agent,
        }
    }

    pub fn prompt(&self) -> Arc<dyn PromptProvider> {
        self.prompt.clone()
    }

    pub fn compression(&self) -> bool {
        self.config.compression
    }

    /// Resolve credentials for the target and its jump host.
    ///
    /// The jump host is resolved like any other host but never recurses.
    pub async fn resolve(
        &self,
        host: &str,
        username: &str,
        explicit_key: Option<&Path>,
        jump_host: Option<&JumpHostConfig>,
    ) -> Result<ResolvedAuth> {
        let jump = match jump_host {
            Some(jump) => Some(
                self.resolve_single(&jump.host, &jump.username, jump.key_path.as_deref())
                    .await?,
            ),
            None => None,
        };
        let target = self.resolve_single(host, username, explicit_key).await?;
        Ok(ResolvedAuth { target, jump })
    }

    async fn resolve_single(
        &self,
        host: &str,
        username: &str,
        explicit_key: Option<&Path>,
    ) -> Result<AuthOptions> {
        if let Some(socket) = self.config.agent_socket()
            && self.agent.has_identities(&socket).await
        {
            debug!("Using SSH agent for {}@{}", username, host);
            return Ok(AuthOptions::agent(socket));
        }

        let loader = KeyLoader::new(self.prompt.as_ref(), self.secrets.as_ref());

        if let Some(path) = explicit_key {
            let path = expand_tilde(&path.to_string_lossy());
            return Ok(AuthOptions::key(loader.load(&path, host).await?));
        }

        if let Some(path) = self.config.default_key_paths.iter().find(|p| p.exists()) {
            debug!("Using default key {} for {}", path.display(), host);
            return Ok(AuthOptions::key(loader.load(path, host).await?));
        }

        info!(
            "No agent or key available for {}@{}, asking for an auth method",
            username, host
        );
        match self.prompt.prompt_auth_method(host, username).await {
            Some(AuthMethodChoice::Password(password)) if !password.is_empty() => {
                Ok(AuthOptions::password(password))
            }
            Some(AuthMethodChoice::KeyFile(path)) => {
                Ok(AuthOptions::key(loader.load(&path, host).await?))
            }
            Some(AuthMethodChoice::KeyboardInteractive) => Ok(AuthOptions::keyboard_interactive()),
            Some(AuthMethodChoice::Password(_)) | None => Err(SshCoreError::auth(
                host,
                username,
                "no SSH agent, key file or auth method available",
            )),
        }
    }
}
