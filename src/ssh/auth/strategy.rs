//! Authentication strategies applied to a freshly connected handle.
//!
//! [`AuthChain::from_options`] turns resolved [`AuthOptions`] into an ordered
//! list of strategies. The first strategy that succeeds ends the chain.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys;
use tracing::debug;

use crate::ssh::client::SshClientHandler;
use crate::ssh::error::SshCoreError;

use super::agent::AgentAuth;
use super::options::{AuthMethod, AuthOptions, LoadedKey};
use super::prompt::PromptProvider;

/// Keyboard-interactive rounds before giving up.
const MAX_CHALLENGE_ROUNDS: usize = 10;

/// One SSH user-auth method.
///
/// * `Ok(true)` - authenticated
/// * `Ok(false)` - credentials rejected
/// * `Err(message)` - the attempt itself failed
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}

pub struct PublicKeyAuth {
    key: LoadedKey,
}

impl PublicKeyAuth {
    pub fn new(key: LoadedKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl AuthStrategy for PublicKeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!(
            "Offering {} key ({}), hash {:?}",
            self.key.algorithm(),
            self.key.comment(),
            hash_alg
        );

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(self.key.key.clone(), hash_alg);
        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "publickey"
    }
}

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Forwards every server challenge to the [`PromptProvider`].
///
/// Rejection before any challenge was shown is `Ok(false)`; rejection after
/// the user answered is an `Err`, so the chain can report an MFA failure.
pub struct KeyboardInteractiveAuth {
    prompt: Arc<dyn PromptProvider>,
}

impl KeyboardInteractiveAuth {
    pub fn new(prompt: Arc<dyn PromptProvider>) -> Self {
        Self { prompt }
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| format!("Keyboard-interactive start failed: {}", e))?;

        let mut answered = false;
        for _ in 0..MAX_CHALLENGE_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } if answered => {
                    return Err("keyboard-interactive challenge failed".to_string());
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    debug!(
                        "Keyboard-interactive round '{}' ({}) with {} prompts",
                        name,
                        instructions,
                        prompts.len()
                    );
                    let texts: Vec<String> = prompts.iter().map(|p| p.prompt.clone()).collect();
                    let responses = if texts.is_empty() {
                        Vec::new()
                    } else {
                        answered = true;
                        self.prompt.prompt_challenge(&texts).await
                    };
                    response = handle
                        .authenticate_keyboard_interactive_respond(responses)
                        .await
                        .map_err(|e| format!("Keyboard-interactive respond failed: {}", e))?;
                }
            }
        }

        Err("keyboard-interactive exceeded the challenge round limit".to_string())
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}

/// Strategies tried in order until one succeeds.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn from_options(options: &AuthOptions, prompt: Arc<dyn PromptProvider>) -> Self {
        let mut strategies: Vec<Box<dyn AuthStrategy>> = Vec::new();
        for method in &options.preferred_auth_order {
            match method {
                AuthMethod::Agent => {
                    if let Some(socket) = &options.agent_socket_path {
                        strategies.push(Box::new(AgentAuth::new(socket.clone())));
                    }
                }
                AuthMethod::PublicKey => {
                    for key in &options.client_keys {
                        strategies.push(Box::new(PublicKeyAuth::new(key.clone())));
                    }
                }
                AuthMethod::Password => {
                    if let Some(password) = &options.password {
                        strategies.push(Box::new(PasswordAuth::new(password.clone())));
                    }
                }
                AuthMethod::KeyboardInteractive => {
                    strategies.push(Box::new(KeyboardInteractiveAuth::new(prompt.clone())));
                }
            }
        }
        Self { strategies }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        host: &str,
        username: &str,
    ) -> Result<(), SshCoreError> {
        if self.strategies.is_empty() {
            return Err(SshCoreError::auth(
                host,
                username,
                "no authentication methods available",
            ));
        }

        let mut last_error = None;
        let mut interactive = false;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authenticated {}@{} via {}", username, host, strategy.name());
                    return Ok(());
                }
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                    interactive = false;
                }
                Err(e) => {
                    debug!("Authentication error with {}: {}", strategy.name(), e);
                    interactive = strategy.name() == "keyboard-interactive";
                    last_error = Some(e);
                }
            }
        }

        Err(SshCoreError::AuthenticationFailed {
            host: host.to_string(),
            user: username.to_string(),
            reason: last_error.unwrap_or_else(|| "all authentication methods failed".to_string()),
            interactive,
        })
    }
}
