//! Prompt callbacks for passphrases, passwords and MFA challenges.

use std::path::PathBuf;

use async_trait::async_trait;

/// Auth method picked by the operator when nothing else is available.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethodChoice {
    Password(String),
    KeyFile(PathBuf),
    KeyboardInteractive,
}

impl std::fmt::Debug for AuthMethodChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethodChoice::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethodChoice::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            AuthMethodChoice::KeyboardInteractive => f.write_str("KeyboardInteractive"),
        }
    }
}

/// User-facing prompt callbacks.
///
/// `None` from [`prompt_secret`](Self::prompt_secret) means the user declined.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    async fn prompt_secret(&self, message: &str) -> Option<String>;

    /// Answer a keyboard-interactive round, one response per prompt.
    async fn prompt_challenge(&self, prompts: &[String]) -> Vec<String>;

    /// Ask which auth method to use when no agent or key is available.
    async fn prompt_auth_method(&self, _host: &str, _username: &str) -> Option<AuthMethodChoice> {
        None
    }
}

/// Declines every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

#[async_trait]
impl PromptProvider for NoPrompt {
    async fn prompt_secret(&self, _message: &str) -> Option<String> {
        None
    }

    async fn prompt_challenge(&self, prompts: &[String]) -> Vec<String> {
        vec![String::new(); prompts.len()]
    }
}

pub const KEY_PASSPHRASE_ENV_VAR: &str = "SSH_KEY_PASSPHRASE";
pub const SUDO_PASSWORD_ENV_VAR: &str = "SSH_SUDO_PASSWORD";
pub const SU_PASSWORD_ENV_VAR: &str = "SSH_SU_PASSWORD";
pub const PASSWORD_ENV_VAR: &str = "SSH_PASSWORD";

/// Non-interactive provider for headless servers.
///
/// Answers from environment variables chosen by the prompt text and declines
/// when the variable is unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvPromptProvider;

impl EnvPromptProvider {
    fn variable_for(message: &str) -> &'static str {
        let lower = message.to_lowercase();
        if lower.contains("passphrase") {
            KEY_PASSPHRASE_ENV_VAR
        } else if lower.contains("root password") {
            SU_PASSWORD_ENV_VAR
        } else {
            SUDO_PASSWORD_ENV_VAR
        }
    }

    fn read(var: &str) -> Option<String> {
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl PromptProvider for EnvPromptProvider {
    async fn prompt_secret(&self, message: &str) -> Option<String> {
        Self::read(Self::variable_for(message))
    }

    async fn prompt_challenge(&self, prompts: &[String]) -> Vec<String> {
        // Only password-shaped challenges can be answered without a human.
        prompts
            .iter()
            .map(|p| {
                if p.to_lowercase().contains("password") {
                    Self::read(PASSWORD_ENV_VAR).unwrap_or_default()
                } else {
                    String::new()
                }
            })
            .collect()
    }

    async fn prompt_auth_method(&self, _host: &str, _username: &str) -> Option<AuthMethodChoice> {
        Self::read(PASSWORD_ENV_VAR).map(AuthMethodChoice::Password)
    }
}
