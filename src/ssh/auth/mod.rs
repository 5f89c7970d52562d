//! Credential resolution and SSH user authentication.
//!
//! - [`AuthResolver`]: picks agent, explicit key, default key or a prompted
//!   method for a `(host, username)`, including the jump host
//! - [`KeyLoader`]: decodes private keys, recovering passphrases from the
//!   [`SecretStore`](crate::ssh::secrets::SecretStore) or a prompt
//! - [`AuthChain`]: applies resolved [`AuthOptions`] to a connected handle,
//!   forwarding keyboard-interactive challenges to the [`PromptProvider`]

mod agent;
mod keys;
mod options;
mod prompt;
mod resolver;
mod strategy;

pub use agent::{AgentProbe, SshAgentProbe};
pub use keys::KeyLoader;
pub use options::{AuthMethod, AuthOptions, LoadedKey};
pub use prompt::{AuthMethodChoice, EnvPromptProvider, NoPrompt, PromptProvider};
pub use resolver::{AuthResolver, ResolvedAuth};
pub use strategy::{AuthChain, AuthStrategy};
