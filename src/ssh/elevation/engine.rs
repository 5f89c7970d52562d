use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::capabilities::{CapabilitySummary, ElevationCapabilities, detect};
use super::method::{ElevationMethod, PRIORITY, clean_pty_output};
use super::{AttemptOutcome, ElevationAttempt};
use crate::ssh::auth::PromptProvider;
use crate::ssh::config::ElevationConfig;
use crate::ssh::error::{Result, SshCoreError};
use crate::ssh::secrets::{self, SecretStore};
use crate::ssh::transport::CommandRunner;
use crate::ssh::types::{CommandOutput, ConnectionKey, ExecRequest};

/// Replies of an elevation tool rejecting the password it was given.
const AUTH_FAILURE_PATTERNS: &[&str] = &[
    "incorrect password",
    "sorry, try again",
    "authentication failure",
    "authentication failed",
    "a password is required",
];

/// Output of a command run through elevation.
#[derive(Debug, Clone)]
pub struct ElevatedOutput {
    pub output: CommandOutput,
    /// `None` when the login user already was root.
    pub method: Option<ElevationMethod>,
}

type HostCache = Arc<Mutex<Option<ElevationCapabilities>>>;

/// Runs commands with elevated privileges, falling back through methods.
///
/// Capabilities are detected once per connection key and cached. All
/// elevation on one key is serialized, so a password is asked for at most
/// once even when several commands need it at the same time.
pub struct ElevationEngine {
    config: ElevationConfig,
    prompt: Arc<dyn PromptProvider>,
    secrets: Arc<dyn SecretStore>,
    hosts: DashMap<ConnectionKey, HostCache>,
}

impl ElevationEngine {
    pub fn new(
        config: ElevationConfig,
        prompt: Arc<dyn PromptProvider>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            config,
            prompt,
            secrets,
            hosts: DashMap::new(),
        }
    }

    fn host_cache(&self, key: &ConnectionKey) -> HostCache {
        self.hosts.entry(key.clone()).or_default().clone()
    }

    /// Drop a key whose detection never completed, unless another caller
    /// is using it.
    fn release_undetected(&self, key: &ConnectionKey) {
        self.hosts.remove_if(key, |_, cache| {
            Arc::strong_count(cache) == 1 && cache.try_lock().is_ok_and(|caps| caps.is_none())
        });
    }

    /// Forget detected capabilities and failed methods, for one host or all.
    ///
    /// Stored passwords are kept; they are re-verified before the next use.
    pub fn clear_cache(&self, host: Option<&str>) -> usize {
        let before = self.hosts.len();
        match host {
            Some(host) => self.hosts.retain(|key, _| key.host != host),
            None => self.hosts.clear(),
        }
        let cleared = before - self.hosts.len();
        info!(
            "Cleared elevation cache for {} ({} entries)",
            host.unwrap_or("all hosts"),
            cleared
        );
        cleared
    }

    /// Cached capabilities of a key, if detected and not busy.
    pub fn capabilities(&self, key: &ConnectionKey) -> Option<CapabilitySummary> {
        let cache = self.hosts.get(key)?.clone();
        let guard = cache.try_lock().ok()?;
        guard.as_ref().map(ElevationCapabilities::summary)
    }

    /// Run `command` elevated on `runner`.
    ///
    /// Methods are tried in [`PRIORITY`] order, skipping ones the host lacks
    /// and ones that already failed. Each method is verified with `whoami`
    /// before it runs the command; a password is cached only after that check
    /// returns `root`. The original command is then run once and its output
    /// returned.
    pub async fn execute(
        &self,
        key: &ConnectionKey,
        runner: &dyn CommandRunner,
        command: &str,
        timeout: Duration,
    ) -> Result<ElevatedOutput> {
        let cache = self.host_cache(key);
        let mut guard = cache.lock().await;

        let caps = match guard.take() {
            Some(caps) => caps,
            None => {
                let probe = ExecRequest::new("", self.config.detect_timeout);
                match detect(runner, &key.username, &probe).await {
                    Ok(caps) => caps,
                    Err(e) => {
                        drop(guard);
                        drop(cache);
                        self.release_undetected(key);
                        return Err(e);
                    }
                }
            }
        };
        let caps = guard.insert(caps);

        if caps.is_root {
            debug!("Already root on {}, running directly", key);
            let output = runner.run(&ExecRequest::new(command, timeout)).await?;
            return Ok(ElevatedOutput {
                output,
                method: None,
            });
        }

        let mut attempts = Vec::new();
        for method in PRIORITY {
            if !caps.is_available(method) {
                attempts.push(ElevationAttempt::new(method, AttemptOutcome::Unavailable));
                continue;
            }
            if caps.failed_methods.contains(&method) {
                attempts.push(ElevationAttempt::new(method, AttemptOutcome::PreviouslyFailed));
                continue;
            }

            let password = match self.password_for(key, caps, method).await {
                Ok(password) => password,
                Err(outcome) => {
                    attempts.push(ElevationAttempt::new(method, outcome));
                    continue;
                }
            };

            if !caps.verified.contains(&method)
                && let Err(outcome) = self.verify(key, runner, caps, method, password.as_deref()).await?
            {
                attempts.push(ElevationAttempt::new(method, outcome));
                continue;
            }

            let elevated = method.build(command, password.as_deref());
            let mut output = runner.run(&elevated.to_request(timeout)).await?;
            if elevated.pty {
                output.stdout = clean_pty_output(&output.stdout);
            }
            // The command ran; its output is returned as is. A password the
            // tool itself rejected is dropped so the next call verifies again.
            if password.is_some()
                && !output.success()
                && tool_rejected_password(&output, method, elevated.pty)
            {
                warn!("{} on {} rejected a cached password", method, key);
                caps.forget_password(method);
                self.secrets
                    .delete(&secret_name(key, method, &caps.user))
                    .await;
            }

            info!("Ran command on {} with {}", key, method);
            return Ok(ElevatedOutput {
                output,
                method: Some(method),
            });
        }

        warn!("No elevation method left on {}: {:?}", key, attempts);
        Err(SshCoreError::ElevationUnavailable {
            host: key.host.clone(),
            attempts,
        })
    }

    /// The password a method needs: memory, then the secret store, then the
    /// operator. `Err` when the operator declines.
    async fn password_for(
        &self,
        key: &ConnectionKey,
        caps: &ElevationCapabilities,
        method: ElevationMethod,
    ) -> std::result::Result<Option<String>, AttemptOutcome> {
        let Some(kind) = method.password_kind() else {
            return Ok(None);
        };
        if let Some(cached) = caps.cached_password(method) {
            return Ok(Some(cached.to_string()));
        }

        let name = secret_name(key, method, &caps.user);
        if let Some(stored) = self.secrets.get(&name).await {
            debug!("Using stored {} password for {}", kind.namespace(), key);
            return Ok(Some(stored));
        }

        let message = match method {
            ElevationMethod::Su => format!("Enter root password for su on {}:", key.host),
            _ => format!(
                "Enter password for {}@{} ({}):",
                caps.user, key.host, method
            ),
        };
        match self.prompt.prompt_secret(&message).await {
            Some(password) if !password.is_empty() => Ok(Some(password)),
            _ => {
                debug!("Operator declined the {} password for {}", method, key);
                Err(AttemptOutcome::Declined)
            }
        }
    }

    /// Run `whoami` through the method. `Ok(Err(_))` is a failed check;
    /// the outer `Err` is a connection failure.
    async fn verify(
        &self,
        key: &ConnectionKey,
        runner: &dyn CommandRunner,
        caps: &mut ElevationCapabilities,
        method: ElevationMethod,
        password: Option<&str>,
    ) -> Result<std::result::Result<(), AttemptOutcome>> {
        let check = method.build("whoami", password);
        let outcome = match runner.run(&check.to_request(self.config.verify_timeout)).await {
            Ok(output) if output.success() && verified_root(&output, check.pty) => None,
            Ok(output) => {
                debug!(
                    "{} verification on {} failed (exit {}): {}",
                    method,
                    key,
                    output.exit_code,
                    output.stderr.trim()
                );
                Some(if method.needs_password() {
                    AttemptOutcome::WrongPassword
                } else {
                    AttemptOutcome::Rejected
                })
            }
            Err(SshCoreError::CommandTimeout { .. }) => Some(AttemptOutcome::TimedOut),
            Err(e) => return Err(e),
        };

        if let Some(outcome) = outcome {
            self.forget(key, caps, method).await;
            return Ok(Err(outcome));
        }

        caps.verified.insert(method);
        if let Some(password) = password {
            caps.cache_password(method, password.to_string());
            self.secrets
                .set(&secret_name(key, method, &caps.user), password)
                .await;
        }
        debug!("Verified {} on {}", method, key);
        Ok(Ok(()))
    }

    async fn forget(&self, key: &ConnectionKey, caps: &mut ElevationCapabilities, method: ElevationMethod) {
        caps.mark_failed(method);
        if method.needs_password() {
            self.secrets.delete(&secret_name(key, method, &caps.user)).await;
        }
    }
}

fn secret_name(key: &ConnectionKey, method: ElevationMethod, user: &str) -> String {
    let namespace = method.password_kind().map(|k| k.namespace()).unwrap_or("none");
    secrets::elevation_password(namespace, user, &key.host, key.port)
}

fn verified_root(output: &CommandOutput, pty: bool) -> bool {
    let stdout = if pty {
        clean_pty_output(&output.stdout)
    } else {
        output.stdout.clone()
    };
    stdout.trim() == "root"
}

/// Only lines written by the elevation tool (`sudo: ...`, `su: ...`) count;
/// the command's own output never does. A PTY merges stderr into stdout.
fn tool_rejected_password(output: &CommandOutput, method: ElevationMethod, pty: bool) -> bool {
    let text = if pty { &output.stdout } else { &output.stderr };
    let prefix = format!("{}:", method.program());
    text.lines()
        .map(|line| line.trim().to_lowercase())
        .filter(|line| line.starts_with(&prefix))
        .any(|line| AUTH_FAILURE_PATTERNS.iter().any(|p| line.contains(p)))
}
