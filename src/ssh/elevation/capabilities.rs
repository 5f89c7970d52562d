use std::collections::{HashMap, HashSet};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::method::{ElevationMethod, PRIORITY};
use crate::ssh::error::{Result, SshCoreError};
use crate::ssh::transport::CommandRunner;
use crate::ssh::types::{CommandOutput, ExecRequest};

/// Groups whose members usually hold sudo or doas rights.
const ADMIN_GROUPS: &[&str] = &["sudo", "wheel", "admin"];

/// `sudo -n` / `doas -n` replies that mean the user may not elevate at all.
const NOT_PERMITTED: &[&str] = &[
    "not in the sudoers",
    "may not run sudo",
    "not allowed to",
    "operation not permitted",
];

/// What a host offers for elevation, and what has been learned about it.
#[derive(Clone, Default)]
pub struct ElevationCapabilities {
    pub user: String,
    pub is_root: bool,
    pub groups: Vec<String>,
    pub has_sudo: bool,
    pub sudo_no_password: bool,
    /// `sudo -n` said the user is not a sudoer.
    pub sudo_denied: bool,
    pub has_doas: bool,
    pub doas_no_password: bool,
    pub doas_denied: bool,
    pub has_su: bool,
    pub failed_methods: HashSet<ElevationMethod>,
    pub verified: HashSet<ElevationMethod>,
    cached_passwords: HashMap<ElevationMethod, String>,
}

impl ElevationCapabilities {
    /// Methods the host supports, in priority order, failed ones included.
    pub fn available_methods(&self) -> Vec<ElevationMethod> {
        PRIORITY
            .into_iter()
            .filter(|m| self.is_available(*m))
            .collect()
    }

    pub fn is_available(&self, method: ElevationMethod) -> bool {
        match method {
            ElevationMethod::SudoNoPassword => self.sudo_no_password,
            ElevationMethod::DoasNoPassword => self.doas_no_password,
            ElevationMethod::SudoWithPassword => {
                self.has_sudo && !self.sudo_no_password && !self.sudo_denied
            }
            ElevationMethod::DoasWithPassword => {
                self.has_doas && !self.doas_no_password && !self.doas_denied
            }
            ElevationMethod::Su => self.has_su,
        }
    }

    pub fn in_admin_group(&self) -> bool {
        self.groups.iter().any(|g| ADMIN_GROUPS.contains(&g.as_str()))
    }

    pub fn cached_password(&self, method: ElevationMethod) -> Option<&str> {
        self.cached_passwords.get(&method).map(String::as_str)
    }

    pub(crate) fn cache_password(&mut self, method: ElevationMethod, password: String) {
        self.cached_passwords.insert(method, password);
    }

    /// Drop the cached password and verification without marking the
    /// method failed. The next use verifies again.
    pub(crate) fn forget_password(&mut self, method: ElevationMethod) {
        self.verified.remove(&method);
        self.cached_passwords.remove(&method);
    }

    pub(crate) fn mark_failed(&mut self, method: ElevationMethod) {
        self.failed_methods.insert(method);
        self.verified.remove(&method);
        self.cached_passwords.remove(&method);
    }

    pub fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            user: self.user.clone(),
            is_root: self.is_root,
            groups: self.groups.clone(),
            available_methods: self.available_methods(),
            failed_methods: PRIORITY
                .into_iter()
                .filter(|m| self.failed_methods.contains(m))
                .collect(),
            verified_methods: PRIORITY
                .into_iter()
                .filter(|m| self.verified.contains(m))
                .collect(),
        }
    }
}

impl fmt::Debug for ElevationCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevationCapabilities")
            .field("user", &self.user)
            .field("is_root", &self.is_root)
            .field("groups", &self.groups)
            .field("available", &self.available_methods())
            .field("failed_methods", &self.failed_methods)
            .field("verified", &self.verified)
            .field("cached_passwords", &self.cached_passwords.len())
            .finish()
    }
}

/// Password-free view of a host's capabilities.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilitySummary {
    pub user: String,
    pub is_root: bool,
    pub groups: Vec<String>,
    pub available_methods: Vec<ElevationMethod>,
    pub failed_methods: Vec<ElevationMethod>,
    pub verified_methods: Vec<ElevationMethod>,
}

/// Run one probe. A probe that times out counts as a negative answer.
async fn probe(runner: &dyn CommandRunner, command: &str, request: &ExecRequest) -> Result<Option<CommandOutput>> {
    let request = ExecRequest {
        command: command.to_string(),
        ..request.clone()
    };
    match runner.run(&request).await {
        Ok(output) => Ok(Some(output)),
        Err(SshCoreError::CommandTimeout { .. }) => {
            debug!("Elevation probe '{}' timed out", command);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn succeeded(output: &Option<CommandOutput>) -> bool {
    output.as_ref().is_some_and(CommandOutput::success)
}

fn denied(output: &Option<CommandOutput>) -> bool {
    output.as_ref().is_some_and(|o| {
        let text = format!("{}\n{}", o.stdout, o.stderr).to_lowercase();
        NOT_PERMITTED.iter().any(|p| text.contains(p))
    })
}

/// Probe the host with read-only commands.
///
/// `fallback_user` is used when `whoami` gives nothing.
pub async fn detect(
    runner: &dyn CommandRunner,
    fallback_user: &str,
    template: &ExecRequest,
) -> Result<ElevationCapabilities> {
    let whoami = probe(runner, "whoami", template).await?;
    let user = whoami
        .as_ref()
        .filter(|o| o.success())
        .map(|o| o.stdout.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| fallback_user.to_string());

    let mut caps = ElevationCapabilities {
        is_root: user == "root",
        user,
        ..Default::default()
    };
    if caps.is_root {
        return Ok(caps);
    }

    if let Some(groups) = probe(runner, "groups", template).await?
        && groups.success()
    {
        caps.groups = groups
            .stdout
            .split(|c: char| c.is_whitespace() || c == ':')
            .filter(|g| !g.is_empty() && *g != caps.user)
            .map(str::to_string)
            .collect();
    }

    caps.has_sudo = succeeded(&probe(runner, "command -v sudo", template).await?);
    caps.has_doas = succeeded(&probe(runner, "command -v doas", template).await?);
    caps.has_su = succeeded(&probe(runner, "command -v su", template).await?);

    if caps.has_sudo {
        let reply = probe(runner, "sudo -n true", template).await?;
        caps.sudo_no_password = succeeded(&reply);
        caps.sudo_denied = !caps.sudo_no_password && denied(&reply);
    }
    if caps.has_doas {
        let reply = probe(runner, "doas -n true", template).await?;
        caps.doas_no_password = succeeded(&reply);
        caps.doas_denied = !caps.doas_no_password && denied(&reply);
    }

    debug!("Detected elevation capabilities: {:?}", caps);
    Ok(caps)
}
