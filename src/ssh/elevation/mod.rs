//! Privilege elevation with method fallback.
//!
//! When a command fails for lack of privileges, the [`ElevationEngine`]
//! retries it through the first usable method:
//!
//! 1. `sudo -n` (NOPASSWD)
//! 2. `doas -n` (nopass)
//! 3. `sudo -S` with the user's password
//! 4. `doas` with the user's password
//! 5. `su` with the root password
//!
//! Every method is checked with `whoami` before it is trusted, and a
//! password is only remembered once that check has printed `root`. Methods
//! that fail stay marked until the cache is cleared.

mod capabilities;
mod engine;
mod method;

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CommandOutput;

pub use capabilities::{CapabilitySummary, ElevationCapabilities};
pub use engine::{ElevatedOutput, ElevationEngine};
pub use method::{ElevatedCommand, ElevationMethod, PRIORITY, PasswordKind, escape_for_shell};

/// Output fragments of a command refused for lack of privileges.
const PERMISSION_DENIED_PATTERNS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "must be root",
    "must be run as root",
    "are you root",
    "requires root",
    "only root can",
    "need to be root",
    "access denied",
    "interactive authentication required",
];

/// Whether a finished command failed for lack of privileges.
pub fn needs_elevation(output: &CommandOutput) -> bool {
    if output.success() {
        return false;
    }
    let text = format!("{}\n{}", output.stderr, output.stdout).to_lowercase();
    PERMISSION_DENIED_PATTERNS.iter().any(|p| text.contains(p))
}

/// Why one elevation method did not run the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The host does not offer it.
    Unavailable,
    /// Marked failed earlier; skipped until the cache is cleared.
    PreviouslyFailed,
    /// No password was supplied.
    Declined,
    WrongPassword,
    /// Verification did not finish in time. Treated like a wrong password.
    TimedOut,
    /// A passwordless method ran but did not yield root.
    Rejected,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttemptOutcome::Unavailable => "not available",
            AttemptOutcome::PreviouslyFailed => "failed earlier",
            AttemptOutcome::Declined => "no password given",
            AttemptOutcome::WrongPassword => "wrong password",
            AttemptOutcome::TimedOut => "timed out",
            AttemptOutcome::Rejected => "did not yield root",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ElevationAttempt {
    pub method: ElevationMethod,
    pub outcome: AttemptOutcome,
}

impl ElevationAttempt {
    pub fn new(method: ElevationMethod, outcome: AttemptOutcome) -> Self {
        Self { method, outcome }
    }
}
