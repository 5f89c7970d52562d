use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ssh::types::ExecRequest;

/// Privilege elevation methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ElevationMethod {
    #[serde(rename = "sudo")]
    SudoNoPassword,
    #[serde(rename = "doas")]
    DoasNoPassword,
    SudoWithPassword,
    DoasWithPassword,
    Su,
}

/// Fallback order. `su` comes last: it needs the root password, a separate
/// credential from the user's own.
pub const PRIORITY: [ElevationMethod; 5] = [
    ElevationMethod::SudoNoPassword,
    ElevationMethod::DoasNoPassword,
    ElevationMethod::SudoWithPassword,
    ElevationMethod::DoasWithPassword,
    ElevationMethod::Su,
];

/// Which password a method needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordKind {
    /// The login user's own password (sudo, doas).
    User,
    /// The root password (su).
    Root,
}

impl PasswordKind {
    pub fn namespace(&self) -> &'static str {
        match self {
            PasswordKind::User => "user",
            PasswordKind::Root => "root",
        }
    }
}

impl ElevationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElevationMethod::SudoNoPassword => "sudo",
            ElevationMethod::DoasNoPassword => "doas",
            ElevationMethod::SudoWithPassword => "sudo_with_password",
            ElevationMethod::DoasWithPassword => "doas_with_password",
            ElevationMethod::Su => "su",
        }
    }

    pub fn password_kind(&self) -> Option<PasswordKind> {
        match self {
            ElevationMethod::SudoNoPassword | ElevationMethod::DoasNoPassword => None,
            ElevationMethod::SudoWithPassword | ElevationMethod::DoasWithPassword => {
                Some(PasswordKind::User)
            }
            ElevationMethod::Su => Some(PasswordKind::Root),
        }
    }

    pub fn needs_password(&self) -> bool {
        self.password_kind().is_some()
    }

    /// The binary that performs the elevation.
    pub fn program(&self) -> &'static str {
        match self {
            ElevationMethod::SudoNoPassword | ElevationMethod::SudoWithPassword => "sudo",
            ElevationMethod::DoasNoPassword | ElevationMethod::DoasWithPassword => "doas",
            ElevationMethod::Su => "su",
        }
    }

    /// Wrap `command` for this method. The password, if any, travels on stdin.
    pub fn build(&self, command: &str, password: Option<&str>) -> ElevatedCommand {
        let escaped = escape_for_shell(command);
        let stdin = password.map(|p| format!("{}\n", p));
        match self {
            ElevationMethod::SudoNoPassword => ElevatedCommand {
                command: format!("sudo -n sh -c '{}'", escaped),
                stdin: None,
                pty: false,
            },
            ElevationMethod::DoasNoPassword => ElevatedCommand {
                command: format!("doas -n sh -c '{}'", escaped),
                stdin: None,
                pty: false,
            },
            ElevationMethod::SudoWithPassword => ElevatedCommand {
                command: format!("sudo -S -p '' sh -c '{}'", escaped),
                stdin,
                pty: false,
            },
            // doas and su read the password from the terminal.
            ElevationMethod::DoasWithPassword => ElevatedCommand {
                command: format!("doas sh -c '{}'", escaped),
                stdin,
                pty: true,
            },
            ElevationMethod::Su => ElevatedCommand {
                command: format!("su root -c '{}'", escaped),
                stdin,
                pty: true,
            },
        }
    }
}

impl fmt::Display for ElevationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An elevated command ready to run.
#[derive(Clone)]
pub struct ElevatedCommand {
    pub command: String,
    pub stdin: Option<String>,
    pub pty: bool,
}

impl ElevatedCommand {
    pub fn to_request(&self, timeout: Duration) -> ExecRequest {
        ExecRequest {
            command: self.command.clone(),
            timeout,
            stdin: self.stdin.clone(),
            pty: self.pty,
        }
    }
}

impl fmt::Debug for ElevatedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevatedCommand")
            .field("command", &self.command)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("pty", &self.pty)
            .finish()
    }
}

/// Escape for a single-quoted shell context.
pub fn escape_for_shell(s: &str) -> String {
    s.replace('\'', "'\"'\"'")
}

/// Strip terminal noise from PTY output: CRs and password prompt lines.
pub fn clean_pty_output(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "")
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let lower = trimmed.to_lowercase();
            if lower.contains("password") && trimmed.ends_with(':') {
                return None;
            }
            match trimmed.find(':') {
                Some(idx) if lower[..idx].contains("password") => {
                    Some(trimmed[idx + 1..].trim_start().to_string())
                }
                _ => Some(line.to_string()),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod builders {
        use super::*;

        #[test]
        fn test_nopasswd_methods_are_non_interactive() {
            let sudo = ElevationMethod::SudoNoPassword.build("systemctl status nginx", None);
            assert_eq!(sudo.command, "sudo -n sh -c 'systemctl status nginx'");
            assert!(sudo.stdin.is_none());
            assert!(!sudo.pty);

            let doas = ElevationMethod::DoasNoPassword.build("id", None);
            assert_eq!(doas.command, "doas -n sh -c 'id'");
        }

        #[test]
        fn test_password_never_in_command_line() {
            for method in [
                ElevationMethod::SudoWithPassword,
                ElevationMethod::DoasWithPassword,
                ElevationMethod::Su,
            ] {
                let built = method.build("whoami", Some("s3cret"));
                assert!(!built.command.contains("s3cret"), "{method}");
                assert_eq!(built.stdin.as_deref(), Some("s3cret\n"));
            }
        }

        #[test]
        fn test_terminal_methods_request_pty() {
            assert!(!ElevationMethod::SudoWithPassword.build("x", Some("p")).pty);
            assert!(ElevationMethod::DoasWithPassword.build("x", Some("p")).pty);
            assert!(ElevationMethod::Su.build("x", Some("p")).pty);
            assert_eq!(
                ElevationMethod::Su.build("whoami", Some("p")).command,
                "su root -c 'whoami'"
            );
        }

        #[test]
        fn test_quotes_are_escaped() {
            let built = ElevationMethod::SudoNoPassword.build("echo 'hi'", None);
            assert_eq!(built.command, "sudo -n sh -c 'echo '\"'\"'hi'\"'\"''");
        }

        #[test]
        fn test_debug_redacts_stdin() {
            let built = ElevationMethod::Su.build("whoami", Some("rootpw"));
            assert!(!format!("{:?}", built).contains("rootpw"));
        }
    }

    mod metadata {
        use super::*;

        #[test]
        fn test_priority_order() {
            let names: Vec<_> = PRIORITY.iter().map(|m| m.as_str()).collect();
            assert_eq!(
                names,
                vec!["sudo", "doas", "sudo_with_password", "doas_with_password", "su"]
            );
        }

        #[test]
        fn test_su_uses_root_namespace() {
            assert_eq!(ElevationMethod::Su.password_kind(), Some(PasswordKind::Root));
            assert_eq!(
                ElevationMethod::SudoWithPassword.password_kind(),
                Some(PasswordKind::User)
            );
            assert!(!ElevationMethod::DoasNoPassword.needs_password());
        }

        #[test]
        fn test_serde_names_match_display() {
            for method in PRIORITY {
                let json = serde_json::to_string(&method).unwrap();
                assert_eq!(json, format!("\"{}\"", method));
            }
        }
    }

    mod pty_output {
        use super::*;

        #[test]
        fn test_strips_prompt_line_and_crs() {
            assert_eq!(clean_pty_output("Password: \r\nroot\r\n"), "root");
        }

        #[test]
        fn test_strips_prompt_prefix_on_same_line() {
            assert_eq!(clean_pty_output("Password: root\r\n"), "root");
            assert_eq!(
                clean_pty_output("doas (deploy@db-01) password: \r\nroot"),
                "root"
            );
        }

        #[test]
        fn test_keeps_ordinary_output() {
            assert_eq!(clean_pty_output("a\r\nb: c\r\n"), "a\nb: c");
        }
    }
}
