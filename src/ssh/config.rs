//! Configuration resolution for the connection core.
//!
//! Values follow a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_COMMAND_TIMEOUT` | 180s | Command execution timeout in seconds |
//! | `SSH_MAX_RETRIES` | 3 | Total attempts per execution |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Backoff base in milliseconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_POOL_MAX_CONNECTIONS` | 50 | Pool capacity |
//! | `SSH_POOL_IDLE_TIMEOUT` | 300s | Idle timeout per pooled connection |
//! | `SSH_CIRCUIT_THRESHOLD` | 5 | Consecutive failures before a circuit opens |
//! | `SSH_CIRCUIT_COOLDOWN` | 60s | Time an open circuit blocks attempts |
//! | `SSH_ELEVATION_VERIFY_TIMEOUT` | 10s | Timeout of the elevation `whoami` probe |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default SSH connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default SSH command execution timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Default number of execution attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry delay in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default pool capacity
pub const DEFAULT_POOL_MAX_CONNECTIONS: usize = 50;

/// Default idle timeout for pooled connections in seconds
pub const DEFAULT_POOL_IDLE_TIMEOUT_SECS: u64 = 300;

/// How often the binaries sweep idle connections.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default consecutive failures before a circuit opens
pub const DEFAULT_CIRCUIT_THRESHOLD: u32 = 5;

/// Default circuit cool-down in seconds
pub const DEFAULT_CIRCUIT_COOLDOWN_SECS: u64 = 60;

/// Default elevation verification timeout in seconds
pub const DEFAULT_ELEVATION_VERIFY_TIMEOUT_SECS: u64 = 10;

/// Bounded wait when closing a jump-host tunnel
pub const JUMP_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";
pub const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub const POOL_MAX_CONNECTIONS_ENV_VAR: &str = "SSH_POOL_MAX_CONNECTIONS";
pub const POOL_IDLE_TIMEOUT_ENV_VAR: &str = "SSH_POOL_IDLE_TIMEOUT";
pub const CIRCUIT_THRESHOLD_ENV_VAR: &str = "SSH_CIRCUIT_THRESHOLD";
pub const CIRCUIT_COOLDOWN_ENV_VAR: &str = "SSH_CIRCUIT_COOLDOWN";
pub const ELEVATION_VERIFY_TIMEOUT_ENV_VAR: &str = "SSH_ELEVATION_VERIFY_TIMEOUT";

/// Parameter, then parsed env var, then default. Unparseable env values are ignored.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    ))
}

pub fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

/// Compression: parameter, then env ("true"/"1" enable), then enabled.
pub fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

pub fn resolve_pool_max_connections(param: Option<usize>) -> usize {
    resolve(
        param,
        POOL_MAX_CONNECTIONS_ENV_VAR,
        DEFAULT_POOL_MAX_CONNECTIONS,
    )
    .max(1)
}

pub fn resolve_pool_idle_timeout(param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        param,
        POOL_IDLE_TIMEOUT_ENV_VAR,
        DEFAULT_POOL_IDLE_TIMEOUT_SECS,
    ))
}

pub fn resolve_circuit_threshold(param: Option<u32>) -> u32 {
    resolve(param, CIRCUIT_THRESHOLD_ENV_VAR, DEFAULT_CIRCUIT_THRESHOLD).max(1)
}

pub fn resolve_circuit_cooldown(param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        param,
        CIRCUIT_COOLDOWN_ENV_VAR,
        DEFAULT_CIRCUIT_COOLDOWN_SECS,
    ))
}

pub fn resolve_elevation_verify_timeout(param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        param,
        ELEVATION_VERIFY_TIMEOUT_ENV_VAR,
        DEFAULT_ELEVATION_VERIFY_TIMEOUT_SECS,
    ))
}

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_POOL_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Retry settings for [`ExecutionEngine`](super::execution::ExecutionEngine).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    /// Backoff base: attempt `n` (0-based) sleeps `retry_delay * 2^n`.
    pub retry_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_delay: MAX_RETRY_DELAY,
        }
    }
}

/// Circuit breaker settings, shared by every per-host breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_THRESHOLD,
            cooldown: Duration::from_secs(DEFAULT_CIRCUIT_COOLDOWN_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElevationConfig {
    pub verify_timeout: Duration,
    /// Timeout for the read-only capability probes.
    pub detect_timeout: Duration,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            verify_timeout: Duration::from_secs(DEFAULT_ELEVATION_VERIFY_TIMEOUT_SECS),
            detect_timeout: Duration::from_secs(DEFAULT_ELEVATION_VERIFY_TIMEOUT_SECS),
        }
    }
}

/// Credential discovery settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Agent socket; `None` means "use `SSH_AUTH_SOCK` if set".
    pub agent_socket: Option<PathBuf>,
    /// Conventional key locations probed in order.
    pub default_key_paths: Vec<PathBuf>,
    pub compression: bool,
}

impl AuthConfig {
    /// Agent socket from config or `SSH_AUTH_SOCK`.
    pub fn agent_socket(&self) -> Option<PathBuf> {
        self.agent_socket.clone().or_else(|| {
            env::var_os("SSH_AUTH_SOCK")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            agent_socket: None,
            default_key_paths: default_key_paths(),
            compression: true,
        }
    }
}

/// `~/.ssh/id_ed25519`, `~/.ssh/id_ecdsa`, `~/.ssh/id_rsa`, in that order.
pub fn default_key_paths() -> Vec<PathBuf> {
    match dirs::home_dir() {
        Some(home) => ["id_ed25519", "id_ecdsa", "id_rsa"]
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .collect(),
        None => Vec::new(),
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    PathBuf::from(path)
}

/// All settings of the core, assembled by the composition root.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub elevation: ElevationConfig,
    pub auth: AuthConfig,
    pub command_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            elevation: ElevationConfig::default(),
            auth: AuthConfig::default(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

impl CoreConfig {
    /// Resolve every knob from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            pool: PoolConfig {
                max_connections: resolve_pool_max_connections(None),
                idle_timeout: resolve_pool_idle_timeout(None),
                connect_timeout: resolve_connect_timeout(None),
            },
            retry: RetryConfig {
                max_retries: resolve_max_retries(None),
                retry_delay: resolve_retry_delay(None),
                max_delay: MAX_RETRY_DELAY,
            },
            circuit: CircuitConfig {
                failure_threshold: resolve_circuit_threshold(None),
                cooldown: resolve_circuit_cooldown(None),
            },
            elevation: ElevationConfig {
                verify_timeout: resolve_elevation_verify_timeout(None),
                ..ElevationConfig::default()
            },
            auth: AuthConfig {
                compression: resolve_compression(None),
                ..AuthConfig::default()
            },
            command_timeout: resolve_command_timeout(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Serialises env var tests to avoid races between test threads
    pub(crate) static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX.
    unsafe fn set_env(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX.
    unsafe fn remove_env(key: &str) {
        unsafe { env::remove_var(key) };
    }

    mod config_resolution {
        use super::*;

        mod connect_timeout {
            use super::*;

            #[test]
            fn test_uses_param_when_provided() {
                assert_eq!(resolve_connect_timeout(Some(60)), Duration::from_secs(60));
            }

            #[test]
            fn test_param_takes_priority_over_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "120") };
                let result = resolve_connect_timeout(Some(45));
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
                assert_eq!(result, Duration::from_secs(45));
            }

            #[test]
            fn test_uses_env_var_when_no_param() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "90") };
                let result = resolve_connect_timeout(None);
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
                assert_eq!(result, Duration::from_secs(90));
            }

            #[test]
            fn test_ignores_invalid_env_var() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "-10") };
                let result = resolve_connect_timeout(None);
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
                assert_eq!(result, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
            }
        }

        mod retries {
            use super::*;

            #[test]
            fn test_zero_retries_is_valid_param() {
                assert_eq!(resolve_max_retries(Some(0)), 0);
            }

            #[test]
            fn test_retry_delay_from_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(RETRY_DELAY_MS_ENV_VAR, "250") };
                let result = resolve_retry_delay(None);
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(RETRY_DELAY_MS_ENV_VAR) };
                assert_eq!(result, Duration::from_millis(250));
            }

            #[test]
            fn test_max_retry_delay_is_reasonable() {
                assert!(MAX_RETRY_DELAY.as_secs() >= 5);
                assert!(MAX_RETRY_DELAY.as_secs() <= 60);
            }
        }

        mod pool_and_circuit {
            use super::*;

            #[test]
            fn test_pool_capacity_never_zero() {
                assert_eq!(resolve_pool_max_connections(Some(0)), 1);
            }

            #[test]
            fn test_circuit_threshold_from_env() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(CIRCUIT_THRESHOLD_ENV_VAR, "7") };
                let result = resolve_circuit_threshold(None);
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(CIRCUIT_THRESHOLD_ENV_VAR) };
                assert_eq!(result, 7);
            }

            #[test]
            fn test_circuit_cooldown_default() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(CIRCUIT_COOLDOWN_ENV_VAR) };
                assert_eq!(resolve_circuit_cooldown(None), Duration::from_secs(60));
            }
        }

        mod compression {
            use super::*;

            #[test]
            fn test_param_false_wins() {
                assert!(!resolve_compression(Some(false)));
            }

            #[test]
            fn test_env_var_one_enables() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(COMPRESSION_ENV_VAR, "1") };
                let result = resolve_compression(None);
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(COMPRESSION_ENV_VAR) };
                assert!(result);
            }

            #[test]
            fn test_env_var_random_value_is_false() {
                let _guard = ENV_TEST_MUTEX.lock().unwrap();
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { set_env(COMPRESSION_ENV_VAR, "yes") };
                let result = resolve_compression(None);
                // SAFETY: Holding ENV_TEST_MUTEX
                unsafe { remove_env(COMPRESSION_ENV_VAR) };
                assert!(!result);
            }
        }
    }

    mod paths {
        use super::*;

        #[test]
        fn test_expand_tilde_leaves_absolute_paths() {
            assert_eq!(expand_tilde("/etc/ssh/key"), PathBuf::from("/etc/ssh/key"));
        }

        #[test]
        fn test_expand_tilde_uses_home() {
            if let Some(home) = dirs::home_dir() {
                assert_eq!(expand_tilde("~/.ssh/id_rsa"), home.join(".ssh/id_rsa"));
            }
        }

        #[test]
        fn test_default_key_order() {
            let names: Vec<_> = default_key_paths()
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect();
            if !names.is_empty() {
                assert_eq!(names, vec!["id_ed25519", "id_ecdsa", "id_rsa"]);
            }
        }
    }
}
