//! Command execution with retry, circuit breaking and elevation hand-off.
//!
//! ## Execution Flow
//!
//! 1. **Validation**: empty commands, empty hosts and bad ports are rejected
//!    before the breaker or the network is touched.
//!
//! 2. **Circuit gate**: an open circuit fails fast with `CircuitOpen`. No
//!    connection is attempted.
//!
//! 3. **Retry loop** (`backon`): get a pooled connection and run the command.
//!    Transient failures invalidate the entry and back off
//!    `retry_delay * 2^attempt`, capped at `max_delay`, for at most
//!    `max_retries` attempts in total. Permanent failures return at once.
//!
//! 4. **Elevation**: a permission-denied result is handed to the
//!    [`ElevationEngine`] on the same connection.
//!
//! 5. **Breaker feedback**: success closes the circuit; failures that say
//!    something about the host's health count against it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RetryConfig;
use super::elevation::{ElevationEngine, ElevationMethod, needs_elevation};
use super::error::{Result, SshCoreError};
use super::pool::{ConnectionEntry, ConnectionPool};
use super::types::{CommandOutput, ExecRequest, HostTarget};

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Command timeout; `None` uses the configured default.
    pub timeout: Option<Duration>,
    /// Retry permission-denied failures through elevation.
    pub elevate: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            elevate: true,
            cancel: None,
        }
    }
}

/// Outcome of a successful execution. The command itself may have failed.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: CommandOutput,
    pub elevated_with: Option<ElevationMethod>,
    /// Attempts made, including the first.
    pub attempts: u32,
}

pub struct ExecutionEngine {
    pool: Arc<ConnectionPool>,
    elevation: Arc<ElevationEngine>,
    retry: RetryConfig,
    command_timeout: Duration,
}

impl ExecutionEngine {
    pub fn new(
        pool: Arc<ConnectionPool>,
        elevation: Arc<ElevationEngine>,
        retry: RetryConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            elevation,
            retry,
            command_timeout,
        }
    }

    pub async fn execute(
        &self,
        target: &HostTarget,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult> {
        if command.trim().is_empty() {
            return Err(SshCoreError::invalid_input("command cannot be empty"));
        }
        target.validate()?;
        let timeout = options.timeout.unwrap_or(self.command_timeout);
        if timeout.is_zero() {
            return Err(SshCoreError::invalid_input("timeout must be greater than zero"));
        }
        let cancel = options.cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(SshCoreError::Cancelled);
        }

        let circuits = self.pool.circuits();
        circuits.acquire(&target.host)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Execution on {} cancelled", target.host);
                Err(SshCoreError::Cancelled)
            }
            result = self.run(target, command, timeout, options.elevate) => result,
        };

        match &result {
            Ok(_) | Err(SshCoreError::ElevationUnavailable { .. }) => {
                circuits.record_success(&target.host)
            }
            Err(e) if e.counts_against_host() => circuits.record_failure(&target.host),
            Err(_) => {}
        }
        result
    }

    async fn run(
        &self,
        target: &HostTarget,
        command: &str,
        timeout: Duration,
        elevate: bool,
    ) -> Result<ExecutionResult> {
        let (output, entry, attempts) = self.run_with_retry(target, command, timeout).await?;

        if !elevate || !needs_elevation(&output) {
            return Ok(ExecutionResult {
                output,
                elevated_with: None,
                attempts,
            });
        }

        info!(
            "Command on {} was denied (exit {}), trying elevation",
            target.host, output.exit_code
        );
        match self
            .elevation
            .execute(entry.key(), entry.as_ref(), command, timeout)
            .await
        {
            Ok(elevated) => Ok(ExecutionResult {
                output: elevated.output,
                elevated_with: elevated.method,
                attempts,
            }),
            Err(e) => {
                if e.is_transient() {
                    self.pool.invalidate(&entry).await;
                }
                Err(e)
            }
        }
    }

    /// One attempt. A transient failure drops the entry so the next attempt
    /// reconnects.
    async fn attempt(
        &self,
        target: &HostTarget,
        request: &ExecRequest,
    ) -> Result<(CommandOutput, Arc<ConnectionEntry>)> {
        let entry = self.pool.get_connection(target).await?;
        match entry.exec(request).await {
            Ok(output) => Ok((output, entry)),
            Err(e) => {
                if e.is_transient() {
                    self.pool.invalidate(&entry).await;
                }
                Err(e)
            }
        }
    }

    async fn run_with_retry(
        &self,
        target: &HostTarget,
        command: &str,
        timeout: Duration,
    ) -> Result<(CommandOutput, Arc<ConnectionEntry>, u32)> {
        let attempt_counter = AtomicU32::new(0);
        let request = ExecRequest::new(command, timeout);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry.retry_delay)
            .with_max_delay(self.retry.max_delay)
            .with_factor(2.0)
            .with_max_times(self.retry.max_retries.saturating_sub(1) as usize);

        let result = (|| async {
            let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if attempt > 0 {
                debug!("Attempt {} on {}", attempt + 1, target.host);
            }

            self.attempt(target, &request).await
        })
        .retry(backoff)
        .when(|e: &SshCoreError| {
            if !e.is_transient() {
                debug!("Not retrying {}: {}", target.host, e);
            }
            e.is_transient()
        })
        .notify(|err, dur| {
            warn!(
                "Command on {} failed: {}. Retrying in {:?}",
                target.host, err, dur
            );
        })
        .await;

        let attempts = attempt_counter.load(Ordering::SeqCst);
        match result {
            Ok((output, entry)) => {
                if attempts > 1 {
                    info!(
                        "Command on {} succeeded after {} attempt(s)",
                        target.host, attempts
                    );
                }
                Ok((output, entry, attempts))
            }
            Err(e) => {
                error!(
                    "Command on {} failed after {} attempt(s). Last error: {}",
                    target.host, attempts, e
                );
                Err(e)
            }
        }
    }
}
