//! Bounded retry for safety-critical STM state.
//!
//! A bias is only trusted once the controller reads it back. Each attempt
//! re-issues the request and re-reads the value; transient failures
//! (a mismatched or non-numeric readback, a rejected command) are retried
//! with a fixed delay, while a lost connection ends the loop immediately.

use crate::config::SafetyConfig;
use crate::error::{AppResult, PpError};
use crate::instrument::{InstrumentKind, Stm};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl From<&SafetyConfig> for RetryPolicy {
    fn from(safety: &SafetyConfig) -> Self {
        Self {
            max_attempts: safety.max_bias_attempts.max(1),
            backoff_delay: safety.bias_retry_delay,
        }
    }
}

/// How a requested bias is confirmed.
#[derive(Clone, Debug, PartialEq)]
pub struct BiasConfirmation {
    pub policy: RetryPolicy,
    /// Largest accepted |readback - target|.
    pub tolerance: f64,
    /// Wait between request and readback.
    pub readback_delay: Duration,
}

impl BiasConfirmation {
    /// Requests `target` until a readback matches it.
    ///
    /// Returns the number of attempts used. Exhausting the policy yields
    /// [`PpError::BiasUnconfirmed`] with `tip_frozen` unset, since only the
    /// caller knows the tip state; a transport failure is returned as is.
    pub async fn confirm(&self, stm: &mut dyn Stm, target: f64) -> AppResult<u32> {
        let mut last_reading = None;

        for attempt in 1..=self.policy.max_attempts {
            let requested = stm
                .set_bias(target)
                .await
                .expected("STM bias not set.")
                .advisory(InstrumentKind::Stm)?;

            if requested.succeeded() {
                sleep(self.readback_delay).await;
                let reading = stm
                    .get_bias()
                    .await
                    .expected("STM bias readback failed.")
                    .advisory(InstrumentKind::Stm)?
                    .into_value();

                if let Some(value) = reading {
                    if (value - target).abs() <= self.tolerance {
                        info!(target, attempt, "STM bias confirmed");
                        return Ok(attempt);
                    }
                    last_reading = Some(value);
                }
            }

            warn!(
                target,
                attempt,
                max_attempts = self.policy.max_attempts,
                reading = ?last_reading,
                "STM bias not yet confirmed"
            );
            if attempt < self.policy.max_attempts {
                sleep(self.policy.backoff_delay).await;
            }
        }

        Err(PpError::BiasUnconfirmed {
            target,
            attempts: self.policy.max_attempts,
            last_reading,
            tip_frozen: false,
        })
    }

    /// Reads the bias, retrying non-numeric replies.
    pub async fn read(&self, stm: &mut dyn Stm) -> AppResult<f64> {
        for attempt in 1..=self.policy.max_attempts {
            let reading = stm
                .get_bias()
                .await
                .expected("STM bias readback failed.")
                .advisory(InstrumentKind::Stm)?;
            if let Some(value) = reading.into_value() {
                debug!(value, attempt, "STM bias read");
                return Ok(value);
            }
            if attempt < self.policy.max_attempts {
                sleep(self.policy.backoff_delay).await;
            }
        }

        Err(PpError::Protocol {
            instrument: InstrumentKind::Stm,
            message: format!(
                "bias could not be read after {} attempts",
                self.policy.max_attempts
            ),
        })
    }
}

impl From<&SafetyConfig> for BiasConfirmation {
    fn from(safety: &SafetyConfig) -> Self {
        Self {
            policy: RetryPolicy::from(safety),
            tolerance: safety.bias_tolerance,
            readback_delay: Duration::ZERO,
        }
    }
}
