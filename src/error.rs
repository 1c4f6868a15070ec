//! Custom error types for the sequencer.
//!
//! This module defines the primary error type, `PpError`. Using the `thiserror`
//! crate, it gives every layer (configuration, transports, the experiment runner
//! and the queue sequencer) one consistent way to report failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment load errors and semantic
//!   validation errors in the settings.
//! - **`Transport`**: the instrument could not be reached (connection refused,
//!   I/O timeout). Always fatal to the running experiment.
//! - **`Protocol`**: the instrument answered, but not with the expected
//!   acknowledgment. Only escalated where the command is safety relevant.
//! - **`TipControl`** / **`BiasUnconfirmed`**: safety-critical STM state could
//!   not be established or confirmed.
//! - **`Waveform`**, **`EmptyQueue`**, **`QueueFile`**: input problems.
//!
//! Every variant that concerns a device can name it through
//! [`PpError::instrument`], and [`PpError::hint`] turns that into the
//! remediation text shown to the operator.

use crate::instrument::{InstrumentKind, TipControl};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PpError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum PpError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{instrument} transport error: {message}")]
    Transport {
        instrument: InstrumentKind,
        message: String,
    },

    #[error("{instrument} protocol error: {message}")]
    Protocol {
        instrument: InstrumentKind,
        message: String,
    },

    #[error("STM tip control could not be set to '{mode}': {message}")]
    TipControl { mode: TipControl, message: String },

    #[error(
        "STM bias not confirmed at {target} V after {attempts} attempts (last reading: {})",
        last_reading.map_or_else(|| "none".to_string(), |v| format!("{v} V"))
    )]
    BiasUnconfirmed {
        target: f64,
        attempts: u32,
        last_reading: Option<f64>,
        /// Tip control was still frozen when the run gave up.
        tip_frozen: bool,
    },

    #[error("Waveform error: {0}")]
    Waveform(String),

    #[error("Experiment queue is empty. Please fill the queue with at least one experiment.")]
    EmptyQueue,

    #[error("Queue file error: {0}")]
    QueueFile(#[from] toml::de::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl PpError {
    /// The instrument this error originated from, if any.
    pub fn instrument(&self) -> Option<InstrumentKind> {
        match self {
            PpError::Transport { instrument, .. } | PpError::Protocol { instrument, .. } => {
                Some(*instrument)
            }
            PpError::TipControl { .. } | PpError::BiasUnconfirmed { .. } => {
                Some(InstrumentKind::Stm)
            }
            _ => None,
        }
    }

    /// Suggested remediation for the operator.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            PpError::BiasUnconfirmed {
                tip_frozen: true, ..
            } => Some(
                "The STM bias could not be confirmed. Tip control was left frozen; \
                 verify the bias on the STM controller before releasing the tip.",
            ),
            PpError::BiasUnconfirmed {
                tip_frozen: false, ..
            } => Some(
                "The STM bias could not be confirmed. The prior bias was restored and \
                 tip control released; check the STM controller before the next experiment.",
            ),
            PpError::EmptyQueue => None,
            _ => self.instrument().map(InstrumentKind::remediation),
        }
    }

    /// Records whether tip control ended frozen; only bias errors carry it.
    pub fn with_tip_state(mut self, frozen: bool) -> Self {
        if let PpError::BiasUnconfirmed { tip_frozen, .. } = &mut self {
            *tip_frozen = frozen;
        }
        self
    }

    /// Whether the error means the instrument itself is unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, PpError::Transport { .. })
    }

    /// One-line operator report: the error followed by its hint.
    pub fn report(&self) -> String {
        match self.hint() {
            Some(hint) => format!("[ERROR] {self}. {hint}"),
            None => format!("[ERROR] {self}."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PpError::Transport {
            instrument: InstrumentKind::Awg,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "AWG transport error: connection refused");
    }

    #[test]
    fn test_hint_names_instrument() {
        let err = PpError::Transport {
            instrument: InstrumentKind::LockIn,
            message: "timed out".into(),
        };
        assert_eq!(err.instrument(), Some(InstrumentKind::LockIn));
        assert!(err.report().contains("Is the lock-in connected properly?"));
    }

    #[test]
    fn test_bias_unconfirmed_message() {
        let err = PpError::BiasUnconfirmed {
            target: 0.01,
            attempts: 5,
            last_reading: None,
            tip_frozen: true,
        };
        assert!(err.to_string().contains("after 5 attempts (last reading: none)"));
        assert_eq!(err.instrument(), Some(InstrumentKind::Stm));
        assert!(err.hint().unwrap().contains("left frozen"));
    }

    #[test]
    fn test_bias_unconfirmed_hint_follows_tip_state() {
        let err = PpError::BiasUnconfirmed {
            target: 0.01,
            attempts: 5,
            last_reading: Some(0.5),
            tip_frozen: true,
        }
        .with_tip_state(false);
        let hint = err.hint().unwrap();
        assert!(hint.contains("tip control released"));
        assert!(!hint.contains("left frozen"));

        let other = PpError::EmptyQueue.with_tip_state(true);
        assert!(matches!(other, PpError::EmptyQueue));
    }

    #[test]
    fn test_empty_queue_has_no_hint() {
        assert!(PpError::EmptyQueue.hint().is_none());
    }
}
