//! Uniform success/failure wrapper returned by every instrument operation.
//!
//! The instrument protocols have no universal abort signal, so a failed
//! command is not automatically an error. An [`Outcome`] carries the value (on
//! success), a diagnostic message (always), and the kind of failure. Callers
//! log with [`Outcome::expected`] and then decide explicitly whether the
//! failure is fatal ([`Outcome::into_result`]) or merely advisory.

use crate::error::PpError;
use crate::instrument::InstrumentKind;
use tracing::error;

/// Why an instrument operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The instrument could not be reached (refused, closed, timed out).
    Transport,
    /// The instrument replied with an unexpected acknowledgment.
    Protocol,
    /// A reply arrived but could not be interpreted (e.g. non-numeric).
    Parse,
}

/// Result of one device interaction.
///
/// `value` is only populated when the operation succeeded; `message` is
/// always present for logging.
#[derive(Clone, Debug, PartialEq)]
#[must_use]
pub struct Outcome<T> {
    value: Option<T>,
    message: String,
    failure: Option<FailureKind>,
}

impl<T> Outcome<T> {
    /// Successful outcome carrying `value`.
    pub fn success(value: T, message: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            message: message.into(),
            failure: None,
        }
    }

    /// Failed outcome of the given kind.
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            value: None,
            message: message.into(),
            failure: Some(kind),
        }
    }

    /// Instrument unreachable.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Transport, message)
    }

    /// Unexpected acknowledgment.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Protocol, message)
    }

    /// Reply could not be interpreted.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::failure(FailureKind::Parse, message)
    }

    /// Folds a transport-level `anyhow` result into an outcome.
    pub fn from_transport(result: anyhow::Result<T>, message: impl Into<String>) -> Self {
        match result {
            Ok(value) => Self::success(value, message),
            Err(err) => Self::transport(format!("{err:#}")),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure
    }

    /// True when the instrument itself became unreachable.
    pub fn is_transport_failure(&self) -> bool {
        self.failure == Some(FailureKind::Transport)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// Logs `context` and the underlying message at error severity if the
    /// outcome failed. Never short-circuits: the outcome is returned unchanged.
    pub fn expected(self, context: &str) -> Self {
        if let Some(kind) = self.failure {
            error!(kind = ?kind, detail = %self.message, "{context}");
        }
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: self.value.map(f),
            message: self.message,
            failure: self.failure,
        }
    }

    /// Chains a second step that only runs if this one succeeded.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match (self.failure, self.value) {
            (None, Some(value)) => f(value),
            (failure, _) => Outcome {
                value: None,
                message: self.message,
                failure: failure.or(Some(FailureKind::Protocol)),
            },
        }
    }

    /// Treats any failure as fatal, tagging it with the instrument.
    pub fn into_result(self, instrument: InstrumentKind) -> Result<T, PpError> {
        match (self.failure, self.value) {
            (None, Some(value)) => Ok(value),
            (Some(FailureKind::Transport), _) => Err(PpError::Transport {
                instrument,
                message: self.message,
            }),
            _ => Err(PpError::Protocol {
                instrument,
                message: self.message,
            }),
        }
    }

    /// Escalates only transport failures; anything else is handed back.
    pub fn advisory(self, instrument: InstrumentKind) -> Result<Self, PpError> {
        if self.is_transport_failure() {
            Err(PpError::Transport {
                instrument,
                message: self.message,
            })
        } else {
            Ok(self)
        }
    }
}

impl<T> Outcome<T> {
    /// Like [`Outcome::advisory`] for calls whose reply is not needed.
    pub fn require_link(self, instrument: InstrumentKind) -> Result<(), PpError> {
        self.advisory(instrument).map(drop)
    }
}

impl Outcome<()> {
    /// Successful command with no payload.
    pub fn done(message: impl Into<String>) -> Self {
        Self::success((), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn value_only_on_success() {
        let ok = Outcome::success(1.5, "read");
        assert!(ok.succeeded());
        assert_eq!(ok.value(), Some(&1.5));

        let bad: Outcome<f64> = Outcome::parse("garbage");
        assert!(bad.failed());
        assert_eq!(bad.value(), None);
        assert_eq!(bad.message(), "garbage");
    }

    #[traced_test]
    #[test]
    fn expected_logs_failures_and_passes_through() {
        let outcome: Outcome<()> = Outcome::protocol("ERR 12");
        let returned = outcome.clone().expected("Lock-in sensitivity not set.");
        assert_eq!(returned, outcome);
        assert!(logs_contain("Lock-in sensitivity not set."));
        assert!(logs_contain("ERR 12"));
    }

    #[traced_test]
    #[test]
    fn expected_is_silent_on_success() {
        let _ = Outcome::done("Sent OUTPut1 ON").expected("AWG output not opened.");
        assert!(!logs_contain("AWG output not opened."));
    }

    #[test]
    fn advisory_only_escalates_transport() {
        let protocol: Outcome<()> = Outcome::protocol("bad ack");
        assert!(protocol.advisory(InstrumentKind::Awg).is_ok());

        let transport: Outcome<()> = Outcome::transport("connection reset");
        let err = transport.advisory(InstrumentKind::Awg).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn require_link_discards_reply() {
        let stale = Outcome::success("1.0E-06".to_string(), "read");
        assert!(stale.require_link(InstrumentKind::LockIn).is_ok());
        assert!(Outcome::<()>::parse("?")
            .require_link(InstrumentKind::LockIn)
            .is_ok());

        let lost: Outcome<String> = Outcome::transport("closed");
        let err = lost.require_link(InstrumentKind::LockIn).unwrap_err();
        assert!(matches!(
            err,
            PpError::Transport {
                instrument: InstrumentKind::LockIn,
                ..
            }
        ));
    }

    #[test]
    fn into_result_maps_kinds() {
        let err = Outcome::<f64>::parse("abc")
            .into_result(InstrumentKind::Stm)
            .unwrap_err();
        assert!(matches!(err, PpError::Protocol { .. }));
        assert_eq!(
            Outcome::success(2, "ok").into_result(InstrumentKind::Stm).unwrap(),
            2
        );
    }

    #[test]
    fn and_then_short_circuits() {
        let chained = Outcome::success("0.25", "raw")
            .and_then(|s| match s.parse::<f64>() {
                Ok(v) => Outcome::success(v, "parsed"),
                Err(e) => Outcome::parse(e.to_string()),
            });
        assert_eq!(chained.into_value(), Some(0.25));

        let failed: Outcome<f64> =
            Outcome::<&str>::transport("closed").and_then(|_| Outcome::success(1.0, "never"));
        assert!(failed.is_transport_failure());
    }

    #[test]
    fn from_transport_wraps_errors() {
        let outcome: Outcome<()> =
            Outcome::from_transport(Err(anyhow::anyhow!("refused")), "connected");
        assert!(outcome.is_transport_failure());
        assert!(outcome.message().contains("refused"));
    }
}
