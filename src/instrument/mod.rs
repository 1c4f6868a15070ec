//! Instrument layer: shared vocabulary, capability traits, concrete drivers
//! and scriptable mocks.
//!
//! The sequencer only ever talks to the traits in [`capabilities`]. Which
//! concrete driver sits behind them is chosen from configuration when the
//! [`Session`](crate::session::Session) is built.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod capabilities;
pub mod keysight_33600a;
pub mod mock;
pub mod rhk_r9;
pub mod signal_recovery_7265;

pub use capabilities::{Awg, Instrument, LockIn, Stm};
pub use keysight_33600a::Keysight33600A;
pub use rhk_r9::RhkR9;
pub use signal_recovery_7265::SignalRecovery7265;

/// Which of the three collaborating instruments something refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Awg,
    LockIn,
    Stm,
}

impl InstrumentKind {
    /// Operator-facing remediation for a failure on this instrument.
    pub fn remediation(self) -> &'static str {
        match self {
            InstrumentKind::Awg => "Is the AWG connected properly?",
            InstrumentKind::LockIn => "Is the lock-in connected properly?",
            InstrumentKind::Stm => {
                "Is the STM controller running and accepting remote commands?"
            }
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstrumentKind::Awg => "AWG",
            InstrumentKind::LockIn => "lock-in",
            InstrumentKind::Stm => "STM",
        };
        f.write_str(name)
    }
}

/// STM feedback-loop mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipControl {
    /// Feedback loop disabled; the tip height is held.
    Freeze,
    /// Normal feedback control.
    Unlimit,
}

impl TipControl {
    /// Title-case form used on the wire ("Freeze", "Unlimit").
    pub fn command_word(self) -> &'static str {
        match self {
            TipControl::Freeze => "Freeze",
            TipControl::Unlimit => "Unlimit",
        }
    }
}

impl fmt::Display for TipControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipControl::Freeze => f.write_str("freeze"),
            TipControl::Unlimit => f.write_str("unlimit"),
        }
    }
}

/// AWG output channel. The probe pulse lives on channel 1, the pump on 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Probe = 1,
    Pump = 2,
}

impl Channel {
    /// SCPI channel number.
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn title(self) -> &'static str {
        match self {
            Channel::Probe => "Probe",
            Channel::Pump => "Pump",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Tip position in scan coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Which generators `Awg::sync_channels` restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncMode {
    /// Reset every phase generator.
    pub phase: bool,
    /// Restart all arbitrary waveforms at their first sample.
    pub function: bool,
}

impl SyncMode {
    pub const FUNCTION: SyncMode = SyncMode {
        phase: false,
        function: true,
    };
}
