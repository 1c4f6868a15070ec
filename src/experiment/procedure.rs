//! Sweep procedures: what the runner changes between samples.

use super::Experiment;
use crate::instrument::{Awg, Channel};
use crate::outcome::Outcome;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    /// Steps the arbitrary-waveform phase of the probe channel (degrees).
    TimeDelay,
    /// Steps the output amplitude of one channel (volts).
    Amplitude,
}

/// The swept parameter and the channel it acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    pub kind: SweepKind,
    pub channel: Channel,
}

impl Sweep {
    pub fn time_delay() -> Self {
        Self {
            kind: SweepKind::TimeDelay,
            channel: Channel::Probe,
        }
    }

    pub fn amplitude(channel: Channel) -> Self {
        Self {
            kind: SweepKind::Amplitude,
            channel,
        }
    }

    /// Multiplier from sweep units to axis units. Phase degrees become
    /// nanoseconds of delay for the experiment's waveform period.
    pub fn conversion_factor(&self, experiment: &Experiment) -> f64 {
        match self.kind {
            SweepKind::TimeDelay => experiment.probe.time_spread * 1e9 / 360.0,
            SweepKind::Amplitude => 1.0,
        }
    }

    pub fn axis_label(&self) -> String {
        match self.kind {
            SweepKind::TimeDelay => "Time delay, Δt (ns)".to_string(),
            SweepKind::Amplitude => format!("{} amplitude (V)", self.channel.title()),
        }
    }

    /// The single device mutation performed for each sample.
    pub async fn apply(&self, awg: &mut dyn Awg, value: f64) -> Outcome<()> {
        match self.kind {
            SweepKind::TimeDelay => awg.set_phase(value, self.channel).await,
            SweepKind::Amplitude => awg.set_amplitude(value, self.channel).await,
        }
    }
}

/// A sweep together with the experiments it will run, in order.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepProcedure {
    pub sweep: Sweep,
    pub experiments: VecDeque<Experiment>,
}

impl SweepProcedure {
    pub fn new(sweep: Sweep, experiments: impl IntoIterator<Item = Experiment>) -> Self {
        Self {
            sweep,
            experiments: experiments.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Pulse;
    use crate::instrument::mock::{AwgCall, MockAwg};

    fn experiment() -> Experiment {
        let pulse = Pulse::new(0.5, 10e-9, 3e-9, 100e-9);
        Experiment::new(pulse, pulse, (-180.0, 180.0), 10)
    }

    #[test]
    fn test_time_delay_converts_degrees_to_ns() {
        let factor = Sweep::time_delay().conversion_factor(&experiment());
        assert!((factor * 360.0 - 100.0).abs() < 1e-9);
        assert_eq!(Sweep::time_delay().axis_label(), "Time delay, Δt (ns)");
    }

    #[test]
    fn test_amplitude_label_names_channel() {
        let sweep = Sweep::amplitude(Channel::Pump);
        assert_eq!(sweep.conversion_factor(&experiment()), 1.0);
        assert_eq!(sweep.axis_label(), "Pump amplitude (V)");
    }

    #[tokio::test]
    async fn test_apply_dispatches_on_kind() {
        let awg = MockAwg::new();
        let mut handle = awg.clone();
        let _ = Sweep::time_delay().apply(&mut handle, 90.0).await;
        let _ = Sweep::amplitude(Channel::Pump).apply(&mut handle, 0.3).await;
        assert_eq!(
            awg.calls(),
            vec![
                AwgCall::SetPhase {
                    degrees: 90.0,
                    channel: Channel::Probe
                },
                AwgCall::SetAmplitude {
                    amplitude: 0.3,
                    channel: Channel::Pump
                },
            ]
        );
    }
}
