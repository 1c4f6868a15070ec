//! Queue descriptions in TOML.
//!
//! ```toml
//! [[procedure]]
//! sweep = "time_delay"
//!
//! [[procedure.experiment]]
//! pump = { amp = 0.95, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
//! probe = { amp = 0.6, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
//! domain = [-180.0, 180.0]
//! samples = 400
//!
//! [[procedure]]
//! sweep = "amplitude"
//! channel = "pump"
//!
//! [[procedure.experiment]]
//! pump = { amp = 0.95, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
//! probe = { amp = 0.6, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
//! domain = [0.1, 1.0]
//! samples = 50
//! repetitions = 3
//! fixed_time_delay = 5e-9
//! ```

use super::{Experiment, Pulse, Sweep, SweepKind, SweepProcedure};
use crate::error::{AppResult, PpError};
use crate::instrument::Channel;
use crate::waveform::WaveformConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tracing::info;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueuePlan {
    #[serde(default, rename = "procedure")]
    pub procedures: Vec<ProcedurePlan>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcedurePlan {
    pub sweep: SweepKind,
    /// Swept channel. Time-delay sweeps always act on the probe.
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default, rename = "experiment")]
    pub experiments: Vec<ExperimentPlan>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentPlan {
    pub pump: Pulse,
    pub probe: Pulse,
    pub domain: (f64, f64),
    pub samples: usize,
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
    #[serde(default)]
    pub fixed_time_delay: Option<f64>,
}

fn default_repetitions() -> usize {
    1
}

impl QueuePlan {
    pub fn load(path: &Path, waveform: &WaveformConfig) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let plan = Self::parse(&text, waveform)?;
        info!(
            path = %path.display(),
            procedures = plan.procedures.len(),
            "Queue plan loaded"
        );
        Ok(plan)
    }

    pub fn parse(text: &str, waveform: &WaveformConfig) -> AppResult<Self> {
        let plan: QueuePlan = toml::from_str(text)?;
        plan.validate(waveform)?;
        Ok(plan)
    }

    /// Checks every entry, including that each pulse fits in generator memory.
    pub fn validate(&self, waveform: &WaveformConfig) -> AppResult<()> {
        for (p, procedure) in self.procedures.iter().enumerate() {
            if procedure.sweep == SweepKind::TimeDelay
                && procedure.channel.is_some_and(|c| c != Channel::Probe)
            {
                return Err(PpError::Configuration(format!(
                    "procedure {}: time-delay sweeps act on the probe channel",
                    p + 1
                )));
            }
            for (e, exp) in procedure.experiments.iter().enumerate() {
                let at = format!("procedure {} experiment {}", p + 1, e + 1);
                if exp.samples == 0 {
                    return Err(PpError::Configuration(format!("{at}: samples must be at least 1")));
                }
                if exp.repetitions == 0 {
                    return Err(PpError::Configuration(format!(
                        "{at}: repetitions must be at least 1"
                    )));
                }
                for (name, pulse) in [("pump", &exp.pump), ("probe", &exp.probe)] {
                    if !(pulse.time_spread > 0.0) || pulse.width < 0.0 || pulse.edge < 0.0 {
                        return Err(PpError::Configuration(format!(
                            "{at}: {name} pulse needs a positive time_spread and non-negative width and edge"
                        )));
                    }
                    let length = waveform.buffer_length(pulse);
                    if length > waveform.max_arb_length {
                        return Err(PpError::Configuration(format!(
                            "{at}: {name} pulse needs {length} samples, limit is {}",
                            waveform.max_arb_length
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn experiment_count(&self) -> usize {
        self.procedures.iter().map(|p| p.experiments.len()).sum()
    }

    pub fn into_procedures(self) -> VecDeque<SweepProcedure> {
        self.procedures
            .into_iter()
            .map(|plan| {
                let sweep = match plan.sweep {
                    SweepKind::TimeDelay => Sweep::time_delay(),
                    SweepKind::Amplitude => Sweep::amplitude(plan.channel.unwrap_or(Channel::Probe)),
                };
                let experiments = plan.experiments.into_iter().map(|e| {
                    let mut experiment = Experiment::new(e.pump, e.probe, e.domain, e.samples)
                        .with_repetitions(e.repetitions);
                    experiment.fixed_time_delay = e.fixed_time_delay;
                    experiment
                });
                SweepProcedure::new(sweep, experiments)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
[[procedure]]
sweep = "time_delay"

[[procedure.experiment]]
pump = { amp = 0.95, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
probe = { amp = 0.6, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
domain = [-180.0, 180.0]
samples = 400

[[procedure]]
sweep = "amplitude"
channel = "pump"

[[procedure.experiment]]
pump = { amp = 0.95, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
probe = { amp = 0.6, width = 10e-9, edge = 3e-9, time_spread = 100e-9 }
domain = [0.1, 1.0]
samples = 50
repetitions = 3
fixed_time_delay = 5e-9
"#;

    #[test]
    fn test_parse_plan() {
        let plan = QueuePlan::parse(PLAN, &WaveformConfig::default()).unwrap();
        assert_eq!(plan.experiment_count(), 2);

        let procedures = plan.into_procedures();
        assert_eq!(procedures[0].sweep, Sweep::time_delay());
        assert_eq!(procedures[1].sweep, Sweep::amplitude(Channel::Pump));

        let amp = &procedures[1].experiments[0];
        assert_eq!(amp.repetitions, 3);
        assert_eq!(amp.fixed_time_delay, Some(5e-9));
        assert!(amp.coordinates.is_none());
        assert_eq!(procedures[0].experiments[0].repetitions, 1);
    }

    #[test]
    fn test_zero_samples_rejected() {
        let text = PLAN.replace("samples = 400", "samples = 0");
        let err = QueuePlan::parse(&text, &WaveformConfig::default()).unwrap_err();
        assert!(err.to_string().contains("samples must be at least 1"));
    }

    #[test]
    fn test_time_delay_on_pump_rejected() {
        let text = PLAN.replacen("sweep = \"time_delay\"", "sweep = \"time_delay\"\nchannel = \"pump\"", 1);
        assert!(QueuePlan::parse(&text, &WaveformConfig::default()).is_err());
    }

    #[test]
    fn test_oversized_pulse_rejected() {
        let text = PLAN.replacen("time_spread = 100e-9 }", "time_spread = 1.0 }", 1);
        let err = QueuePlan::parse(&text, &WaveformConfig::default()).unwrap_err();
        assert!(err
            .to_string()
            .contains("procedure 1 experiment 1: pump pulse needs 1000000000 samples"));

        let roomy = WaveformConfig {
            max_arb_length: 2_000_000_000,
            ..WaveformConfig::default()
        };
        assert!(QueuePlan::parse(&text, &roomy).is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            QueuePlan::parse("[[procedure]]\nsweep = 3", &WaveformConfig::default()),
            Err(PpError::QueueFile(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.toml");
        std::fs::write(&path, PLAN).unwrap();
        assert_eq!(QueuePlan::load(&path, &WaveformConfig::default()).unwrap().procedures.len(), 2);
    }
}
