//! Experiment model and orchestration.
//!
//! - [`Pulse`] / [`Experiment`]: what one measurement is.
//! - [`procedure`]: what varies from sample to sample.
//! - [`run_engine`]: the per-experiment state machine.
//! - [`sequencer`]: drives the runner across a queue.
//! - [`events`]: observer interface for progress, samples and results.
//! - [`plan`]: TOML queue descriptions.

use crate::instrument::Position;
use crate::waveform::linspace;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;
pub mod plan;
pub mod procedure;
pub mod run_engine;
pub mod sequencer;

pub use events::{ObserverSet, RunEvent, RunObserver};
pub use procedure::{Sweep, SweepKind, SweepProcedure};
pub use run_engine::{ExperimentRunner, RunOutput, RunnerState};
pub use sequencer::{needs_new_waveform, QueueReport, QueueSequencer};

/// One pulse: amplitude in volts, durations in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub amp: f64,
    /// Plateau duration.
    pub width: f64,
    /// Rise (and fall) time.
    pub edge: f64,
    /// Full waveform period.
    pub time_spread: f64,
}

impl Pulse {
    pub fn new(amp: f64, width: f64, edge: f64, time_spread: f64) -> Self {
        Self {
            amp,
            width,
            edge,
            time_spread,
        }
    }
}

/// One sweep measurement.
///
/// `coordinates` and `started_at` stay empty until the runner begins the
/// experiment, so they describe where the tip was when it actually ran.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Uuid,
    pub pump: Pulse,
    pub probe: Pulse,
    /// Sweep start and end, in the units of the active sweep (degrees of
    /// phase or volts).
    pub domain: (f64, f64),
    pub samples: usize,
    /// Passes over the domain at fixed settings.
    pub repetitions: usize,
    /// Seconds between pump and probe for amplitude sweeps.
    pub fixed_time_delay: Option<f64>,
    pub coordinates: Option<Position>,
    pub started_at: Option<DateTime<Local>>,
}

impl Experiment {
    pub fn new(pump: Pulse, probe: Pulse, domain: (f64, f64), samples: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            pump,
            probe,
            domain,
            samples,
            repetitions: 1,
            fixed_time_delay: None,
            coordinates: None,
            started_at: None,
        }
    }

    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn with_fixed_time_delay(mut self, seconds: f64) -> Self {
        self.fixed_time_delay = Some(seconds);
        self
    }

    /// Records where and when the run starts. Done once, by the runner.
    pub fn stamp(&mut self, coordinates: Option<Position>) {
        self.coordinates = coordinates;
        self.started_at = Some(Local::now());
    }

    /// The `samples` sweep values from `domain.0` to `domain.1` inclusive.
    pub fn domain_values(&self) -> Vec<f64> {
        linspace(self.domain.0, self.domain.1, self.samples)
    }

    /// File-friendly name derived from the start time.
    pub fn name(&self) -> String {
        let id = self.id.simple().to_string();
        match self.started_at {
            Some(t) => format!("pp_{}_{}", t.format("%Y%m%d_%H%M%S"), &id[..8]),
            None => format!("pp_{}", &id[..8]),
        }
    }

    /// Sectioned key/value block written ahead of the data.
    pub fn header(&self) -> Vec<(String, String)> {
        let section = |name: &str| (format!("[{name}]"), String::new());
        let entry = |key: &str, value: String| (key.to_string(), value);
        let optional = |v: Option<f64>| v.map_or_else(|| "None".to_string(), |v| v.to_string());

        let mut rows = vec![
            section("Date"),
            (
                self.started_at
                    .map_or_else(|| "None".to_string(), |t| t.to_rfc3339()),
                String::new(),
            ),
            section("Position"),
            entry("x", optional(self.coordinates.map(|p| p.x))),
            entry("y", optional(self.coordinates.map(|p| p.y))),
        ];
        for (name, pulse) in [("Pump", &self.pump), ("Probe", &self.probe)] {
            rows.push(section(name));
            rows.push(entry("amp", pulse.amp.to_string()));
            rows.push(entry("width", pulse.width.to_string()));
            rows.push(entry("edge", pulse.edge.to_string()));
        }
        rows.extend([
            section("Settings"),
            entry("pulse length", self.probe.time_spread.to_string()),
            entry("domain", format!("({}, {})", self.domain.0, self.domain.1)),
            entry("samples", self.samples.to_string()),
            entry("repetitions", self.repetitions.to_string()),
            entry("fixed time delay", optional(self.fixed_time_delay)),
        ]);
        rows
    }
}
