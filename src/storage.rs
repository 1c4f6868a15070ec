//! CSV result files.
//!
//! One file per completed experiment, named after [`Experiment::name`]:
//!
//! ```text
//! # { ...metadata as pretty JSON... }
//! [Date],
//! 2026-10-19T14:03:11+02:00,
//! [Position],
//! x,0.125
//! ...
//! "Time delay, Δt (ns)",Lock-in X (V)
//! -50,1.000000E-6
//! -49.749...,
//! ```
//!
//! An empty reading cell marks a sample whose lock-in reply was unusable.

use crate::error::AppResult;
use crate::experiment::{Experiment, RunObserver, RunOutput, Sweep};
use crate::metadata::ExperimentMetadata;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};

pub const READING_LABEL: &str = "Lock-in X (V)";

/// Writes `output` for `experiment` into `dir`, creating it if needed.
pub fn write_experiment(
    dir: &Path,
    experiment: &Experiment,
    sweep: &Sweep,
    output: &RunOutput,
    metadata: &ExperimentMetadata,
) -> AppResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.csv", experiment.name()));
    let mut file = File::create(&path)?;

    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    for line in json.lines() {
        writeln!(file, "# {line}")?;
    }

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(file);
    for (key, value) in experiment.header() {
        writer.write_record([key, value])?;
    }
    writer.write_record([sweep.axis_label().as_str(), READING_LABEL])?;
    for (x, reading) in output.x.iter().zip(&output.data) {
        let reading = reading.map_or_else(String::new, |v| format!("{v:E}"));
        writer.write_record([x.to_string(), reading])?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = output.x.len(), "Result written");
    Ok(path)
}

/// Observer that saves each completed experiment.
///
/// Write failures are logged and kept; they never interrupt the queue.
#[derive(Debug)]
pub struct CsvRecorder {
    dir: PathBuf,
    comment: String,
    written: Mutex<Vec<PathBuf>>,
    failures: Mutex<Vec<String>>,
}

impl CsvRecorder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            comment: String::new(),
            written: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn written(&self) -> Vec<PathBuf> {
        self.written
            .lock()
            .map(|w| w.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl RunObserver for CsvRecorder {
    fn on_progress(&self, _message: &str) {}

    fn on_experiment_complete(&self, experiment: &Experiment, sweep: &Sweep, output: &RunOutput) {
        let mut metadata =
            ExperimentMetadata::for_experiment(experiment, sweep).with_comment(self.comment.clone());
        if output.cancelled {
            let planned = experiment.samples * experiment.repetitions;
            let description = format!(
                "{} (stopped after {} of {planned} samples)",
                metadata.description,
                output.x.len()
            );
            metadata = metadata.with_description(description);
        }
        match write_experiment(&self.dir, experiment, sweep, output, &metadata) {
            Ok(path) => {
                if let Ok(mut written) = self.written.lock() {
                    written.push(path);
                }
            }
            Err(e) => {
                error!(experiment = %experiment.id, "Failed to save result: {e}");
                if let Ok(mut failures) = self.failures.lock() {
                    failures.push(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Pulse;
    use crate::instrument::Position;

    fn finished_experiment() -> Experiment {
        let pulse = Pulse::new(0.5, 10e-9, 3e-9, 100e-9);
        let mut exp = Experiment::new(pulse, pulse, (-180.0, 180.0), 3);
        exp.stamp(Some(Position { x: 0.125, y: -2.0 }));
        exp
    }

    #[test]
    fn test_recorder_writes_metadata_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path()).with_comment("test run");
        let exp = finished_experiment();
        let output = RunOutput {
            x: vec![-50.0, 0.0, 50.0],
            data: vec![Some(1e-6), None, Some(3e-6)],
            sample_errors: 1,
            cancelled: false,
        };

        recorder.on_experiment_complete(&exp, &Sweep::time_delay(), &output);
        let written = recorder.written();
        assert_eq!(written.len(), 1);
        assert!(recorder.failures().is_empty());

        let text = std::fs::read_to_string(&written[0]).unwrap();
        assert!(text.starts_with("# {"));
        assert!(text.contains("\"comment\": \"test run\""));
        assert!(text.contains("[Position],"));
        assert!(text.contains("x,0.125"));
        assert!(text.contains("\"Time delay, Δt (ns)\",Lock-in X (V)"));
        assert!(text.contains("-50,1E-6"));
        assert!(text.contains("\n0,\n"));
        assert!(text.contains("50,3E-6"));
    }

    #[test]
    fn test_stopped_run_is_described() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = CsvRecorder::new(dir.path());
        let output = RunOutput {
            x: vec![-50.0],
            data: vec![Some(1e-6)],
            sample_errors: 0,
            cancelled: true,
        };

        recorder.on_experiment_complete(&finished_experiment(), &Sweep::time_delay(), &output);
        let text = std::fs::read_to_string(&recorder.written()[0]).unwrap();
        assert!(text.contains("(stopped after 1 of 3 samples)"));
    }

    #[test]
    fn test_unwritable_directory_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();

        let recorder = CsvRecorder::new(&blocker);
        let output = RunOutput::default();
        recorder.on_experiment_complete(&finished_experiment(), &Sweep::time_delay(), &output);
        assert!(recorder.written().is_empty());
        assert_eq!(recorder.failures().len(), 1);
    }
}
