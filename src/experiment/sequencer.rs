//! Drives the runner across a queue of sweep procedures.

use super::{Experiment, ExperimentRunner, RunObserver, SweepProcedure};
use crate::config::{FailurePolicy, Settings};
use crate::error::{AppResult, PpError};
use crate::session::Session;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Whether `current` needs a fresh upload after `previous` ran.
///
/// Only the pulse shape matters: edge, width and time spread of either
/// pulse. Amplitudes are applied as a channel gain and never force one.
pub fn needs_new_waveform(previous: Option<&Experiment>, current: &Experiment) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    let (a, b) = (&previous.pump, &current.pump);
    let pump_changed = a.edge != b.edge || a.width != b.width;
    let (a, b) = (&previous.probe, &current.probe);
    let probe_changed = a.edge != b.edge || a.width != b.width;
    let spread_changed = previous.pump.time_spread != current.pump.time_spread
        || previous.probe.time_spread != current.probe.time_spread;
    pump_changed || probe_changed || spread_changed
}

/// What happened to a queue run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub completed: usize,
    pub failed: usize,
    /// Stopped by a failure under [`FailurePolicy::Abort`].
    pub halted: bool,
    pub cancelled: bool,
    /// Operator report of the most recent failure.
    pub last_error: Option<String>,
}

impl QueueReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.halted
    }
}

pub struct QueueSequencer {
    runner: ExperimentRunner,
    policy: FailurePolicy,
    previous: Option<Experiment>,
    force_upload: bool,
}

impl QueueSequencer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            runner: ExperimentRunner::new(settings),
            policy: settings.queue.on_failure,
            previous: None,
            force_upload: true,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn runner(&self) -> &ExperimentRunner {
        &self.runner
    }

    /// Runs experiments from the front of `queue` until it is empty, a
    /// failure halts it, or `cancel` fires.
    ///
    /// Each experiment is removed only after its run returns, whatever the
    /// result. Under [`FailurePolicy::Abort`] the experiments after a failed
    /// one stay queued.
    pub async fn run(
        &mut self,
        session: &mut Session,
        queue: &mut VecDeque<SweepProcedure>,
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
    ) -> AppResult<QueueReport> {
        drop_drained(queue);
        if queue.is_empty() {
            return Err(PpError::EmptyQueue);
        }

        if let Err(e) = session.connect_all().await {
            error!("{}", e.report());
            observer.on_progress(&e.report());
            return Err(e);
        }

        let total: usize = queue.iter().map(|p| p.experiments.len()).sum();
        info!(experiments = total, procedures = queue.len(), "Queue started");
        let mut report = QueueReport::default();

        loop {
            drop_drained(queue);
            if cancel.is_cancelled() {
                report.cancelled = true;
                observer.on_progress("Queue stopped");
                break;
            }
            let Some(procedure) = queue.front_mut() else {
                break;
            };
            let sweep = procedure.sweep;
            let Some(experiment) = procedure.experiments.front_mut() else {
                break;
            };

            let new_waveform =
                self.force_upload || needs_new_waveform(self.previous.as_ref(), experiment);
            observer.on_progress(&format!(
                "Running experiment {} of {total} ({})",
                report.completed + report.failed + 1,
                sweep.axis_label()
            ));

            let result = self
                .runner
                .run(session, &sweep, experiment, new_waveform, observer, cancel)
                .await;
            let finished = procedure.experiments.pop_front();

            match result {
                Ok(output) => {
                    report.completed += 1;
                    self.force_upload = false;
                    self.previous = finished;
                    if output.cancelled {
                        report.cancelled = true;
                        break;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!("{}", e.report());
                    observer.on_progress(&e.report());
                    report.last_error = Some(e.report());
                    // Instrument state after a failure is unknown.
                    self.force_upload = true;
                    self.previous = None;
                    match self.policy {
                        FailurePolicy::Abort => {
                            report.halted = true;
                            break;
                        }
                        FailurePolicy::SkipAndContinue => {
                            warn!("Skipping failed experiment and continuing");
                        }
                    }
                }
            }
        }

        drop_drained(queue);
        info!(
            completed = report.completed,
            failed = report.failed,
            halted = report.halted,
            cancelled = report.cancelled,
            remaining = queue.iter().map(|p| p.experiments.len()).sum::<usize>(),
            "Queue finished"
        );
        Ok(report)
    }

    /// Disconnects every instrument and forgets the uploaded waveform.
    pub async fn reset(&mut self, session: &mut Session) {
        session.disconnect_all().await;
        self.previous = None;
        self.force_upload = true;
        info!("Sequencer reset");
    }
}

fn drop_drained(queue: &mut VecDeque<SweepProcedure>) {
    queue.retain(|procedure| !procedure.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Pulse;

    fn experiment() -> Experiment {
        Experiment::new(
            Pulse::new(0.95, 10e-9, 3e-9, 100e-9),
            Pulse::new(0.6, 10e-9, 3e-9, 100e-9),
            (-180.0, 180.0),
            400,
        )
    }

    #[test]
    fn test_first_experiment_needs_upload() {
        assert!(needs_new_waveform(None, &experiment()));
    }

    #[test]
    fn test_identical_copy_needs_no_upload() {
        let exp = experiment();
        assert!(!needs_new_waveform(Some(&exp), &exp.clone()));
    }

    #[test]
    fn test_amplitude_change_needs_no_upload() {
        let prev = experiment();
        let mut next = experiment();
        next.pump.amp = 0.5;
        next.probe.amp = 0.1;
        next.domain = (0.0, 90.0);
        assert!(!needs_new_waveform(Some(&prev), &next));
    }

    #[test]
    fn test_shape_changes_need_upload() {
        let prev = experiment();
        let changes: [fn(&mut Experiment); 5] = [
            |e| e.pump.edge = 4e-9,
            |e| e.pump.width = 0.0,
            |e| e.probe.edge = 5e-9,
            |e| e.probe.width = 20e-9,
            |e| e.probe.time_spread = 200e-9,
        ];
        for change in changes {
            let mut next = experiment();
            change(&mut next);
            assert!(needs_new_waveform(Some(&prev), &next));
        }
    }

    #[test]
    fn test_report_is_clean() {
        assert!(QueueReport::default().is_clean());
        let report = QueueReport {
            failed: 1,
            ..Default::default()
        };
        assert!(!report.is_clean());
    }
}
