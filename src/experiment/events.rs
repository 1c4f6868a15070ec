//! Run observers.
//!
//! The runner and sequencer report through [`RunObserver`], invoked
//! synchronously at each step. Front ends subscribe through
//! [`BroadcastObserver`]; the core has no dependency on any of them.

use super::{Experiment, RunOutput, RunnerState, Sweep};
use crate::error::PpError;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Receives progress from a running queue. All methods but `on_progress`
/// default to no-ops.
pub trait RunObserver: Send + Sync {
    /// Human-readable step message.
    fn on_progress(&self, message: &str);

    /// One acquired point; `reading` is `None` for a sample-level error.
    fn on_sample(&self, _x: f64, _reading: Option<f64>) {}

    /// A new repetition of the sweep begins.
    fn on_line_break(&self) {}

    fn on_status_change(&self, _from: RunnerState, _to: RunnerState) {}

    fn on_experiment_complete(&self, _experiment: &Experiment, _sweep: &Sweep, _output: &RunOutput) {}

    fn on_experiment_failed(&self, _experiment: &Experiment, _error: &PpError) {}
}

/// Owned, cloneable form of every observer callback.
#[derive(Clone, Debug, PartialEq)]
pub enum RunEvent {
    Progress(String),
    Sample { x: f64, reading: Option<f64> },
    LineBreak,
    Status { from: RunnerState, to: RunnerState },
    Completed {
        experiment_id: Uuid,
        x: Vec<f64>,
        data: Vec<Option<f64>>,
        cancelled: bool,
    },
    Failed { experiment_id: Uuid, message: String },
}

/// Forwards every callback into a broadcast channel.
///
/// Sends never block the runner; subscribers that fall behind see
/// `RecvError::Lagged`.
#[derive(Clone, Debug)]
pub struct BroadcastObserver {
    sender: broadcast::Sender<RunEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl RunObserver for BroadcastObserver {
    fn on_progress(&self, message: &str) {
        self.emit(RunEvent::Progress(message.to_string()));
    }

    fn on_sample(&self, x: f64, reading: Option<f64>) {
        self.emit(RunEvent::Sample { x, reading });
    }

    fn on_line_break(&self) {
        self.emit(RunEvent::LineBreak);
    }

    fn on_status_change(&self, from: RunnerState, to: RunnerState) {
        self.emit(RunEvent::Status { from, to });
    }

    fn on_experiment_complete(&self, experiment: &Experiment, _sweep: &Sweep, output: &RunOutput) {
        self.emit(RunEvent::Completed {
            experiment_id: experiment.id,
            x: output.x.clone(),
            data: output.data.clone(),
            cancelled: output.cancelled,
        });
    }

    fn on_experiment_failed(&self, experiment: &Experiment, error: &PpError) {
        self.emit(RunEvent::Failed {
            experiment_id: experiment.id,
            message: error.report(),
        });
    }
}

/// Logs every callback through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_progress(&self, message: &str) {
        info!("{message}");
    }

    fn on_sample(&self, x: f64, reading: Option<f64>) {
        debug!(x, reading = ?reading, "sample");
    }

    fn on_status_change(&self, from: RunnerState, to: RunnerState) {
        debug!(%from, %to, "runner state");
    }

    fn on_experiment_complete(&self, experiment: &Experiment, _sweep: &Sweep, output: &RunOutput) {
        info!(
            experiment = %experiment.id,
            samples = output.x.len(),
            sample_errors = output.sample_errors,
            cancelled = output.cancelled,
            "Experiment complete"
        );
    }

    fn on_experiment_failed(&self, experiment: &Experiment, error: &PpError) {
        error!(experiment = %experiment.id, "{}", error.report());
    }
}

/// Fans every callback out to several observers, in insertion order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl RunObserver for ObserverSet {
    fn on_progress(&self, message: &str) {
        self.observers.iter().for_each(|o| o.on_progress(message));
    }

    fn on_sample(&self, x: f64, reading: Option<f64>) {
        self.observers.iter().for_each(|o| o.on_sample(x, reading));
    }

    fn on_line_break(&self) {
        self.observers.iter().for_each(|o| o.on_line_break());
    }

    fn on_status_change(&self, from: RunnerState, to: RunnerState) {
        self.observers
            .iter()
            .for_each(|o| o.on_status_change(from, to));
    }

    fn on_experiment_complete(&self, experiment: &Experiment, sweep: &Sweep, output: &RunOutput) {
        self.observers
            .iter()
            .for_each(|o| o.on_experiment_complete(experiment, sweep, output));
    }

    fn on_experiment_failed(&self, experiment: &Experiment, error: &PpError) {
        self.observers
            .iter()
            .for_each(|o| o.on_experiment_failed(experiment, error));
    }
}
