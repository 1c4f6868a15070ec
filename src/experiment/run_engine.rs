//! Runs one experiment end to end.
//!
//! ```text
//! Idle -> Preparing -> Safing -> Acquiring -> Restoring -> Done | Failed
//! ```
//!
//! Restoring runs on every path once Preparing has begun. A [`SafetyLedger`]
//! records which STM changes were actually made, so restoration only undoes
//! what happened: the bias is put back if it was touched, and the tip is
//! released only after the bias it returns to has been confirmed.

use super::{Experiment, RunObserver, Sweep};
use crate::config::{Settings, TimingConfig};
use crate::error::{AppResult, PpError};
use crate::error_recovery::BiasConfirmation;
use crate::instrument::{Channel, InstrumentKind, SyncMode, TipControl};
use crate::session::Session;
use crate::waveform::{normalize_unit, synthesize, WaveformConfig};
use std::fmt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Preparing,
    Safing,
    Acquiring,
    Restoring,
    Done,
    Failed,
}

impl RunnerState {
    pub fn can_transition_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (Idle | Done | Failed, Preparing)
                | (Preparing, Safing)
                | (Safing, Acquiring)
                | (Preparing | Safing | Acquiring, Restoring)
                | (Restoring, Done | Failed)
                | (Done | Failed, Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Done | RunnerState::Failed)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Idle => "idle",
            RunnerState::Preparing => "preparing",
            RunnerState::Safing => "safing",
            RunnerState::Acquiring => "acquiring",
            RunnerState::Restoring => "restoring",
            RunnerState::Done => "done",
            RunnerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Accumulated `(axis, reading)` pairs of one experiment.
///
/// `x` is already in axis units (ns for time-delay sweeps). A `None` reading
/// marks a sample whose lock-in reply could not be parsed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOutput {
    pub x: Vec<f64>,
    pub data: Vec<Option<f64>>,
    pub sample_errors: usize,
    /// The stop signal ended acquisition early.
    pub cancelled: bool,
}

impl RunOutput {
    fn push(&mut self, x: f64, reading: Option<f64>) {
        if reading.is_none() {
            self.sample_errors += 1;
        }
        self.x.push(x);
        self.data.push(reading);
    }
}

/// STM changes made so far, and therefore owed back.
#[derive(Debug, Default)]
struct SafetyLedger {
    tip_frozen: bool,
    prior_bias: Option<f64>,
    bias_changed: bool,
}

/// Probe phase (degrees) placing the probe `delay` seconds after the pump.
pub fn fixed_delay_phase(experiment: &Experiment, delay: f64) -> f64 {
    let pump = &experiment.pump;
    let offset = delay + 2.0 * pump.edge + pump.width;
    (360.0 * offset / experiment.probe.time_spread).rem_euclid(360.0)
}

/// Leading numeric token of a lock-in reply.
fn parse_reading(reply: &str) -> Option<f64> {
    reply
        .split(|c: char| c.is_whitespace() || c == ',')
        .find(|token| !token.is_empty())
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

pub struct ExperimentRunner {
    waveform: WaveformConfig,
    timing: TimingConfig,
    bias: BiasConfirmation,
    bias_minimum: f64,
    reference_frequency_hz: f64,
    state: RunnerState,
}

impl ExperimentRunner {
    pub fn new(settings: &Settings) -> Self {
        let mut bias = BiasConfirmation::from(&settings.safety);
        bias.readback_delay = settings.timing.bias_readback;
        Self {
            waveform: settings.waveform.clone(),
            timing: settings.timing.clone(),
            bias,
            bias_minimum: settings.safety.bias_minimum,
            reference_frequency_hz: settings.lockin.reference_frequency_hz,
            state: RunnerState::Idle,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Runs `experiment` under `sweep`.
    ///
    /// `new_waveform` selects the full reset-and-upload path; otherwise only
    /// the channel amplitudes are refreshed. `cancel` is honoured between
    /// samples and still ends in Restoring; a cancelled run returns its
    /// partial output with `cancelled` set.
    ///
    /// When both the run and the restoration fail, the run's error is
    /// returned and the restoration error is reported through `observer`.
    pub async fn run(
        &mut self,
        session: &mut Session,
        sweep: &Sweep,
        experiment: &mut Experiment,
        new_waveform: bool,
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
    ) -> AppResult<RunOutput> {
        let mut ledger = SafetyLedger::default();
        let mut output = RunOutput::default();

        self.transition(RunnerState::Preparing, observer);
        let acquired = self
            .execute(
                session,
                sweep,
                experiment,
                new_waveform,
                observer,
                cancel,
                &mut ledger,
                &mut output,
            )
            .await;

        self.transition(RunnerState::Restoring, observer);
        let restored = self.restore(session, &mut ledger, observer).await;

        let tip_frozen = ledger.tip_frozen;
        let result = match (acquired, restored) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e.with_tip_state(tip_frozen)),
            (Err(primary), Err(restore)) => {
                let restore = restore.with_tip_state(tip_frozen);
                error!("Restoration also failed: {restore}");
                observer.on_progress(&restore.report());
                Err(primary.with_tip_state(tip_frozen))
            }
        };

        match result {
            Ok(()) => {
                self.transition(RunnerState::Done, observer);
                info!(
                    experiment = %experiment.id,
                    samples = output.x.len(),
                    sample_errors = output.sample_errors,
                    "Experiment finished"
                );
                observer.on_experiment_complete(experiment, sweep, &output);
                Ok(output)
            }
            Err(e) => {
                self.transition(RunnerState::Failed, observer);
                observer.on_experiment_failed(experiment, &e);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &mut self,
        session: &mut Session,
        sweep: &Sweep,
        experiment: &mut Experiment,
        new_waveform: bool,
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
        ledger: &mut SafetyLedger,
        output: &mut RunOutput,
    ) -> AppResult<()> {
        self.prepare(session, experiment, new_waveform, observer).await?;

        self.transition(RunnerState::Safing, observer);
        self.make_safe(session, ledger, observer).await?;

        self.transition(RunnerState::Acquiring, observer);
        self.acquire(session, sweep, experiment, observer, cancel, output)
            .await
    }

    async fn prepare(
        &self,
        session: &mut Session,
        experiment: &mut Experiment,
        new_waveform: bool,
        observer: &dyn RunObserver,
    ) -> AppResult<()> {
        for pulse in [&experiment.pump, &experiment.probe] {
            if !(pulse.time_spread > 0.0) {
                return Err(PpError::Waveform(format!(
                    "time spread must be positive, got {}",
                    pulse.time_spread
                )));
            }
            self.waveform.check_pulse(pulse)?;
        }

        let position = session
            .stm
            .get_position()
            .await
            .expected("STM position not read.")
            .advisory(InstrumentKind::Stm)?
            .into_value();
        experiment.stamp(position);
        debug!(experiment = %experiment.name(), ?position, "Experiment stamped");

        if new_waveform {
            self.upload(session, experiment, observer).await?;
        } else {
            observer.on_progress("[AWG] Refreshing channel amplitudes");
            for (pulse, channel) in [
                (&experiment.pump, Channel::Pump),
                (&experiment.probe, Channel::Probe),
            ] {
                session
                    .awg
                    .set_amplitude(pulse.amp, channel)
                    .await
                    .expected(&format!("{} amplitude not set.", channel.title()))
                    .require_link(InstrumentKind::Awg)?;
            }
        }

        if let Some(delay) = experiment.fixed_time_delay {
            let phase = fixed_delay_phase(experiment, delay);
            observer.on_progress(&format!(
                "[AWG] Fixed time delay {delay} s: probe phase {phase:.3} deg"
            ));
            session
                .awg
                .set_phase(phase, Channel::Probe)
                .await
                .expected("Probe phase not set.")
                .require_link(InstrumentKind::Awg)?;
        }
        Ok(())
    }

    async fn upload(
        &self,
        session: &mut Session,
        experiment: &Experiment,
        observer: &dyn RunObserver,
    ) -> AppResult<()> {
        observer.on_progress("[AWG] Resetting");
        session
            .awg
            .reset()
            .await
            .expected("AWG reset failed.")
            .require_link(InstrumentKind::Awg)?;

        observer.on_progress("[Lock-in] Resetting");
        session
            .lockin
            .reset()
            .await
            .expected("Lock-in reset failed.")
            .require_link(InstrumentKind::LockIn)?;
        session
            .lockin
            .default_configuration()
            .await
            .expected("Lock-in default configuration incomplete.")
            .require_link(InstrumentKind::LockIn)?;

        let rate = self.waveform.sample_rate_hz;
        for (pulse, channel) in [
            (&experiment.pump, Channel::Pump),
            (&experiment.probe, Channel::Probe),
        ] {
            let buffer = normalize_unit(&synthesize(pulse, &self.waveform));
            observer.on_progress(&format!(
                "[AWG] Uploading {} waveform ({} samples)",
                channel.title().to_lowercase(),
                buffer.len()
            ));
            let name = channel.title().to_uppercase();
            session
                .awg
                .upload_waveform(&buffer, pulse.amp, rate, &name, channel)
                .await
                .expected(&format!("{} waveform upload failed.", channel.title()))
                .into_result(InstrumentKind::Awg)?;
        }

        observer.on_progress(&format!(
            "[AWG] Modulating probe at {} Hz",
            self.reference_frequency_hz
        ));
        session
            .awg
            .modulate_amplitude(self.reference_frequency_hz, Channel::Probe)
            .await
            .expected("Probe modulation not configured.")
            .require_link(InstrumentKind::Awg)?;
        session
            .awg
            .combine_channels(Channel::Probe, Channel::Pump)
            .await
            .expected("Channels not combined.")
            .require_link(InstrumentKind::Awg)?;
        session
            .awg
            .sync_channels(SyncMode::FUNCTION)
            .await
            .expected("Channels not synchronized.")
            .require_link(InstrumentKind::Awg)?;
        Ok(())
    }

    async fn make_safe(
        &self,
        session: &mut Session,
        ledger: &mut SafetyLedger,
        observer: &dyn RunObserver,
    ) -> AppResult<()> {
        observer.on_progress("[STM] Freezing tip control");
        ledger.tip_frozen = true;
        let frozen = session
            .stm
            .set_tip_control(TipControl::Freeze)
            .await
            .expected("STM tip control not frozen.")
            .advisory(InstrumentKind::Stm)?;
        if frozen.failed() {
            return Err(PpError::TipControl {
                mode: TipControl::Freeze,
                message: frozen.message().to_string(),
            });
        }
        sleep(self.timing.tip_settle).await;

        let prior = self.bias.read(session.stm.as_mut()).await?;
        ledger.prior_bias = Some(prior);
        observer.on_progress(&format!(
            "[STM] Bias {prior} V recorded; lowering to {} V",
            self.bias_minimum
        ));

        ledger.bias_changed = true;
        self.bias
            .confirm(session.stm.as_mut(), self.bias_minimum)
            .await?;
        sleep(self.timing.bias_settle).await;

        observer.on_progress("[AWG] Opening output");
        session
            .awg
            .open_channel(Channel::Probe)
            .await
            .expected("AWG output not opened.")
            .require_link(InstrumentKind::Awg)?;
        Ok(())
    }

    async fn acquire(
        &self,
        session: &mut Session,
        sweep: &Sweep,
        experiment: &Experiment,
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
        output: &mut RunOutput,
    ) -> AppResult<()> {
        // The first reading after reconfiguration is stale.
        session
            .lockin
            .read_x()
            .await
            .require_link(InstrumentKind::LockIn)?;
        sleep(self.timing.flush_settle).await;

        let factor = sweep.conversion_factor(experiment);
        let values = experiment.domain_values();
        observer.on_progress(&format!(
            "Acquiring {} samples x {} repetitions",
            values.len(),
            experiment.repetitions
        ));

        for repetition in 0..experiment.repetitions {
            if repetition > 0 {
                observer.on_line_break();
            }
            for &value in &values {
                if cancel.is_cancelled() {
                    warn!(acquired = output.x.len(), "Acquisition cancelled");
                    observer.on_progress("Stop requested; ending acquisition");
                    output.cancelled = true;
                    return Ok(());
                }

                sweep
                    .apply(session.awg.as_mut(), value)
                    .await
                    .expected("Sweep step not applied.")
                    .require_link(InstrumentKind::Awg)?;
                sleep(self.timing.sample_settle).await;

                let reply = session
                    .lockin
                    .read_x()
                    .await
                    .advisory(InstrumentKind::LockIn)?;
                let reading = match reply.value() {
                    Some(text) => {
                        let parsed = parse_reading(text);
                        if parsed.is_none() {
                            warn!(reply = %text, "Lock-in reading is not numeric");
                        }
                        parsed
                    }
                    None => {
                        warn!("Lock-in read failed: {}", reply.message());
                        None
                    }
                };

                let x = value * factor;
                output.push(x, reading);
                observer.on_sample(x, reading);
            }
        }
        Ok(())
    }

    async fn restore(
        &self,
        session: &mut Session,
        ledger: &mut SafetyLedger,
        observer: &dyn RunObserver,
    ) -> AppResult<()> {
        observer.on_progress("[AWG] Closing output");
        let closed = session
            .awg
            .close_channel(Channel::Probe)
            .await
            .expected("AWG output not closed.");
        if closed.succeeded() {
            sleep(self.timing.restore_settle).await;
        }

        if ledger.bias_changed {
            if let Some(prior) = ledger.prior_bias {
                observer.on_progress(&format!("[STM] Restoring bias to {prior} V"));
                // On failure the tip stays frozen.
                self.bias.confirm(session.stm.as_mut(), prior).await?;
                sleep(self.timing.bias_settle).await;
            }
        }

        if ledger.tip_frozen {
            observer.on_progress("[STM] Releasing tip control");
            let released = session
                .stm
                .set_tip_control(TipControl::Unlimit)
                .await
                .expected("STM tip control not released.");
            if released.failed() {
                return Err(PpError::TipControl {
                    mode: TipControl::Unlimit,
                    message: released.message().to_string(),
                });
            }
            ledger.tip_frozen = false;
            sleep(self.timing.tip_settle).await;
        }
        Ok(())
    }

    fn transition(&mut self, next: RunnerState, observer: &dyn RunObserver) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Unexpected runner transition");
        }
        let from = self.state;
        self.state = next;
        observer.on_status_change(from, next);
    }
}
