//! Simulated AWG, lock-in and STM for tests and dry runs.
//!
//! Each mock is `Clone` and shares its state through an `Arc`, so a test can
//! hand one handle to the [`Session`](crate::session::Session) and keep
//! another to script behaviour and inspect the recorded calls.
//!
//! Failure injection:
//! - `set_unreachable(true)` makes every operation (including `connect`) a
//!   transport failure.
//! - `lose_link_after(n)` lets `n` calls through and fails all later ones.
//! - `MockLockIn::push_reading` scripts raw replies, including garbage.
//! - `MockStm::confirm_after(k)` applies a bias only on the k-th consecutive
//!   `set_bias` with the same target.

use super::capabilities::{Awg, Instrument, LockIn, Stm};
use super::{Channel, InstrumentKind, Position, SyncMode, TipControl};
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Link state shared by the three mocks.
#[derive(Debug, Default)]
struct Link {
    connected: bool,
    unreachable: bool,
    calls_before_loss: Option<usize>,
    calls_seen: usize,
}

impl Link {
    /// Counts one call and reports whether the instrument answered.
    fn answer(&mut self) -> bool {
        self.calls_seen += 1;
        if self.unreachable {
            self.connected = false;
            return false;
        }
        if self.calls_before_loss.is_some_and(|n| self.calls_seen > n) {
            self.connected = false;
            return false;
        }
        true
    }
}

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unreachable_outcome<T>(kind: InstrumentKind) -> Outcome<T> {
    Outcome::transport(format!("[{kind}] Connection refused (simulated)"))
}

// =============================================================================
// MockAwg
// =============================================================================

/// One recorded AWG interaction.
#[derive(Clone, Debug, PartialEq)]
pub enum AwgCall {
    Connect,
    Close,
    Reset,
    Upload {
        name: String,
        channel: Channel,
        amplitude: f64,
        sample_rate: f64,
        buffer: Vec<f32>,
    },
    SetAmplitude {
        amplitude: f64,
        channel: Channel,
    },
    SetPhase {
        degrees: f64,
        channel: Channel,
    },
    OpenChannel(Channel),
    CloseChannel(Channel),
    Modulate {
        frequency_hz: f64,
        channel: Channel,
    },
    Combine {
        out: Channel,
        feed: Channel,
    },
    Sync(SyncMode),
}

#[derive(Debug, Default)]
struct AwgState {
    link: Link,
    calls: Vec<AwgCall>,
    reject_uploads: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MockAwg {
    state: Arc<Mutex<AwgState>>,
}

impl MockAwg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).link.unreachable = unreachable;
    }

    pub fn lose_link_after(&self, calls: usize) {
        let mut state = lock(&self.state);
        state.link.calls_before_loss = Some(state.link.calls_seen + calls);
    }

    /// Uploads reach the instrument but its error queue reports a failure.
    pub fn reject_uploads(&self) {
        lock(&self.state).reject_uploads = true;
    }

    pub fn calls(&self) -> Vec<AwgCall> {
        lock(&self.state).calls.clone()
    }

    pub fn upload_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, AwgCall::Upload { .. }))
            .count()
    }

    fn record(&self, call: AwgCall) -> Outcome<()> {
        let mut state = lock(&self.state);
        debug!(?call, "MockAwg");
        state.calls.push(call);
        if state.link.answer() {
            Outcome::done("[AWG] ok (simulated)")
        } else {
            unreachable_outcome(InstrumentKind::Awg)
        }
    }
}

#[async_trait]
impl Instrument for MockAwg {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Awg
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).link.connected
    }

    async fn connect(&mut self) -> Outcome<()> {
        let outcome = self.record(AwgCall::Connect);
        if outcome.succeeded() {
            lock(&self.state).link.connected = true;
        }
        outcome
    }

    async fn close(&mut self) -> Outcome<()> {
        let mut state = lock(&self.state);
        state.calls.push(AwgCall::Close);
        state.link.connected = false;
        Outcome::done("[AWG] Closed (simulated)")
    }
}

#[async_trait]
impl Awg for MockAwg {
    async fn reset(&mut self) -> Outcome<()> {
        self.record(AwgCall::Reset)
    }

    async fn upload_waveform(
        &mut self,
        buffer: &[f32],
        amplitude: f64,
        sample_rate: f64,
        name: &str,
        channel: Channel,
    ) -> Outcome<()> {
        let outcome = self.record(AwgCall::Upload {
            name: name.to_string(),
            channel,
            amplitude,
            sample_rate,
            buffer: buffer.to_vec(),
        });
        if outcome.succeeded() && lock(&self.state).reject_uploads {
            return Outcome::protocol("[AWG] -222,\"Data out of range\" (simulated)");
        }
        outcome
    }

    async fn set_amplitude(&mut self, amplitude: f64, channel: Channel) -> Outcome<()> {
        self.record(AwgCall::SetAmplitude { amplitude, channel })
    }

    async fn set_phase(&mut self, degrees: f64, channel: Channel) -> Outcome<()> {
        self.record(AwgCall::SetPhase { degrees, channel })
    }

    async fn open_channel(&mut self, channel: Channel) -> Outcome<()> {
        self.record(AwgCall::OpenChannel(channel))
    }

    async fn close_channel(&mut self, channel: Channel) -> Outcome<()> {
        self.record(AwgCall::CloseChannel(channel))
    }

    async fn modulate_amplitude(&mut self, frequency_hz: f64, channel: Channel) -> Outcome<()> {
        self.record(AwgCall::Modulate {
            frequency_hz,
            channel,
        })
    }

    async fn combine_channels(&mut self, out: Channel, feed: Channel) -> Outcome<()> {
        self.record(AwgCall::Combine { out, feed })
    }

    async fn sync_channels(&mut self, mode: SyncMode) -> Outcome<()> {
        self.record(AwgCall::Sync(mode))
    }
}

// =============================================================================
// MockLockIn
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum LockInCall {
    Connect,
    Close,
    Reset,
    DefaultConfiguration,
    Send(String),
    Query(String),
    ReadX,
}

#[derive(Debug)]
struct LockInState {
    link: Link,
    calls: Vec<LockInCall>,
    readings: VecDeque<String>,
    next_default: f64,
}

impl Default for LockInState {
    fn default() -> Self {
        Self {
            link: Link::default(),
            calls: Vec::new(),
            readings: VecDeque::new(),
            next_default: 1.0e-6,
        }
    }
}

/// Lock-in whose unscripted readings count up from `1.0E-06` in steps of
/// `1.0E-06`.
#[derive(Clone, Debug, Default)]
pub struct MockLockIn {
    state: Arc<Mutex<LockInState>>,
}

impl MockLockIn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).link.unreachable = unreachable;
    }

    pub fn lose_link_after(&self, calls: usize) {
        let mut state = lock(&self.state);
        state.link.calls_before_loss = Some(state.link.calls_seen + calls);
    }

    /// Queues a raw reply for the next `read_x`/`query`.
    pub fn push_reading(&self, reply: impl Into<String>) {
        lock(&self.state).readings.push_back(reply.into());
    }

    pub fn calls(&self) -> Vec<LockInCall> {
        lock(&self.state).calls.clone()
    }

    pub fn read_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, LockInCall::ReadX))
            .count()
    }

    fn record(&self, call: LockInCall) -> bool {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state.link.answer()
    }

    fn next_reply(&self) -> String {
        let mut state = lock(&self.state);
        match state.readings.pop_front() {
            Some(reply) => reply,
            None => {
                let value = state.next_default;
                state.next_default += 1.0e-6;
                format!("{value:.6E}")
            }
        }
    }
}

#[async_trait]
impl Instrument for MockLockIn {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::LockIn
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).link.connected
    }

    async fn connect(&mut self) -> Outcome<()> {
        if !self.record(LockInCall::Connect) {
            return unreachable_outcome(InstrumentKind::LockIn);
        }
        lock(&self.state).link.connected = true;
        Outcome::done("[Lock-in] Connected (simulated)")
    }

    async fn close(&mut self) -> Outcome<()> {
        let mut state = lock(&self.state);
        state.calls.push(LockInCall::Close);
        state.link.connected = false;
        Outcome::done("[Lock-in] Closed (simulated)")
    }
}

#[async_trait]
impl LockIn for MockLockIn {
    async fn reset(&mut self) -> Outcome<()> {
        if !self.record(LockInCall::Reset) {
            return unreachable_outcome(InstrumentKind::LockIn);
        }
        Outcome::done("[Lock-in] Sent *CLS (simulated)")
    }

    async fn default_configuration(&mut self) -> Outcome<()> {
        if !self.record(LockInCall::DefaultConfiguration) {
            return unreachable_outcome(InstrumentKind::LockIn);
        }
        Outcome::done("[Lock-in] Configured (simulated)")
    }

    async fn send(&mut self, command: &str) -> Outcome<()> {
        if !self.record(LockInCall::Send(command.to_string())) {
            return unreachable_outcome(InstrumentKind::LockIn);
        }
        Outcome::done(format!("[Lock-in] Sent {command} (simulated)"))
    }

    async fn query(&mut self, command: &str) -> Outcome<String> {
        if !self.record(LockInCall::Query(command.to_string())) {
            return unreachable_outcome(InstrumentKind::LockIn);
        }
        Outcome::success(self.next_reply(), format!("[Lock-in] Queried {command}"))
    }

    async fn read_x(&mut self) -> Outcome<String> {
        if !self.record(LockInCall::ReadX) {
            return unreachable_outcome(InstrumentKind::LockIn);
        }
        Outcome::success(self.next_reply(), "[Lock-in] Read X (simulated)")
    }
}

// =============================================================================
// MockStm
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum StmCall {
    Connect,
    Close,
    SetTipControl(TipControl),
    SetBias(f64),
    GetBias,
    GetPosition,
    SetPosition(Position),
}

#[derive(Debug)]
struct StmState {
    link: Link,
    calls: Vec<StmCall>,
    bias: f64,
    tip: TipControl,
    position: Position,
    confirm_after: u32,
    pending: Option<(f64, u32)>,
    garbage_reads: u32,
    refuse_freeze: bool,
}

impl Default for StmState {
    fn default() -> Self {
        Self {
            link: Link::default(),
            calls: Vec::new(),
            bias: 0.5,
            tip: TipControl::Unlimit,
            position: Position::default(),
            confirm_after: 1,
            pending: None,
            garbage_reads: 0,
            refuse_freeze: false,
        }
    }
}

/// STM controller holding a bias of 0.5 V under normal feedback.
#[derive(Clone, Debug, Default)]
pub struct MockStm {
    state: Arc<Mutex<StmState>>,
}

impl MockStm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bias(self, volts: f64) -> Self {
        lock(&self.state).bias = volts;
        self
    }

    pub fn with_position(self, position: Position) -> Self {
        lock(&self.state).position = position;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).link.unreachable = unreachable;
    }

    pub fn lose_link_after(&self, calls: usize) {
        let mut state = lock(&self.state);
        state.link.calls_before_loss = Some(state.link.calls_seen + calls);
    }

    /// A bias only takes effect on the `k`-th consecutive request for it.
    pub fn confirm_after(&self, k: u32) {
        lock(&self.state).confirm_after = k.max(1);
    }

    /// The next `n` bias readbacks are non-numeric.
    pub fn garbage_bias_reads(&self, n: u32) {
        lock(&self.state).garbage_reads = n;
    }

    /// `Freeze` is answered with an error instead of `Done`.
    pub fn refuse_freeze(&self) {
        lock(&self.state).refuse_freeze = true;
    }

    pub fn calls(&self) -> Vec<StmCall> {
        lock(&self.state).calls.clone()
    }

    pub fn bias(&self) -> f64 {
        lock(&self.state).bias
    }

    pub fn tip_control(&self) -> TipControl {
        lock(&self.state).tip
    }

    pub fn set_bias_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StmCall::SetBias(_)))
            .count()
    }

    fn record(&self, call: StmCall) -> Option<MutexGuard<'_, StmState>> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        state.link.answer().then_some(state)
    }
}

#[async_trait]
impl Instrument for MockStm {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Stm
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).link.connected
    }

    async fn connect(&mut self) -> Outcome<()> {
        match self.record(StmCall::Connect) {
            Some(mut state) => {
                state.link.connected = true;
                Outcome::done("[STM] Connected (simulated)")
            }
            None => unreachable_outcome(InstrumentKind::Stm),
        }
    }

    async fn close(&mut self) -> Outcome<()> {
        let mut state = lock(&self.state);
        state.calls.push(StmCall::Close);
        state.link.connected = false;
        Outcome::done("[STM] Closed (simulated)")
    }
}

#[async_trait]
impl Stm for MockStm {
    async fn set_tip_control(&mut self, mode: TipControl) -> Outcome<()> {
        let Some(mut state) = self.record(StmCall::SetTipControl(mode)) else {
            return unreachable_outcome(InstrumentKind::Stm);
        };
        if mode == TipControl::Freeze && state.refuse_freeze {
            return Outcome::protocol("[STM] Tip control rejected (simulated)");
        }
        state.tip = mode;
        Outcome::done(format!("[STM] Tip control {mode}"))
    }

    async fn set_bias(&mut self, volts: f64) -> Outcome<()> {
        let Some(mut state) = self.record(StmCall::SetBias(volts)) else {
            return unreachable_outcome(InstrumentKind::Stm);
        };
        let attempt = match state.pending {
            Some((target, n)) if target == volts => n + 1,
            _ => 1,
        };
        state.pending = Some((volts, attempt));
        if attempt >= state.confirm_after {
            state.bias = volts;
        }
        Outcome::done(format!("[STM] Bias request {volts}"))
    }

    async fn get_bias(&mut self) -> Outcome<f64> {
        let Some(mut state) = self.record(StmCall::GetBias) else {
            return unreachable_outcome(InstrumentKind::Stm);
        };
        if state.garbage_reads > 0 {
            state.garbage_reads -= 1;
            return Outcome::parse("[STM] Bias readback 'Busy' is not numeric (simulated)");
        }
        Outcome::success(state.bias, format!("[STM] Bias {}", state.bias))
    }

    async fn get_position(&mut self) -> Outcome<Position> {
        let Some(state) = self.record(StmCall::GetPosition) else {
            return unreachable_outcome(InstrumentKind::Stm);
        };
        Outcome::success(state.position, format!("[STM] Position {}", state.position))
    }

    async fn set_position(&mut self, position: Position) -> Outcome<()> {
        let Some(mut state) = self.record(StmCall::SetPosition(position)) else {
            return unreachable_outcome(InstrumentKind::Stm);
        };
        state.position = position;
        Outcome::done(format!("[STM] Position set to {position}"))
    }
}
