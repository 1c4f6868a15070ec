//! Capability contracts the sequencer requires from each instrument.
//!
//! Every operation returns an [`Outcome`]; whether a failure is fatal is
//! decided by the caller, never by the driver.

use super::{Channel, InstrumentKind, Position, SyncMode, TipControl};
use crate::outcome::Outcome;
use async_trait::async_trait;

/// Connection lifecycle shared by all instruments.
#[async_trait]
pub trait Instrument: Send + Sync {
    fn kind(&self) -> InstrumentKind;

    fn is_connected(&self) -> bool;

    /// Establishes the transport. Must not be called while already connected.
    async fn connect(&mut self) -> Outcome<()>;

    async fn close(&mut self) -> Outcome<()>;
}

/// Arbitrary waveform generator with two channels.
#[async_trait]
pub trait Awg: Instrument {
    /// Restores factory state and waits for the instrument to settle.
    async fn reset(&mut self) -> Outcome<()>;

    /// Uploads `buffer` (already scaled to [-1, 1]) as an arbitrary waveform
    /// named `name` on `channel`, then applies `amplitude` as output gain.
    async fn upload_waveform(
        &mut self,
        buffer: &[f32],
        amplitude: f64,
        sample_rate: f64,
        name: &str,
        channel: Channel,
    ) -> Outcome<()>;

    /// Sets peak amplitude (volts) with zero offset.
    async fn set_amplitude(&mut self, amplitude: f64, channel: Channel) -> Outcome<()>;

    /// Sets the arbitrary-waveform phase in degrees.
    async fn set_phase(&mut self, degrees: f64, channel: Channel) -> Outcome<()>;

    async fn open_channel(&mut self, channel: Channel) -> Outcome<()>;

    async fn close_channel(&mut self, channel: Channel) -> Outcome<()>;

    /// Square-wave amplitude modulation at `frequency_hz`.
    async fn modulate_amplitude(&mut self, frequency_hz: f64, channel: Channel) -> Outcome<()>;

    /// Sums `feed` into `out`; only `out` drives the physical connector.
    async fn combine_channels(&mut self, out: Channel, feed: Channel) -> Outcome<()>;

    async fn sync_channels(&mut self, mode: SyncMode) -> Outcome<()>;
}

/// Lock-in amplifier.
#[async_trait]
pub trait LockIn: Instrument {
    async fn reset(&mut self) -> Outcome<()>;

    /// Applies the measurement configuration (reference mode, input mode,
    /// gain, sensitivity, line rejection). Individual settings are advisory.
    async fn default_configuration(&mut self) -> Outcome<()>;

    async fn send(&mut self, command: &str) -> Outcome<()>;

    /// One command/response round trip.
    async fn query(&mut self, command: &str) -> Outcome<String>;

    /// Requests the in-phase (X) reading and returns the raw reply.
    async fn read_x(&mut self) -> Outcome<String>;
}

/// STM controller.
#[async_trait]
pub trait Stm: Instrument {
    async fn set_tip_control(&mut self, mode: TipControl) -> Outcome<()>;

    async fn set_bias(&mut self, volts: f64) -> Outcome<()>;

    async fn get_bias(&mut self) -> Outcome<f64>;

    async fn get_position(&mut self) -> Outcome<Position>;

    async fn set_position(&mut self, position: Position) -> Outcome<()>;
}
