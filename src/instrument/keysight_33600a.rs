//! Keysight 33600A-series two-channel arbitrary waveform generator.
//!
//! SCPI over either a VISA session or the raw socket on port 5025. Arbitrary
//! waveforms are sent as IEEE-488.2 definite-length binary blocks of
//! little-endian `f32` samples.

use super::capabilities::{Awg, Instrument};
use super::{Channel, InstrumentKind, SyncMode};
use crate::adapters::Transport;
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct Keysight33600A {
    transport: Box<dyn Transport>,
    timeout: Duration,
    reset_settle: Duration,
}

impl Keysight33600A {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: Duration::from_secs(5),
            reset_settle: Duration::from_secs(5),
        }
    }

    /// Reply timeout for queries.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay after `*RST` before the instrument accepts commands.
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    async fn write(&mut self, command: &str) -> Outcome<()> {
        let sent = self.transport.send(command).await;
        Outcome::from_transport(sent, format!("[AWG] Sent '{command}'"))
    }

    /// Sends each command in order, stopping at the first failure.
    async fn write_sequence<I, S>(&mut self, commands: I) -> Outcome<()>
    where
        I: IntoIterator<Item = S> + Send,
        I::IntoIter: Send,
        S: AsRef<str> + Send + Sync,
    {
        let mut last = Outcome::done("[AWG] Nothing to send");
        for command in commands {
            last = self.write(command.as_ref()).await;
            if last.failed() {
                return last;
            }
        }
        last
    }

    async fn query(&mut self, command: &str) -> Outcome<String> {
        let reply = self.transport.query(command, self.timeout).await;
        Outcome::from_transport(reply, format!("[AWG] Queried '{command}'"))
    }
}

/// Encodes samples as `#<digits><length><bytes>`.
pub fn binary_block(samples: &[f32]) -> Vec<u8> {
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let length = payload.len().to_string();
    let mut block = format!("#{}{}", length.len(), length).into_bytes();
    block.extend_from_slice(&payload);
    block
}

#[async_trait]
impl Instrument for Keysight33600A {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Awg
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn connect(&mut self) -> Outcome<()> {
        let info = self.transport.info();
        let result = self.transport.connect().await;
        Outcome::from_transport(result, format!("[AWG] Connected via {info}"))
    }

    async fn close(&mut self) -> Outcome<()> {
        let result = self.transport.disconnect().await;
        Outcome::from_transport(result, "[AWG] Closed")
    }
}

#[async_trait]
impl Awg for Keysight33600A {
    async fn reset(&mut self) -> Outcome<()> {
        let outcome = self.write("*RST").await;
        if outcome.succeeded() {
            tokio::time::sleep(self.reset_settle).await;
        }
        outcome
    }

    async fn upload_waveform(
        &mut self,
        buffer: &[f32],
        amplitude: f64,
        sample_rate: f64,
        name: &str,
        channel: Channel,
    ) -> Outcome<()> {
        let ch = channel.number();
        let preamble = [
            format!("SOURce{ch}:DATA:VOLatile:CLEar"),
            "FORMat:BORDer SWAP".to_string(),
        ];
        let outcome = self.write_sequence(preamble).await;
        if outcome.failed() {
            return outcome;
        }

        let mut message = format!("SOURce{ch}:DATA:ARBitrary {name},").into_bytes();
        message.extend(binary_block(buffer));
        message.push(b'\n');
        let sent = self.transport.send_bytes(&message).await;
        let outcome = Outcome::from_transport(sent, format!("[AWG] Sent {} samples", buffer.len()));
        if outcome.failed() {
            return outcome;
        }
        debug!(channel = ch, samples = buffer.len(), "Arbitrary waveform block sent");

        let select = [
            "*WAI".to_string(),
            format!("SOURce{ch}:FUNCtion:ARBitrary {name}"),
            format!("SOURce{ch}:FUNCtion:ARBitrary:SRATe {sample_rate}"),
            format!("SOURce{ch}:FUNCtion ARB"),
        ];
        let outcome = self.write_sequence(select).await;
        if outcome.failed() {
            return outcome;
        }

        let outcome = self.set_amplitude(amplitude, channel).await;
        if outcome.failed() {
            return outcome;
        }

        self.query("SYST:ERR?").await.and_then(|reply| {
            if reply.starts_with("+0") {
                info!(channel = ch, "Waveform transferred without error");
                Outcome::done(format!("[AWG] Waveform '{name}' loaded on channel {ch}"))
            } else {
                error!(channel = ch, reply = %reply, "AWG reported an error after upload");
                Outcome::protocol(format!("[AWG] Upload of '{name}' reported: {reply}"))
            }
        })
    }

    async fn set_amplitude(&mut self, amplitude: f64, channel: Channel) -> Outcome<()> {
        let ch = channel.number();
        self.write_sequence([
            format!("SOURce{ch}:VOLT {amplitude}"),
            "*WAI".to_string(),
            format!("SOURce{ch}:VOLT:OFFSet 0"),
            "*WAI".to_string(),
        ])
        .await
    }

    async fn set_phase(&mut self, degrees: f64, channel: Channel) -> Outcome<()> {
        let ch = channel.number();
        self.write_sequence([format!("SOURce{ch}:PHASe:ARB {degrees}"), "*WAI".to_string()])
            .await
    }

    async fn open_channel(&mut self, channel: Channel) -> Outcome<()> {
        self.write(&format!("OUTPut{} ON", channel.number())).await
    }

    async fn close_channel(&mut self, channel: Channel) -> Outcome<()> {
        self.write(&format!("OUTPut{} OFF", channel.number())).await
    }

    async fn modulate_amplitude(&mut self, frequency_hz: f64, channel: Channel) -> Outcome<()> {
        let ch = channel.number();
        let commands = [
            format!("SOURce{ch}:AM:DEPT 100"),
            format!("SOURce{ch}:AM:DSSC OFF"),
            format!("SOURce{ch}:AM:SOURCE INT"),
            format!("SOURce{ch}:AM:INT:FUNC SQU"),
            format!("SOURce{ch}:AM:INT:FREQ {frequency_hz}"),
            format!("SOURce{ch}:AM:STATE ON"),
            format!("OUTP:SYNC:SOURCE CH{ch}"),
        ];
        self.write_sequence(commands.into_iter().flat_map(|c| [c, "*WAI".to_string()]))
            .await
    }

    async fn combine_channels(&mut self, out: Channel, feed: Channel) -> Outcome<()> {
        self.write_sequence([
            format!("SOURce{}:COMBine:FEED CH{}", out.number(), feed.number()),
            "*WAI".to_string(),
        ])
        .await
    }

    async fn sync_channels(&mut self, mode: SyncMode) -> Outcome<()> {
        let mut commands = Vec::new();
        if mode.function {
            commands.extend(["FUNC:ARB:SYNC", "*WAI"]);
        }
        if mode.phase {
            commands.extend(["SOURce:PHAS:SYNC", "*WAI"]);
        }
        self.write_sequence(commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    async fn connected() -> (Keysight33600A, MockTransport) {
        let probe = MockTransport::new();
        let mut awg = Keysight33600A::new(Box::new(probe.clone()))
            .with_reset_settle(Duration::ZERO);
        assert!(awg.connect().await.succeeded());
        (awg, probe)
    }

    #[test]
    fn test_binary_block_header() {
        let block = binary_block(&[1.0, -1.0, 0.5]);
        assert_eq!(&block[..3], b"#212");
        assert_eq!(block.len(), 3 + 12);
        assert_eq!(&block[3..7], &1.0f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_set_amplitude_commands() {
        let (mut awg, probe) = connected().await;
        assert!(awg.set_amplitude(0.95, Channel::Pump).await.succeeded());
        assert_eq!(
            probe.sent_lines(),
            vec!["SOURce2:VOLT 0.95", "*WAI", "SOURce2:VOLT:OFFSet 0", "*WAI"]
        );
    }

    #[tokio::test]
    async fn test_upload_checks_error_queue() {
        let (mut awg, probe) = connected().await;
        probe.push_reply("+0,\"No error\"\n");
        let outcome = awg
            .upload_waveform(&[0.0, 1.0, 0.0], 0.6, 1e9, "Probe", Channel::Probe)
            .await;
        assert!(outcome.succeeded(), "{}", outcome.message());

        let lines = probe.sent_lines();
        assert_eq!(lines[0], "SOURce1:DATA:VOLatile:CLEar");
        assert!(lines.contains(&"SOURce1:FUNCtion ARB".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("SYST:ERR?"));
        let raw = probe.sent_raw();
        assert!(raw[2].starts_with(b"SOURce1:DATA:ARBitrary Probe,#212"));
    }

    #[tokio::test]
    async fn test_upload_error_is_protocol_failure() {
        let (mut awg, probe) = connected().await;
        probe.push_reply("-113,\"Undefined header\"");
        let outcome = awg
            .upload_waveform(&[1.0; 32], 1.0, 1e9, "Pump", Channel::Pump)
            .await;
        assert_eq!(outcome.failure_kind(), Some(crate::outcome::FailureKind::Protocol));
    }

    #[tokio::test]
    async fn test_lost_link_stops_sequence() {
        let (mut awg, probe) = connected().await;
        probe.fail_after(2);
        let outcome = awg.modulate_amplitude(1007.0, Channel::Probe).await;
        assert!(outcome.is_transport_failure());
        assert_eq!(probe.sent_lines().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_function_only() {
        let (mut awg, probe) = connected().await;
        let _ = awg.sync_channels(SyncMode::FUNCTION).await;
        assert_eq!(probe.sent_lines(), vec!["FUNC:ARB:SYNC", "*WAI"]);
    }
}
