//! Signal Recovery 7265 DSP lock-in amplifier over Ethernet.

use super::capabilities::{Instrument, LockIn};
use super::InstrumentKind;
use crate::adapters::Transport;
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Reference mode, input mode, sensitivity, AC gain, auto-phase, filter time
/// constant, floating input and line-rejection settings used for pump-probe
/// detection.
pub const DEFAULT_SETUP: [&str; 10] = [
    "IE 2",
    "IMODE 0",
    "VMODE 1",
    "SEN 22",
    "ACGAIN 5",
    "AUTOMATIC 0",
    "AQN",
    "TC 10",
    "FLOAT 1",
    "LF 0",
];

pub struct SignalRecovery7265 {
    transport: Box<dyn Transport>,
    timeout: Duration,
    read_command: String,
    setup_commands: Vec<String>,
    reset_settle: Duration,
    command_spacing: Duration,
}

impl SignalRecovery7265 {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: Duration::from_secs(2),
            read_command: "X.".to_string(),
            setup_commands: DEFAULT_SETUP.iter().map(|s| s.to_string()).collect(),
            reset_settle: Duration::from_secs(3),
            command_spacing: Duration::from_millis(200),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_read_command(mut self, command: impl Into<String>) -> Self {
        self.read_command = command.into();
        self
    }

    pub fn with_setup_commands(mut self, commands: Vec<String>) -> Self {
        self.setup_commands = commands;
        self
    }

    /// `reset_settle` follows `*CLS`; `command_spacing` separates setup commands.
    pub fn with_settling(mut self, reset_settle: Duration, command_spacing: Duration) -> Self {
        self.reset_settle = reset_settle;
        self.command_spacing = command_spacing;
        self
    }
}

#[async_trait]
impl Instrument for SignalRecovery7265 {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::LockIn
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn connect(&mut self) -> Outcome<()> {
        let info = self.transport.info();
        let result = self.transport.connect().await;
        Outcome::from_transport(result, format!("[Lock-in] Connected via {info}"))
    }

    async fn close(&mut self) -> Outcome<()> {
        let result = self.transport.disconnect().await;
        Outcome::from_transport(result, "[Lock-in] Closed")
    }
}

#[async_trait]
impl LockIn for SignalRecovery7265 {
    async fn reset(&mut self) -> Outcome<()> {
        let outcome = self.send("*CLS").await;
        if outcome.succeeded() {
            tokio::time::sleep(self.reset_settle).await;
        }
        outcome
    }

    async fn default_configuration(&mut self) -> Outcome<()> {
        let commands = self.setup_commands.clone();
        for command in &commands {
            let outcome = self
                .send(command)
                .await
                .expected(&format!("Lock-in setting '{command}' not applied."));
            if outcome.is_transport_failure() {
                return outcome;
            }
            tokio::time::sleep(self.command_spacing).await;
        }
        info!(settings = commands.len(), "Lock-in default configuration applied");
        Outcome::done(format!("[Lock-in] Applied {} settings", commands.len()))
    }

    async fn send(&mut self, command: &str) -> Outcome<()> {
        let sent = self.transport.send(command).await;
        Outcome::from_transport(sent, format!("[Lock-in] Sent {command}"))
    }

    async fn query(&mut self, command: &str) -> Outcome<String> {
        let reply = self.transport.query(command, self.timeout).await;
        Outcome::from_transport(reply, format!("[Lock-in] Queried {command}"))
    }

    async fn read_x(&mut self) -> Outcome<String> {
        let command = self.read_command.clone();
        self.query(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;
    use tracing_test::traced_test;

    fn lockin(probe: &MockTransport) -> SignalRecovery7265 {
        SignalRecovery7265::new(Box::new(probe.clone()))
            .with_settling(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_default_configuration_sends_setup_in_order() {
        let probe = MockTransport::new();
        let mut device = lockin(&probe);
        assert!(device.connect().await.succeeded());
        assert!(device.default_configuration().await.succeeded());
        assert_eq!(probe.sent_lines(), DEFAULT_SETUP.to_vec());
    }

    #[traced_test]
    #[tokio::test]
    async fn test_default_configuration_stops_on_lost_link() {
        let probe = MockTransport::new();
        probe.fail_after(3);
        let mut device = lockin(&probe);
        let _ = device.connect().await;
        let outcome = device.default_configuration().await;
        assert!(outcome.is_transport_failure());
        assert!(logs_contain("Lock-in setting 'SEN 22' not applied."));
    }

    #[tokio::test]
    async fn test_read_x_uses_configured_command() {
        let probe = MockTransport::new();
        probe.push_reply("-2.5E-06\r\n");
        let mut device = lockin(&probe).with_read_command("XY.");
        let _ = device.connect().await;
        assert_eq!(device.read_x().await.into_value().as_deref(), Some("-2.5E-06"));
        assert_eq!(probe.sent_lines(), vec!["XY."]);
    }
}
