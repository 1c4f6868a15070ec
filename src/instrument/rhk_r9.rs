//! RHK R9 STM controller, driven through its remote-command socket.
//!
//! Set commands are acknowledged with a bare `Done`; get commands answer
//! with the value as text.

use super::capabilities::{Instrument, Stm};
use super::{InstrumentKind, Position, TipControl};
use crate::adapters::Transport;
use crate::outcome::Outcome;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

const ACK: &str = "Done";

pub struct RhkR9 {
    transport: Box<dyn Transport>,
    timeout: Duration,
}

impl RhkR9 {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query(&mut self, command: &str) -> Outcome<String> {
        let reply = self.transport.query(command, self.timeout).await;
        Outcome::from_transport(reply, format!("[STM] Queried '{command}'"))
    }

    /// Sends a set command and requires the `Done` acknowledgment.
    async fn set(&mut self, command: &str) -> Outcome<()> {
        self.query(command).await.and_then(|reply| {
            if reply == ACK {
                Outcome::done(format!("[STM] {command}"))
            } else {
                Outcome::protocol(format!("[STM] '{command}' answered '{reply}'"))
            }
        })
    }

    async fn get_number(&mut self, command: &str) -> Outcome<f64> {
        self.query(command).await.and_then(|reply| match reply.parse::<f64>() {
            Ok(value) => Outcome::success(value, format!("[STM] {command} = {value}")),
            Err(_) => Outcome::parse(format!("[STM] '{command}' returned non-numeric '{reply}'")),
        })
    }
}

#[async_trait]
impl Instrument for RhkR9 {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Stm
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn connect(&mut self) -> Outcome<()> {
        let info = self.transport.info();
        let result = self.transport.connect().await;
        Outcome::from_transport(result, format!("[STM] Connected via {info}"))
    }

    async fn close(&mut self) -> Outcome<()> {
        let result = self.transport.disconnect().await;
        Outcome::from_transport(result, "[STM] Closed")
    }
}

#[async_trait]
impl Stm for RhkR9 {
    async fn set_tip_control(&mut self, mode: TipControl) -> Outcome<()> {
        let command = format!(
            "SetHWParameter, Z PI Controller 1, Tip Control, {}",
            mode.command_word()
        );
        let outcome = self.set(&command).await;
        if outcome.succeeded() {
            info!("STM tip control set to {}", mode.command_word());
        }
        outcome
    }

    async fn set_bias(&mut self, volts: f64) -> Outcome<()> {
        self.set(&format!("SetSWParameter, STM Bias, Value, {volts}"))
            .await
    }

    async fn get_bias(&mut self) -> Outcome<f64> {
        self.get_number("GetSWParameter, STM Bias, Value").await
    }

    async fn get_position(&mut self) -> Outcome<Position> {
        let x = self
            .get_number("GetSWParameter, Scan Area Window, Tip X in scan coordinates")
            .await;
        let Some(x) = x.value().copied() else {
            return x.map(|_| Position::default());
        };
        self.get_number("GetSWParameter, Scan Area Window, Tip Y in scan coordinates")
            .await
            .map(|y| Position { x, y })
    }

    async fn set_position(&mut self, position: Position) -> Outcome<()> {
        let outcome = self
            .set(&format!(
                "SetSWParameter, Scan Area Window, Tip X in scan coordinates, {}",
                position.x
            ))
            .await;
        if outcome.failed() {
            return outcome;
        }
        let outcome = self
            .set(&format!(
                "SetSWParameter, Scan Area Window, Tip Y in scan coordinates, {}",
                position.y
            ))
            .await;
        if outcome.succeeded() {
            info!("STM tip sent to {} in scan coordinates", position);
        }
        outcome
    }
}
