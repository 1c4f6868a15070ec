//! In-memory transport for driver tests and dry runs.

use super::Transport;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    sent: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    default_reply: Option<Vec<u8>>,
    refuse_connect: bool,
    fail_after: Option<usize>,
}

/// Transport that records every write and answers from a reply script.
///
/// Clones share state, so a test can keep one handle while the driver owns
/// the boxed other.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues one reply for the next `recv`.
    pub fn push_reply(&self, reply: impl AsRef<[u8]>) -> &Self {
        self.state().replies.push_back(reply.as_ref().to_vec());
        self
    }

    /// Reply used once the script runs dry.
    pub fn set_default_reply(&self, reply: impl AsRef<[u8]>) {
        self.state().default_reply = Some(reply.as_ref().to_vec());
    }

    pub fn refuse_connect(&self) {
        self.state().refuse_connect = true;
    }

    /// Every write after the first `writes` fails as if the link dropped.
    pub fn fail_after(&self, writes: usize) {
        self.state().fail_after = Some(writes);
    }

    /// Everything written so far, decoded lossily, terminators stripped.
    pub fn sent_lines(&self) -> Vec<String> {
        self.state()
            .sent
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).trim_end().to_string())
            .collect()
    }

    pub fn sent_raw(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.refuse_connect {
            bail!("Connection refused");
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        self.send_bytes(format!("{command}\n").as_bytes()).await
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            bail!("Not connected");
        }
        if state.fail_after.is_some_and(|n| state.sent.len() >= n) {
            state.connected = false;
            bail!("Connection reset by peer");
        }
        state.sent.push(bytes.to_vec());
        Ok(())
    }

    async fn recv(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        let mut state = self.state();
        if !state.connected {
            bail!("Not connected");
        }
        match state.replies.pop_front().or_else(|| state.default_reply.clone()) {
            Some(reply) => Ok(reply),
            None => bail!("Timed out waiting for reply"),
        }
    }

    fn adapter_type(&self) -> &str {
        "mock"
    }

    fn info(&self) -> String {
        "MockTransport".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let probe = MockTransport::new();
        probe.push_reply("first");
        probe.set_default_reply("again");

        let mut transport = probe.clone();
        transport.connect().await.unwrap();
        assert_eq!(transport.query("A?", Duration::ZERO).await.unwrap(), "first");
        assert_eq!(transport.query("B?", Duration::ZERO).await.unwrap(), "again");
        assert_eq!(probe.sent_lines(), vec!["A?", "B?"]);
    }

    #[tokio::test]
    async fn test_fail_after_drops_link() {
        let probe = MockTransport::new();
        probe.fail_after(1);
        let mut transport = probe.clone();
        transport.connect().await.unwrap();
        transport.send("ok").await.unwrap();
        assert!(transport.send("lost").await.is_err());
        assert!(!transport.is_connected());
    }
}
