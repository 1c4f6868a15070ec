//! Transport adapters
//!
//! Byte-level I/O for the instrument drivers. A driver owns one boxed
//! [`Transport`] and speaks its command vocabulary over it; the sequencer
//! never sees this layer.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod mock;
pub mod tcp_adapter;
pub mod visa_adapter;

pub use mock::MockTransport;
pub use tcp_adapter::TcpAdapter;
pub use visa_adapter::VisaAdapter;

/// Command/response transport to a single instrument.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the underlying connection.
    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Sends one command, appending the adapter's line terminator.
    async fn send(&mut self, command: &str) -> Result<()>;

    /// Writes raw bytes without any terminator (binary block transfers).
    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads one reply, waiting at most `timeout`.
    async fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// `send` followed by `recv`, decoded and trimmed.
    async fn query(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.send(command).await?;
        let reply = self.recv(timeout).await?;
        Ok(decode_reply(&reply))
    }

    fn adapter_type(&self) -> &str;

    fn info(&self) -> String;
}

/// Lossy UTF-8 decode with surrounding whitespace and NULs stripped.
pub fn decode_reply(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reply_strips_terminators() {
        assert_eq!(decode_reply(b"1.25E-3\r\n\0"), "1.25E-3");
        assert_eq!(decode_reply(b"Done"), "Done");
    }
}
