//! TCP socket adapter
//!
//! Used by the lock-in (Ethernet), the STM controller's remote-command port
//! and, optionally, the AWG's raw SCPI socket.

use super::Transport;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Line-oriented TCP transport.
///
/// A reply ends when the configured reply terminator has been read. With no
/// reply terminator, whatever a single read returns is the reply, which is
/// what controllers that answer with a bare `Done` need.
pub struct TcpAdapter {
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) timeout: Duration,
    pub(crate) line_terminator: String,
    pub(crate) reply_terminator: Option<String>,
    stream: Option<TcpStream>,
}

impl TcpAdapter {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            reply_terminator: None,
            stream: None,
        }
    }

    /// Connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Terminator appended to every outgoing command.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    pub fn with_reply_terminator(mut self, terminator: Option<String>) -> Self {
        self.reply_terminator = terminator.filter(|t| !t.is_empty());
        self
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        let target = format!("{}:{}", self.address, self.port);
        self.stream
            .as_mut()
            .ok_or_else(|| anyhow!("TCP connection to {target} not open"))
    }
}

#[async_trait]
impl Transport for TcpAdapter {
    async fn connect(&mut self) -> Result<()> {
        let target = format!("{}:{}", self.address, self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {target}"))?
            .with_context(|| format!("Failed to connect to {target}"))?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        debug!("TCP connection to {} opened", target);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
            debug!("TCP connection to {}:{} closed", self.address, self.port);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let line = format!("{}{}", command, self.line_terminator);
        self.send_bytes(line.as_bytes()).await?;
        debug!("TCP sent: {}", command);
        Ok(())
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(bytes).await.context("TCP write failed")?;
        stream.flush().await.context("TCP flush failed")?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let terminator = self.reply_terminator.clone();
        let stream = self.stream()?;

        let read = async {
            let mut reply = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).await.context("TCP read failed")?;
                if n == 0 {
                    if reply.is_empty() {
                        bail!("Connection closed by peer");
                    }
                    break;
                }
                reply.extend_from_slice(&chunk[..n]);
                match &terminator {
                    None => break,
                    Some(t) if reply.ends_with(t.as_bytes()) => break,
                    Some(_) => {}
                }
            }
            Ok::<_, anyhow::Error>(reply)
        };

        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| anyhow!("Timed out after {}ms waiting for reply", timeout.as_millis()))?
    }

    fn adapter_type(&self) -> &str {
        "tcp"
    }

    fn info(&self) -> String {
        format!(
            "TcpAdapter({}:{} @ {}ms timeout)",
            self.address,
            self.port,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_adapter_builder() {
        let adapter = TcpAdapter::new("169.254.11.17", 50000)
            .with_timeout(Duration::from_millis(2000))
            .with_line_terminator("\r")
            .with_reply_terminator(Some(String::new()));

        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.line_terminator, "\r");
        assert_eq!(adapter.reply_terminator, None);
        assert!(!adapter.is_connected());
        assert!(adapter.info().contains("169.254.11.17:50000"));
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let mut adapter = TcpAdapter::new("127.0.0.1", 1);
        assert!(adapter.send("X.").await.is_err());
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"X.\n");
            // Reply arrives in two pieces; the adapter must wait for the terminator.
            socket.write_all(b"1.5E").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(b"-03\r\n").await.unwrap();
        });

        let mut adapter = TcpAdapter::new("127.0.0.1", port)
            .with_reply_terminator(Some("\r\n".to_string()));
        adapter.connect().await.unwrap();
        let reply = adapter.query("X.", Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, "1.5E-03");

        server.await.unwrap();
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(socket);
        });

        let mut adapter = TcpAdapter::new("127.0.0.1", port);
        adapter.connect().await.unwrap();
        let err = adapter.recv(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.to_string().contains("Timed out"));
        server.await.unwrap();
    }
}
