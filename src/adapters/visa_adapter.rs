//! VISA transport for USB/GPIB/LXI instruments
//!
//! The AWG is normally addressed through a VISA resource string. VISA calls
//! are blocking, so every I/O runs on Tokio's blocking pool with the session
//! behind an `Arc<Mutex>`.

use super::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;

#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// VISA adapter for instrument communication
///
/// Supports resource strings like:
/// - "USB0::0x0957::0x5707::MY53805152::0::INSTR" (USB)
/// - "GPIB0::10::INSTR" (GPIB interface)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct VisaAdapter {
    pub(crate) resource_string: String,
    pub(crate) timeout: Duration,
    pub(crate) line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<visa_rs::Instrument>>>,
}

#[cfg(not(feature = "instrument_visa"))]
fn visa_disabled() -> anyhow::Error {
    anyhow!("VISA support not enabled. Rebuild with --features instrument_visa")
}

impl VisaAdapter {
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set the open timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> Result<Arc<Mutex<visa_rs::Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| anyhow!("VISA resource '{}' not open", self.resource_string))
    }
}

#[async_trait]
impl Transport for VisaAdapter {
    async fn connect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource_string.clone();
            let timeout = self.timeout;

            let instrument = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new()
                    .map_err(|e| anyhow!("Failed to create VISA resource manager: {e:?}"))?;
                let name = std::ffi::CString::new(resource.clone())
                    .context("VISA resource string contains a NUL byte")?;
                let instr = rm
                    .open(&name.into(), AccessMode::NO_LOCK, timeout)
                    .map_err(|e| anyhow!("Failed to open VISA resource {resource}: {e:?}"))?;
                Ok::<visa_rs::Instrument, anyhow::Error>(instr)
            })
            .await
            .context("VISA open task panicked")??;

            self.instrument = Some(Arc::new(Mutex::new(instrument)));
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(visa_disabled())
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let line = format!("{}{}", command, self.line_terminator);
        self.send_bytes(line.as_bytes()).await
    }

    async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            use std::io::Write;

            let session = self.session()?;
            let payload = bytes.to_vec();
            tokio::task::spawn_blocking(move || {
                let guard = session.blocking_lock();
                (&*guard)
                    .write_all(&payload)
                    .context("VISA write failed")?;
                Ok::<(), anyhow::Error>(())
            })
            .await
            .context("VISA write task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = bytes;
            Err(visa_disabled())
        }
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        #[cfg(feature = "instrument_visa")]
        {
            use std::io::Read;

            let session = self.session()?;
            let read = tokio::task::spawn_blocking(move || {
                let guard = session.blocking_lock();
                let mut buf = vec![0u8; 1024];
                let n = (&*guard).read(&mut buf).context("VISA read failed")?;
                buf.truncate(n);
                Ok::<Vec<u8>, anyhow::Error>(buf)
            });

            tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| anyhow!("Timed out after {}ms waiting for reply", timeout.as_millis()))?
                .context("VISA read task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = timeout;
            Err(visa_disabled())
        }
    }

    fn adapter_type(&self) -> &str {
        "visa"
    }

    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("USB0::0x0957::0x5707::MY53805152::0::INSTR");
        assert_eq!(adapter.adapter_type(), "visa");
        assert!(!adapter.is_connected());
        assert_eq!(adapter.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("GPIB0::10::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_line_terminator("\r\n");

        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.line_terminator, "\r\n");
        assert!(adapter.info().contains("2000ms"));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_connect_without_feature_explains_rebuild() {
        let mut adapter = VisaAdapter::new("GPIB0::10::INSTR");
        let err = adapter.connect().await.unwrap_err();
        assert!(err.to_string().contains("--features instrument_visa"));
    }
}
