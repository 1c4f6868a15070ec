//! The three instruments a pump-probe run needs, owned together.
//!
//! A [`Session`] is built once, either from [`Settings`] (real drivers over
//! TCP or VISA) or from any three trait objects (simulated instruments in
//! tests). The runner borrows it mutably for the duration of one experiment.

use crate::adapters::{TcpAdapter, Transport, VisaAdapter};
use crate::config::{AwgTransport, Settings, StmModel};
use crate::error::AppResult;
use crate::instrument::{
    Awg, Instrument, Keysight33600A, LockIn, RhkR9, SignalRecovery7265, Stm,
};
use tracing::{info, warn};

pub struct Session {
    pub awg: Box<dyn Awg>,
    pub lockin: Box<dyn LockIn>,
    pub stm: Box<dyn Stm>,
}

impl Session {
    pub fn new(awg: Box<dyn Awg>, lockin: Box<dyn LockIn>, stm: Box<dyn Stm>) -> Self {
        Self { awg, lockin, stm }
    }

    /// Builds the configured drivers. Nothing is connected yet.
    pub fn from_settings(settings: &Settings) -> Self {
        let awg_cfg = &settings.awg;
        let awg_link: Box<dyn Transport> = match awg_cfg.transport {
            AwgTransport::Visa => Box::new(
                VisaAdapter::new(awg_cfg.resource.clone()).with_timeout(awg_cfg.timeout),
            ),
            AwgTransport::Tcp => Box::new(
                TcpAdapter::new(awg_cfg.address.clone(), awg_cfg.port)
                    .with_timeout(awg_cfg.timeout)
                    .with_reply_terminator(Some("\n".to_string())),
            ),
        };
        let awg = Keysight33600A::new(awg_link)
            .with_timeout(awg_cfg.timeout)
            .with_reset_settle(awg_cfg.reset_settle);

        let lockin_cfg = &settings.lockin;
        let lockin_link = TcpAdapter::new(lockin_cfg.address.clone(), lockin_cfg.port)
            .with_timeout(lockin_cfg.timeout)
            .with_line_terminator(lockin_cfg.terminator.clone())
            .with_reply_terminator(lockin_cfg.reply_terminator.clone());
        let lockin = SignalRecovery7265::new(Box::new(lockin_link))
            .with_timeout(lockin_cfg.timeout)
            .with_read_command(lockin_cfg.read_command.clone())
            .with_setup_commands(lockin_cfg.setup_commands.clone())
            .with_settling(lockin_cfg.reset_settle, lockin_cfg.command_spacing);

        let stm_cfg = &settings.stm;
        let stm: Box<dyn Stm> = match stm_cfg.model {
            StmModel::RhkR9 => {
                let link = TcpAdapter::new(stm_cfg.address.clone(), stm_cfg.port)
                    .with_timeout(stm_cfg.timeout)
                    .with_line_terminator(stm_cfg.terminator.clone())
                    .with_reply_terminator(Some("\n".to_string()));
                Box::new(RhkR9::new(Box::new(link)).with_timeout(stm_cfg.timeout))
            }
        };

        Self::new(Box::new(awg), Box::new(lockin), stm)
    }

    /// Connects every instrument that is not connected yet.
    ///
    /// The first transport failure is returned; instruments connected before
    /// it stay connected.
    pub async fn connect_all(&mut self) -> AppResult<()> {
        connect(self.awg.as_mut()).await?;
        connect(self.lockin.as_mut()).await?;
        connect(self.stm.as_mut()).await
    }

    /// Closes all three links. Failures are logged and otherwise ignored.
    pub async fn disconnect_all(&mut self) {
        close(self.awg.as_mut()).await;
        close(self.lockin.as_mut()).await;
        close(self.stm.as_mut()).await;
    }
}

async fn connect<D: Instrument + ?Sized>(device: &mut D) -> AppResult<()> {
    if device.is_connected() {
        return Ok(());
    }
    let kind = device.kind();
    device
        .connect()
        .await
        .expected(&format!("{kind} connection failed."))
        .into_result(kind)?;
    info!("[{kind}] Connected");
    Ok(())
}

async fn close<D: Instrument + ?Sized>(device: &mut D) {
    let kind = device.kind();
    let outcome = device.close().await;
    if outcome.failed() {
        warn!("[{kind}] Close failed: {}", outcome.message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{MockAwg, MockLockIn, MockStm, StmCall};

    #[tokio::test]
    async fn test_connect_all_stops_at_first_refusal() {
        let (awg, lockin, stm) = (MockAwg::new(), MockLockIn::new(), MockStm::new());
        stm.set_unreachable(true);
        let mut session = Session::new(
            Box::new(awg.clone()),
            Box::new(lockin.clone()),
            Box::new(stm.clone()),
        );

        let err = session.connect_all().await.unwrap_err();
        assert!(err.is_transport());
        assert!(awg.is_connected());
        assert!(lockin.is_connected());
        assert_eq!(stm.calls(), vec![StmCall::Connect]);
    }

    #[tokio::test]
    async fn test_connect_all_skips_connected() {
        let (awg, lockin, stm) = (MockAwg::new(), MockLockIn::new(), MockStm::new());
        let mut session = Session::new(
            Box::new(awg.clone()),
            Box::new(lockin.clone()),
            Box::new(stm.clone()),
        );
        session.connect_all().await.unwrap();
        session.connect_all().await.unwrap();
        assert_eq!(stm.calls(), vec![StmCall::Connect]);

        session.disconnect_all().await;
        assert!(!awg.is_connected());
        assert!(!stm.is_connected());
    }

    #[test]
    fn test_from_settings_builds_unconnected_drivers() {
        let mut settings = Settings::default();
        settings.awg.transport = AwgTransport::Tcp;
        let session = Session::from_settings(&settings);
        assert!(!session.awg.is_connected());
        assert!(!session.lockin.is_connected());
        assert!(!session.stm.is_connected());
    }
}
