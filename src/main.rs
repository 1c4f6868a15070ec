//! ppspec - pump-probe STM sequencer
//!
//! ```text
//! ppspec run --config lab.toml --queue queue.toml
//! ppspec waveform --amp 0.6 --width 10e-9 --edge 3e-9 --time-spread 100e-9
//! ppspec check --config lab.toml
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ppspec::config::{FailurePolicy, Settings};
use ppspec::experiment::events::TracingObserver;
use ppspec::experiment::plan::QueuePlan;
use ppspec::experiment::{ObserverSet, Pulse, QueueSequencer};
use ppspec::session::Session;
use ppspec::waveform::{normalize_unit, synthesize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ppspec")]
#[command(about = "Pump-probe STM experiment sequencer")]
#[command(version)]
struct Cli {
    /// Settings file (TOML). Environment variables prefixed PPSPEC_ override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every experiment of a queue file.
    Run {
        /// Queue description (TOML).
        #[arg(short, long)]
        queue: PathBuf,

        /// Directory for CSV results; defaults to application.data_dir.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overrides queue.on_failure.
        #[arg(long, value_enum)]
        on_failure: Option<OnFailure>,

        /// Free-text comment stored in every result file.
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Print the synthesized, normalized buffer for one pulse.
    Waveform {
        #[arg(long, default_value_t = 1.0)]
        amp: f64,
        #[arg(long)]
        width: f64,
        #[arg(long)]
        edge: f64,
        #[arg(long)]
        time_spread: f64,
    },
    /// Connect to every instrument and report.
    Check,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnFailure {
    Abort,
    SkipAndContinue,
}

impl From<OnFailure> for FailurePolicy {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::Abort => FailurePolicy::Abort,
            OnFailure::SkipAndContinue => FailurePolicy::SkipAndContinue,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match cli.command {
        Command::Run {
            queue,
            output,
            on_failure,
            comment,
        } => run_queue(&settings, &queue, output, on_failure, comment).await,
        Command::Waveform {
            amp,
            width,
            edge,
            time_spread,
        } => {
            if !(time_spread > 0.0) {
                bail!("--time-spread must be positive");
            }
            let pulse = Pulse::new(amp, width, edge, time_spread);
            settings.waveform.check_pulse(&pulse)?;
            for sample in normalize_unit(&synthesize(&pulse, &settings.waveform)) {
                println!("{sample}");
            }
            Ok(())
        }
        Command::Check => {
            let mut session = Session::from_settings(&settings);
            let connected = session.connect_all().await;
            session.disconnect_all().await;
            match connected {
                Ok(()) => {
                    info!("All instruments reachable");
                    Ok(())
                }
                Err(e) => bail!(e.report()),
            }
        }
    }
}

async fn run_queue(
    settings: &Settings,
    queue_path: &Path,
    output: Option<PathBuf>,
    on_failure: Option<OnFailure>,
    comment: String,
) -> Result<()> {
    let plan = QueuePlan::load(queue_path, &settings.waveform)?;
    let mut queue = plan.into_procedures();

    let mut observers = ObserverSet::new().with(Arc::new(TracingObserver));
    #[cfg(feature = "storage_csv")]
    {
        let dir = output.unwrap_or_else(|| settings.application.data_dir.clone());
        info!(dir = %dir.display(), "Saving results");
        observers.push(Arc::new(
            ppspec::storage::CsvRecorder::new(dir).with_comment(comment),
        ));
    }
    #[cfg(not(feature = "storage_csv"))]
    {
        let _ = (output, comment);
        warn!("Built without storage_csv; results are not saved");
    }

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping after the current sample");
            stop.cancel();
        }
    });

    let mut session = Session::from_settings(settings);
    let mut sequencer = QueueSequencer::new(settings);
    if let Some(policy) = on_failure {
        sequencer = sequencer.with_policy(policy.into());
    }

    let result = sequencer
        .run(&mut session, &mut queue, &observers, &cancel)
        .await;
    sequencer.reset(&mut session).await;
    let report = result?;

    let remaining: usize = queue.iter().map(|p| p.experiments.len()).sum();
    info!(
        completed = report.completed,
        failed = report.failed,
        remaining,
        "Done"
    );
    if !report.is_clean() {
        bail!(
            "{} experiment(s) failed; last: {}",
            report.failed,
            report.last_error.unwrap_or_default()
        );
    }
    Ok(())
}
