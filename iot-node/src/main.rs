// iot-node: run one simulated sensor or meter until Ctrl+C / SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use iot_core::{CsvReadingLog, FileLog, LogSink, SineReading, TracingSink};
use iot_node::config::{self, Overrides};
use iot_node::{Device, Role};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "iot-node", version, about = "Simulated IoT sensor or meter")]
struct Cli {
    /// Config file. Defaults to ~/.config/iot-testbed/config.toml, then
    /// /etc/iot-testbed/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report water and power readings to meters.
    Sensor {
        #[arg(long, default_value = "A1")]
        name: String,
        /// Maximum water reading.
        #[arg(long, default_value_t = 10.0)]
        water: f64,
        /// Maximum power reading.
        #[arg(long, default_value_t = 10.0)]
        power: f64,
        #[command(flatten)]
        common: Common,
    },
    /// Collect sensor reports into per-sensor CSV files.
    Meter {
        #[arg(long, default_value = "M1")]
        name: String,
        /// Directory for the CSV files.
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Args, Debug)]
struct Common {
    #[arg(long)]
    inbound_port: Option<u16>,
    #[arg(long)]
    outbound_port: Option<u16>,
    /// Seconds between periodic cycles.
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long)]
    bind: Option<String>,
    /// Also append network events to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Echo network events to the console as they happen.
    #[arg(long)]
    live_log: bool,
    /// Hosts to dial at startup.
    peers: Vec<String>,
}

impl Common {
    fn overrides(&self, log_dir: Option<PathBuf>) -> Overrides {
        Overrides {
            inbound_port: self.inbound_port,
            outbound_port: self.outbound_port,
            interval_secs: self.interval,
            bind_addr: self.bind.clone(),
            log_dir,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    let env = Overrides::from_env()?;

    let (role, name, common, cli_overrides) = match &cli.command {
        Command::Sensor { name, common, .. } => {
            (Role::Sensor, name, common, common.overrides(None))
        }
        Command::Meter {
            name,
            log_dir,
            common,
        } => (Role::Meter, name, common, common.overrides(log_dir.clone())),
    };
    cfg.apply(role, &env);
    cfg.apply(role, &cli_overrides);

    let mut device = Device::new(cfg.device(role, name, common.peers.clone()));
    match &cli.command {
        Command::Sensor { water, power, .. } => {
            device = device.with_readings(Arc::new(SineReading::new(*water, *power)));
        }
        Command::Meter { .. } => {
            std::fs::create_dir_all(&cfg.log_dir)
                .with_context(|| format!("creating log dir {}", cfg.log_dir.display()))?;
            device = device.with_reading_log(Arc::new(CsvReadingLog::new(cfg.log_dir.clone())));
        }
    }
    let file_log = match &common.log_file {
        Some(path) => {
            let log = FileLog::open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let log = Arc::new(log);
            device = device.with_log_sink(log.clone() as Arc<dyn LogSink>);
            Some(log)
        }
        None => None,
    };
    if common.live_log {
        device = device.with_log_sink(Arc::new(TracingSink::new(name.clone())));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let running = device.start().await?;
        info!(port = running.local_port(), "{} {} running; Ctrl+C to stop", role.as_str(), name);

        let flusher = file_log.clone().map(|log| {
            let interval = cfg.device(role, name, Vec::new()).interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = log.write() {
                        warn!(path = %log.path().display(), error = %e, "failed to write log file");
                    }
                }
            })
        });

        shutdown_signal().await?;
        info!("shutting down");
        running.shutdown().await;
        if let Some(flusher) = flusher {
            flusher.abort();
        }
        if let Some(log) = &file_log {
            log.write()
                .with_context(|| format!("writing log file {}", log.path().display()))?;
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
