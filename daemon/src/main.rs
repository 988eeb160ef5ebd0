//! Devscope profiling daemon
//!
//! `serve` runs the daemon until Ctrl-C, `run` profiles one job from the
//! command line, and `print-config` shows the effective configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devscope_daemon::config::DeviceEntry;
use devscope_daemon::controller::DeviceCapabilities;
use devscope_daemon::transport::memory::{MemoryConnector, SimulatedDevice};
use devscope_daemon::transport::tcp::TcpConnector;
use devscope_daemon::transport::Connector;
use devscope_daemon::{metrics, Daemon, DaemonConfig};
use devscope_shared::utils::{parse_duration, parse_key_value};
use devscope_shared::{DeployMode, DeviceId, JobSpec};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long `run` waits for a stopped job to drain.
const RUN_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "devscope-daemon")]
#[command(about = "Host-side accelerator profiling daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "DEVSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Use an in-process simulated device instead of TCP endpoints
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon until interrupted
    Serve,

    /// Profile one job, then exit
    Run(RunArgs),

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Job identifier
    #[arg(long)]
    job_id: String,

    /// Device to profile (repeatable)
    #[arg(short, long = "device", required = true)]
    devices: Vec<DeviceId>,

    /// Deployment mode of the devices
    #[arg(short, long, default_value = "rpc")]
    mode: DeployMode,

    /// Job option forwarded to the device (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    options: Vec<(String, String)>,

    /// How long to profile (e.g., "30s", "5m")
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    duration: Duration,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install().map_err(|e| anyhow::anyhow!("{}", e))?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let mut config = DaemonConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Serve => {
            if cli.simulate && config.devices.is_empty() {
                add_simulated_devices(&mut config, &[0]);
            }
            serve(config, cli.simulate).await
        }
        Commands::Run(args) => {
            if cli.simulate {
                add_simulated_devices(&mut config, &args.devices);
            }
            run(config, cli.simulate, args).await
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn add_simulated_devices(config: &mut DaemonConfig, ids: &[DeviceId]) {
    for &id in ids {
        if config.device(id).is_none() {
            config.devices.push(DeviceEntry {
                id,
                address: "simulated".to_string(),
                capabilities: DeviceCapabilities::default(),
            });
        }
    }
}

fn connector(config: &DaemonConfig, simulate: bool) -> Arc<dyn Connector> {
    if simulate {
        info!("Using simulated devices");
        Arc::new(MemoryConnector::with_codec(
            Arc::new(SimulatedDevice::default()),
            config.transport.codec(),
        ))
    } else {
        Arc::new(TcpConnector::from_config(config))
    }
}

async fn start_daemon(config: DaemonConfig, simulate: bool) -> Result<Arc<Daemon>> {
    let connector = connector(&config, simulate);
    let daemon = tokio::task::spawn_blocking(move || Daemon::start(&config, connector))
        .await
        .context("Daemon startup task failed")??;
    Ok(Arc::new(daemon))
}

async fn stop_daemon(daemon: Arc<Daemon>) -> Result<()> {
    tokio::task::spawn_blocking(move || daemon.shutdown())
        .await
        .context("Daemon shutdown task failed")?;
    debug!("Final metrics:\n{}", metrics::encode_metrics());
    Ok(())
}

async fn serve(config: DaemonConfig, simulate: bool) -> Result<()> {
    let daemon = start_daemon(config, simulate).await?;
    info!("Serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    stop_daemon(daemon).await
}

async fn run(config: DaemonConfig, simulate: bool, args: RunArgs) -> Result<()> {
    let daemon = start_daemon(config, simulate).await?;

    let mut spec = JobSpec::new(args.job_id.clone(), args.devices.clone()).with_mode(args.mode);
    for (key, value) in args.options {
        spec = spec.with_option(key, value);
    }

    let manager = Arc::clone(daemon.manager());
    let launched = tokio::task::spawn_blocking(move || manager.handle(spec))
        .await
        .context("Job launch task failed")?;
    if let Err(e) = launched {
        stop_daemon(daemon).await?;
        return Err(e).with_context(|| format!("Job {} was not started", args.job_id));
    }
    info!(
        job_id = %args.job_id,
        devices = ?args.devices,
        "Profiling for {:?}",
        args.duration
    );

    tokio::select! {
        _ = tokio::time::sleep(args.duration) => info!("Duration elapsed"),
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
    }

    let manager = Arc::clone(daemon.manager());
    let job_id = args.job_id.clone();
    let drained = tokio::task::spawn_blocking(move || {
        if let Err(e) = manager.stop_task(&job_id) {
            warn!("Stop failed: {}", e);
        }
        manager.wait_task(&job_id, RUN_DRAIN_TIMEOUT)
    })
    .await
    .context("Job stop task failed")?;
    if !drained {
        warn!(job_id = %args.job_id, "Job did not finish within {:?}", RUN_DRAIN_TIMEOUT);
    }

    stop_daemon(daemon).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse_mode_and_options() {
        let cli = Cli::try_parse_from([
            "devscope-daemon",
            "run",
            "--job-id",
            "JOB1",
            "-d",
            "0",
            "-d",
            "1",
            "--mode",
            "SOC",
            "--set",
            "metrics=ai_core",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.devices, vec![0, 1]);
        assert_eq!(args.mode, DeployMode::Soc);
        assert_eq!(args.options, vec![("metrics".to_string(), "ai_core".to_string())]);
        assert_eq!(args.duration, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let parsed = Cli::try_parse_from([
            "devscope-daemon", "run", "--job-id", "JOB1", "-d", "0", "--mode", "cloud",
        ]);
        assert!(parsed.is_err());
    }
}
