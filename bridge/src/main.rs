//! `mq2wsbridge`: CLI entrypoint. Resolves [`Settings`] from an INI file or
//! the parameter store, wires up logging, and hands off to the
//! [`BridgeSupervisor`] until a signal, `--runsecs`, or an internal failure
//! ends the run.

mod broker;
mod metrics;
mod model;
mod signing;
mod stub;
mod supervisor;
mod websocket;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

use lib_common::logging::{self, CloudWatchSink};
use lib_common::paramstore::HttpParamStore;
use lib_common::Settings;

use supervisor::BridgeSupervisor;

/// Bridges an AMQP-style broker and a signed-URL WebSocket endpoint.
#[derive(Debug, Parser)]
#[command(name = "mq2wsbridge", version, about)]
struct Cli {
    /// Exit automatically after this many seconds; 0 runs until a
    /// shutdown signal arrives instead.
    #[arg(long, default_value_t = 60)]
    runsecs: u64,

    /// Enable info-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug-level logging (implies --verbose).
    #[arg(short, long)]
    debug: bool,

    /// Path to the INI configuration file. Ignored when --ssm is set.
    #[arg(short = 'c', long, value_name = "PATH", default_value = "mq2wsbridge.ini")]
    config: PathBuf,

    /// Parameter-store region/endpoint to load configuration from instead
    /// of an INI file.
    #[arg(short = 'r', long = "ssm-region", value_name = "ENDPOINT")]
    ssm_region: Option<String>,

    /// Read configuration from the parameter store (requires --ssm-region).
    #[arg(short = 's', long)]
    ssm: bool,

    /// One-shot: copy --config's INI file into the parameter store, then
    /// exit without starting the bridge.
    #[arg(short = 'M', long = "migrate-config")]
    migrate_config: bool,

    /// Run with the in-process WebSocket stub instead of a live connection.
    #[arg(short = 'X', long = "websocket-stub")]
    websocket_stub: bool,

    /// CloudWatch-like log sink endpoint; omit to log to stdout.
    #[arg(short = 'l', long = "cloudwatch-logs", value_name = "ENDPOINT")]
    cloudwatch_logs: Option<String>,

    /// CloudWatch-like metrics sink endpoint; omit to disable metrics.
    #[arg(short = 'm', long = "cloudwatch-metrics", value_name = "ENDPOINT")]
    cloudwatch_metrics: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mq2wsbridge: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.migrate_config {
        let region = cli
            .ssm_region
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--migrate-config requires --ssm-region"))?;
        let store = HttpParamStore::new(ssm_endpoint(region), region);
        Settings::migrate_ini_to_ssm(&cli.config, &store).await?;
        println!("migrated {} into the parameter store at {region}", cli.config.display());
        return Ok(());
    }

    let settings = resolve_settings(&cli).await?;

    let cloudwatch_logs = cli.cloudwatch_logs.as_ref().map(|endpoint| {
        CloudWatchSink::new(
            endpoint,
            settings.cw_log_group.clone().unwrap_or_default(),
            settings.cw_log_stream.clone().unwrap_or_default(),
        )
    });
    logging::init(cli.verbose, cli.debug, cloudwatch_logs);
    log::info!("mq2wsbridge starting up");

    let metrics_sink = cli.cloudwatch_metrics.as_ref().map(|endpoint| {
        metrics::MetricsSink::new(endpoint, settings.cw_metrics_namespace.clone().unwrap_or_default())
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    spawn_signal_handlers(shutdown_tx);

    let mut supervisor = BridgeSupervisor::new(settings, cli.websocket_stub, metrics_sink);
    if !supervisor.start().await {
        log::info!("Exiting");
        anyhow::bail!("bridge failed to come up");
    }
    let run_secs = if cli.runsecs == 0 { None } else { Some(cli.runsecs) };
    supervisor.run(run_secs, shutdown_rx).await;

    log::info!("Exiting");
    Ok(())
}

async fn resolve_settings(cli: &Cli) -> anyhow::Result<Settings> {
    if cli.ssm {
        let region = cli
            .ssm_region
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--ssm requires --ssm-region"))?;
        let store = HttpParamStore::new(ssm_endpoint(region), region);
        Ok(Settings::load_ssm(&store).await?)
    } else {
        Ok(Settings::load_ini(&cli.config)?)
    }
}

/// Builds the SSM-compatible HTTPS endpoint from a bare region name, the
/// same convention `Settings::broker_url()` uses for the broker host.
fn ssm_endpoint(region: &str) -> String {
    format!("https://ssm.{region}.amazonaws.com")
}

/// Installs handlers for SIGTERM/SIGINT/SIGHUP that each trigger the same
/// shutdown broadcast, so the Supervisor treats every signal identically.
fn spawn_signal_handlers(shutdown_tx: broadcast::Sender<()>) {
    for kind in [SignalKind::terminate(), SignalKind::interrupt(), SignalKind::hangup()] {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = signal(kind) else {
                log::warn!("failed to install handler for {kind:?}");
                return;
            };
            if stream.recv().await.is_some() {
                log::info!("received {kind:?}; requesting shutdown");
                let _ = shutdown_tx.send(());
            }
        });
    }
}
