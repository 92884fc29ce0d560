//! `bridgetester`: CLI entrypoint. Publishes probe messages to Q_IN,
//! consumes Q_OUT, and reports round-trip reconciliation either as plain
//! log lines or one of two visual modes.

mod guard;
mod tester;
mod tracker;
mod ui;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use lib_common::Settings;

use tester::BridgeTester;
use ui::Display;

/// MQ to WebSocket Bridge Tester.
#[derive(Debug, Parser)]
#[command(name = "bridgetester", version, about)]
struct Cli {
    /// Displays a tabular view of when messages are sent/received and elapsed time.
    #[arg(short, long)]
    visual: bool,

    /// Displays a dot-graph view of which messages have been reconciled.
    #[arg(short, long = "graph")]
    graph: bool,

    /// Number of test messages to send before quitting.
    #[arg(short, long = "number", default_value_t = 8)]
    number: u32,

    /// Seconds to delay between messages.
    #[arg(short, long = "delay", default_value_t = 1.0)]
    delay: f64,

    /// Exclusive mode: ack (and drop) any unrecognized inbound message
    /// instead of rejecting it with requeue. Good for draining stale runs,
    /// bad for production.
    #[arg(short = 'x', long)]
    exclusive: bool,

    /// Seconds to wait at the end for outstanding messages to reconcile.
    #[arg(short, long = "end-delay", default_value_t = 30)]
    end_delay: u64,

    /// Write bodies of messages never reconciled to this file.
    #[arg(short, long = "report")]
    report: Option<PathBuf>,

    /// Suppress status lines about messages that aren't our own.
    #[arg(short, long)]
    focused: bool,

    /// Config file to use.
    #[arg(short, long = "config", default_value = "mq2wsbridge.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if !cli.visual && !cli.graph {
        fern::Dispatch::new()
            .format(|out, message, record| out.finish(format_args!("{} {}", record.level(), message)))
            .level(log::LevelFilter::Info)
            .chain(std::io::stdout())
            .apply()
            .ok();
    }

    let settings = Settings::load_ini(&cli.config)?;
    let tester = BridgeTester::new(settings, cli.exclusive, cli.focused);

    let consume_handle = tokio::spawn(tester.clone().consume_replies());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut display = if cli.visual || cli.graph { Some(Display::new()?) } else { None };

    let delay = Duration::from_secs_f64(cli.delay.max(0.0));
    let send = tokio::spawn({
        let tester = tester.clone();
        async move {
            tester.send_probes(cli.number, delay).await;
        }
    });
    send.await?;

    // Wait for stragglers to reconcile, refreshing the display each tick,
    // the same 0.1s spin `main()`'s end-delay loop uses.
    let mut remaining = Duration::from_secs(cli.end_delay);
    let tick = Duration::from_millis(100);
    loop {
        let (total, reconciled) = {
            let mut tracker = tester.tracker.lock().await;
            let reconciled = tracker.reconciled_count();
            if let Some(display) = display.as_mut() {
                if cli.graph {
                    display.render_graph(&tracker, reconciled)?;
                } else {
                    display.render_table(&tracker, reconciled)?;
                }
            }
            (tracker.total(), reconciled)
        };
        if reconciled == total || remaining.is_zero() {
            break;
        }
        tokio::time::sleep(tick.min(remaining)).await;
        remaining = remaining.saturating_sub(tick);
    }

    log::info!("all done testing, closing things out...");
    tester.close().await;
    let _ = consume_handle.await;

    let reconciled = tester.tracker.lock().await.reconciled_count();
    let total = tester.tracker.lock().await.total();
    println!("Number of messages reconciled: {reconciled} of {total}");

    if let Some(report_path) = &cli.report {
        let bodies = tester.tracker.lock().await.unreconciled_bodies();
        let contents = bodies.join("\n");
        std::fs::write(report_path, contents)?;
    }

    drop(display);
    Ok(())
}
