//! `karabo-broker`: standalone TCP hub for servers and clients on several
//! hosts.
//!
//! ```bash
//! karabo-broker --listen 0.0.0.0:7777
//! KARABO_BROKER=tcp://broker-host:7777 karabo-server serverId=S1
//! ```

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use karabo::broker::{TcpHub, HUB_QUEUE_CAPACITY};
use karabo::logging::{self, LoggingConfig};

#[derive(Parser)]
#[command(name = "karabo-broker")]
#[command(about = "Message hub for Karabo instances", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7777")]
    listen: String,

    /// Deliveries queued per client before the hub drops them
    #[arg(long, default_value_t = HUB_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("karabo-broker: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    logging::init(&LoggingConfig::new(logging::parse_log_level(&cli.log_level)?).ansi(false))?;

    let hub = TcpHub::bind_with_capacity(&cli.listen, cli.queue_capacity)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    println!("{}", hub.url());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down broker hub");
    if hub.dropped_frames() > 0 {
        tracing::warn!(dropped = hub.dropped_frames(), "deliveries dropped for slow clients");
    }
    hub.shutdown();
    Ok(())
}
