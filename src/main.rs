//! `karabo-server`: hosts the device classes of one plugin namespace.
//!
//! # Usage
//!
//! ```bash
//! karabo-server serverId=S1 brokerUrl=tcp://broker:7777 \
//!     'init={"d1": {"classId": "PropertyTest", "int32Property": 3}}'
//! karabo-server --config server.toml Logger.priority=debug
//! ```
//!
//! The first SIGINT/SIGTERM shuts the server down gracefully; a second one
//! exits immediately. Losing the broker for good exits with status 2.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use karabo::broker;
use karabo::config::ServerConfig;
use karabo::device::DeviceClasses;
use karabo::event_loop::EventLoop;
use karabo::logging::{self, LoggingConfig};
use karabo::server::{DeviceServer, ShutdownReason};

#[derive(Parser)]
#[command(name = "karabo-server")]
#[command(about = "Device server of the Karabo runtime", long_about = None)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides of the form key=value (serverId=S1, init={...})
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("karabo-server: cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(ShutdownReason::Requested) => ExitCode::SUCCESS,
        Ok(ShutdownReason::BrokerLost) => ExitCode::from(2),
        Err(e) => {
            eprintln!("karabo-server: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ShutdownReason> {
    let config = ServerConfig::load(cli.config.as_deref(), &cli.args)
        .context("loading configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    logging::init(&LoggingConfig::from_server_config(&config)?)?;

    let event_loop = EventLoop::init_global(config.worker_threads);
    let classes = DeviceClasses::for_namespace(&config.plugin_namespace)?;
    let broker = broker::connect(&config.broker)
        .await
        .with_context(|| format!("connecting to broker {}", config.broker.url))?;

    let server = DeviceServer::new(&config, classes, broker);
    tracing::info!(
        server_id = server.server_id(),
        classes = ?server.classes().class_ids(),
        broker = %config.broker.url,
        "starting device server"
    );

    let shutdown = server.clone();
    event_loop.set_signal_handler(move |count| {
        if count > 1 {
            tracing::warn!("second termination signal, exiting now");
            std::process::exit(1);
        }
        let server = shutdown.clone();
        tokio::spawn(async move { server.shutdown().await });
    });

    server.start().await?;
    let reason = server.stopped().await;
    tracing::info!(server_id = server.server_id(), ?reason, "device server stopped");
    Ok(reason)
}
