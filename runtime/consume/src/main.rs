use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use switchboard_consume::{build_responder, load_routes_file, HandlerCatalog, RouteBinding};
use switchboard_core::logging::{init_tracing, LogFormat};
use switchboard_core::RpcConfig;
use switchboard_fabric::transport::AmqpBroker;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Serve rpc requests for one endpoint", long_about = None)]
struct Cli {
    /// Endpoint name from the configuration, or a raw queue name
    endpoint: String,

    #[arg(long = "route", value_name = "ROUTE=HANDLER", help = "Bind a route to a named handler")]
    routes: Vec<RouteBinding>,

    #[arg(long, value_name = "FILE", help = "TOML file with a [routes] table")]
    routes_file: Option<PathBuf>,

    #[arg(long, value_name = "FILE", env = "SWITCHBOARD_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the log output format")]
    log_format: Option<CliLogFormat>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RpcConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing("switchboard-consume", &config.logging)?;

    let file_routes = match &cli.routes_file {
        Some(path) => load_routes_file(path)?,
        None => Vec::new(),
    };
    let catalog = HandlerCatalog::builtin();
    let responder = build_responder(&cli.endpoint, &config, &file_routes, &cli.routes, &catalog)?;

    let broker = AmqpBroker::builder()
        .uri(config.broker.uri.clone())
        .connect_timeout(config.broker.connect_timeout())
        .build();

    info!(
        endpoint = %cli.endpoint,
        queue = %responder.queue(),
        routes = ?responder.routes().names(),
        "starting responder"
    );

    responder
        .consume_until(&broker, async {
            if let Err(err) = signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("ctrl-c received");
        })
        .await?;

    info!("responder stopped");
    Ok(())
}
