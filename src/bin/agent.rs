use std::sync::Arc;

use clap::Parser;
use host_agent::{
    collectors::Collectors,
    config::{Config, read_config_file},
    context::AgentContext,
    executors::default_executors,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file; built-in defaults are used when omitted
    #[arg(short, long)]
    file: Option<String>,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("host_agent", LevelFilter::DEBUG),
        ("agent", LevelFilter::TRACE),
        ("tower_http", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(path) => read_config_file(path)?,
        None => Config::default(),
    }
    .with_env_overrides();

    let collectors = Collectors::host(&config.executors);
    let executors = default_executors(&config.executors);
    let agent = Arc::new(AgentContext::start(config, collectors, executors)?);

    #[cfg(feature = "api")]
    {
        use host_agent::api::{ApiState, spawn_api_server};

        let addr =
            spawn_api_server(agent.config.api.clone(), ApiState::new(agent.clone())).await?;
        info!("serving on http://{addr}");
    }

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");

    agent.shutdown().await;

    Ok(())
}
