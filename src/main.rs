use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use compass::{service::Workload, task::Worker, Client, Config, Resolver};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Cli {
    /// JSON deployment file; three loopback resolvers on 6000-6002 otherwise
    #[clap(long)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the resolver replica at this index of the configured list
    Resolver { index: usize },
    /// Run an echo service instance
    Echo { name: String },
    /// Run a clock service instance
    Time { name: String },
    /// Ask the resolvers for one instance of a service
    Resolve { service: u8 },
    /// Run every resolver, one echo and two clock instances in this process
    Launch,
}

#[tokio::main]
async fn main() -> compass::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = Arc::new(config);

    let workers = match cli.mode {
        Mode::Resolver { index } => {
            config.resolver_addr(index)?;
            vec![Resolver::start(index, config)]
        }
        Mode::Echo { name } => vec![Workload::Echo.start(name, config)],
        Mode::Time { name } => vec![Workload::Clock.start(name, config)],
        Mode::Resolve { service } => {
            let mut client = Client::bind(&config).await?;
            match client.resolve(service).await? {
                Some(address) => println!("{address}"),
                None => println!("no instance of service {service}"),
            }
            return Ok(());
        }
        Mode::Launch => launch(config).await?,
    };
    run_until_ctrl_c(workers).await
}

async fn launch(config: Arc<Config>) -> compass::Result<Vec<Worker>> {
    let mut workers = Vec::new();
    info!("launching resolvers");
    for index in 0..config.resolvers.len() {
        let mut resolver = Resolver::start(index, config.clone());
        resolver.ready().await?;
        workers.push(resolver)
    }
    info!("launching services");
    for (workload, name) in [
        (Workload::Echo, "echo:1"),
        (Workload::Clock, "time:1"),
        (Workload::Clock, "time:2"),
    ] {
        let mut service = workload.start(name, config.clone());
        service.ready().await?;
        workers.push(service)
    }
    Ok(workers)
}

async fn run_until_ctrl_c(workers: Vec<Worker>) -> compass::Result<()> {
    let mut finished = JoinSet::new();
    for worker in &workers {
        finished.spawn(worker.finished());
    }
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = finished.join_next() => warn!("worker exited unexpectedly"),
    }
    info!("shutting down");
    let mut result = Ok(());
    // services first, so their agents are gone before the resolvers
    for worker in workers.into_iter().rev() {
        if let Err(err) = worker.stop().await {
            warn!("{err:#}");
            result = Err(err)
        }
    }
    result
}
