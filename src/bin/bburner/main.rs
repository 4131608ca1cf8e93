mod args;
mod handlers;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use backburner::clock::SystemClock;
use backburner::config::Config;
use backburner::dispatcher::Dispatcher;
use backburner::server::Server;
use backburner::store::JobStore;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(error) => {
            error!(error = %format!("{error:#}"), "unusable configuration");
            return ExitCode::from(2);
        },
    };

    // Cancellation on ctrl-c; everything winds down from this one token.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    if let Err(error) = begin(args, config, cancel).await {
        error!(error = %format!("{error:#}"), "encountered runtime error");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if !args.queues.is_empty() {
        config.queues = args.queues.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn begin(
    args: Args,
    config: Config,
    cancel: CancellationToken,
) -> Result<()> {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(match &args.wal_dir {
        Some(dir) => JobStore::open(dir, (&config).into(), clock)
            .await
            .context("opening job store")?,
        None => {
            warn!("no WAL directory given: jobs will not survive a restart");
            JobStore::in_memory((&config).into(), clock)
        },
    });

    let registry = Arc::new(handlers::registry()?);

    let listener = TcpListener::bind((args.listen, args.port))
        .await
        .context("binding listener")?;

    let dispatcher = tokio::spawn(
        Dispatcher::new(Arc::clone(&store), registry, &config)
            .run(cancel.clone()),
    );

    let served = Arc::new(Server::new(store, args.max_job_size))
        .serve(listener, cancel.clone())
        .await;

    // However serving ended, let running jobs finish before exiting.
    cancel.cancel();
    dispatcher.await.context("dispatcher task")?;
    info!("shut down cleanly");

    served
}
