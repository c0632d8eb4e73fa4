use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{
    cli::{self, Parser},
    trace,
};
use coordination::{
    CoordinationClient, MemoryCluster, Registry, RegistryOptions, ZkConnector,
};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tracing::*;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.copresence_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start agent"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let coordination = config.coordination()?;
    let node_id = config.effective_node_id();
    let address = match &config.address {
        Some(address) => address.clone(),
        None => config::local_ip(config.ipv6)
            .map(|ip| ip.to_string())
            .ok_or_else(|| anyhow!("no usable local address found, pass --address"))?,
    };
    info!(%node_id, %address, env = %coordination.env, service = %config.service_name, "using identity");

    let client = CoordinationClient::new(coordination).context("invalid coordination config")?;
    if config.in_memory {
        info!("using in-memory coordination service");
        client.connect(&MemoryCluster::new().connector()).await
    } else {
        client.connect(&ZkConnector).await
    }
    .context("failed to open coordination session")?;

    let registry = Registry::start(
        client.clone(),
        RegistryOptions::default()
            .with_service_name(config.service_name.clone())
            .with_member(node_id, address),
    )
    .context("failed to start registry")?;

    let token = CancellationToken::new();
    let reporter = spawn_report_task(
        registry.clone(),
        client.clone(),
        Duration::from_secs(config.report_interval.max(1)),
        token.clone(),
    );

    shutdown_signal(token).await?;
    info!("shutting down");
    registry.shutdown().await;
    if let Err(err) = reporter.await {
        error!(?err, "error waiting for report task");
    }
    client
        .close()
        .await
        .context("failed to close coordination session")?;
    Ok(())
}

fn spawn_report_task(
    registry: Registry,
    client: CoordinationClient,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("report task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let nodes = registry.node_entries();
                    let pending = client.pending_ensures().await;
                    let stale = registry.directory().is_stale();
                    match registry.global_keys().await {
                        Ok(globals) => info!(?nodes, ?globals, pending, stale, "directory report"),
                        Err(err) => warn!(?err, ?nodes, pending, stale, "directory report, globals unavailable"),
                    }
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
