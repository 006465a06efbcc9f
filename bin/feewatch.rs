use std::sync::Arc;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use feewatch::{
    chain::{ChainSource, RpcChainSource},
    open_store, CronScheduler, EventBus, Monitor, RedpandaPublisher, Settings,
};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .with_module_level("alloy", LevelFilter::Warn)
        .with_module_level("hyper", LevelFilter::Warn)
        .with_module_level("rdkafka", LevelFilter::Warn)
        .init()
        .context("Failed to initialize logger")?;

    let settings =
        Settings::new().context("Failed to load config.yaml. Please ensure it exists and is valid")?;
    settings.validate().context("Invalid configuration")?;

    let chain: Arc<dyn ChainSource> = Arc::new(
        RpcChainSource::new(&settings.chain.rpc_url, settings.request_timeout())
            .context("Failed to create chain client")?,
    );
    let head = chain
        .latest_block_number()
        .await
        .context("Chain source is unreachable")?;
    info!(
        "Connected to chain {} at {} (head {})",
        settings.chain.chain_id, settings.chain.rpc_url, head
    );

    let store = open_store(&settings)
        .await
        .context("Failed to initialize database connection")?;

    let bus = EventBus::default();
    let cancellation_token = CancellationToken::new();

    let monitor = Arc::new(Monitor::new(&settings, chain, store, bus.clone()).await?);
    monitor.start().await.context("Failed to start monitor")?;

    run_monitor(settings, monitor, bus, cancellation_token).await
}

async fn run_monitor(
    settings: Settings,
    monitor: Arc<Monitor>,
    bus: EventBus,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let forwarder_handle = settings
        .redpanda
        .as_ref()
        .and_then(RedpandaPublisher::new)
        .map(|publisher| {
            let events = bus.subscribe();
            let token = cancellation_token.child_token();
            tokio::spawn(publisher.run(events, token))
        });

    let monitor_token = cancellation_token.child_token();
    let monitor_task = monitor.clone();
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor_task.run(monitor_token).await {
            error!("Monitor failed: {:#}", e);
        }
    });

    let cron_scheduler = CronScheduler::new(monitor.clone(), settings.stats.clone());
    let cron_token = cancellation_token.child_token();
    let cron_handle = tokio::spawn(async move {
        if let Err(e) = cron_scheduler.run(cron_token).await {
            error!("Cron scheduler failed: {:#}", e);
        }
    });

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    info!("Monitor running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    cancellation_token.cancel();

    // The in-flight chunk is finished before the monitor stops
    info!("Waiting for monitor to stop...");
    let _ = monitor_handle.await;

    info!("Waiting for cron scheduler to stop...");
    let _ = cron_handle.await;

    if let Some(handle) = forwarder_handle {
        let _ = handle.await;
    }

    info!("Monitor stopped");
    Ok(())
}
