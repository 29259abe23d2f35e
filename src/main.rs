//! netprobe - continuously probe network targets and report their health.
//!
//! Targets come from the command line and `NETPROBE_TARGETS`; everything
//! else is configured through the environment (see [`RuntimeConfig`]).

use std::time::Duration;

use netprobe::config::RuntimeConfig;
use netprobe::{event_channel, MetricsManager, ProbeManager, ProberSettings, SortKey, SortOrder};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netprobe=info".parse()?))
        .init();

    let mut cfg = RuntimeConfig::load();
    cfg.targets.extend(std::env::args().skip(1));
    if cfg.targets.is_empty() {
        return Err("no targets given; pass them as arguments or set NETPROBE_TARGETS".into());
    }

    let settings = match &cfg.probers_path {
        Some(path) => {
            tracing::info!("Loading prober settings from {}", path.display());
            ProberSettings::from_json_file(path)?
        }
        None => ProberSettings::default(),
    };

    let (events_tx, events_rx) = event_channel();
    let mut manager = ProbeManager::new(settings, events_tx);
    for route in manager.route_targets(&cfg.targets)? {
        tracing::info!("{} -> {} prober", route.display, route.prober);
    }

    let metrics = MetricsManager::new(cfg.history_size);
    let consumer = metrics.subscribe(events_rx);

    let shutdown = manager.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            shutdown.shutdown();
        }
    });

    let reporter = tokio::spawn(report(metrics.clone(), cfg.report_interval));

    let result = manager.run(cfg.interval, cfg.timeout).await;
    reporter.abort();
    // Every sender is gone once the manager returns
    consumer.await?;

    let summary = metrics.sorted(SortKey::Host, SortOrder::Ascending);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    result?;
    Ok(())
}

/// Log a one-line summary per target every `every`.
async fn report(metrics: MetricsManager, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        for m in metrics.sorted(SortKey::Host, SortOrder::Ascending) {
            tracing::info!(
                "{}: sent={} ok={} fail={} loss={:.1}% last={:?} avg={:?} best={:?} worst={:?}",
                m.key,
                m.total_sent,
                m.successful,
                m.failed,
                m.loss_percent,
                m.last_rtt,
                m.avg_rtt,
                m.min_rtt,
                m.max_rtt
            );
        }
    }
}
