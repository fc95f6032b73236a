use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use assignment_coordination::etcd::{EtcdBackend, EtcdConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use datastream_coordination::config::Config;
use datastream_coordination::connector::{ConnectorBindings, ConnectorRegistry, NoopEventSink};
use datastream_coordination::coordinator::Coordinator;
use datastream_coordination::types::WorkerId;

fn init_tracing(config: &Config) {
    let log_layer = if config.log_format == "json" {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

fn setup_metrics(config: &Config) -> Result<()> {
    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .context("Invalid METRICS_BIND_ADDRESS")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install metrics exporter")?;
    info!(%addr, "serving prometheus metrics");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    init_tracing(&config);
    info!("Starting datastream coordinator");
    info!("Configuration loaded: {:?}", config);

    if config.export_prometheus {
        setup_metrics(&config)?;
    }

    let keys = config.cluster_prefix()?;
    let registry = ConnectorRegistry::with_builtin();
    let bindings = ConnectorBindings::from_config(
        &registry,
        &config.connector_type_list(),
        &config.connector_strategy_map()?,
    )
    .context("Failed to bind connectors")?;

    let backend = EtcdBackend::connect(EtcdConfig {
        endpoints: config.etcd_endpoint_list(),
        connect_timeout: config.connect_timeout(),
    })
    .await
    .context("Failed to connect to etcd")?;

    let worker_id = WorkerId::generate();
    info!(worker = %worker_id, prefix = keys.prefix(), "joining cluster");

    let coordinator = Arc::new(Coordinator::new(
        Arc::new(backend),
        keys,
        worker_id,
        bindings,
        Arc::new(NoopEventSink),
        config.coordinator_config(),
    ));

    let cancel = CancellationToken::new();
    let mut run_handle = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let cancel = cancel.clone();
        async move { coordinator.run(cancel).await }
    });

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            cancel.cancel();
            run_handle
                .await
                .context("Coordinator task panicked")?
                .context("Coordinator failed during shutdown")?;
        }
        result = &mut run_handle => {
            result
                .context("Coordinator task panicked")?
                .context("Coordinator exited")?;
        }
    }

    info!("datastream coordinator stopped");
    Ok(())
}
