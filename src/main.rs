//! Predictive scaler entry point
//!
//! Parses configuration, builds the AWS session and the component graph,
//! then runs the controller and the dashboard server until SIGINT/SIGTERM.

use clap::Parser;
use futures_util::FutureExt;
use predictive_scaler::config::{CliArgs, Config, ConfigCell};
use predictive_scaler::history::{DynamoSnapshotStore, SnapshotStore};
use predictive_scaler::metrics::MetricsEngine;
use predictive_scaler::scaler::{RuntimeState, Scaler, ScalingExecutor};
use predictive_scaler::server::{self, AppState, BroadcastBus};
use predictive_scaler::types::{kind, Broadcast};
use predictive_scaler::{AwsCloudProvider, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let log_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Scaler failed");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        cluster = %config.cluster_identifier,
        region = %config.region,
        min = config.min_instances,
        max = config.max_instances,
        target_cpu = config.target_cpu_util,
        "Starting predictive scaler"
    );

    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;

    let provider = Arc::new(AwsCloudProvider::new(&sdk_config, &config.cluster_identifier));
    let store: Arc<dyn SnapshotStore> = Arc::new(DynamoSnapshotStore::new(&sdk_config).await?);

    let state = RuntimeState::new(config.plan_ahead_time);
    let shared_config = ConfigCell::new(config.clone());
    let (bus, bus_handle) = BroadcastBus::start();

    let engine = Arc::new(MetricsEngine::new(provider.clone(), shared_config.clone()));
    let executor = ScalingExecutor::new(
        provider.clone(),
        shared_config.clone(),
        state.clone(),
        bus.clone(),
    );
    let scaler = Scaler::new(
        shared_config.clone(),
        state.clone(),
        engine.clone(),
        engine,
        executor,
        store.clone(),
        bus.clone(),
    );

    // the bus never references the controller; main wires the seed hook in
    // after both exist
    install_connect_hook(&bus, shared_config.clone(), store.clone(), state.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_state = AppState {
        bus: bus.clone(),
        config: shared_config.clone(),
        store: store.clone(),
        runtime: state.clone(),
    };
    let server_port = shared_config.get().server_port;
    let server_handle = tokio::spawn(server::run_server(
        server_state,
        server_port,
        shutdown_rx.clone(),
    ));

    let controller_handle = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scaler.run(shutdown_rx).await })
    };

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_handle.await {
        warn!(error = %e, "Controller task ended abnormally");
    }
    bus.shutdown().await;
    if let Err(e) = bus_handle.await {
        warn!(error = %e, "Bus dispatcher ended abnormally");
    }
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Server ended with error"),
        Err(e) => warn!(error = %e, "Server task ended abnormally"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Seed every new dashboard client with the live config and a day of
/// history before it joins the broadcast stream
async fn install_connect_hook(
    bus: &BroadcastBus,
    config: predictive_scaler::SharedConfig,
    store: Arc<dyn SnapshotStore>,
    state: Arc<RuntimeState>,
) {
    bus.set_connect_hook(Arc::new(move || {
        let config = config.clone();
        let store = store.clone();
        let state = state.clone();
        async move {
            let snapshot_config = config.get();
            let cluster = snapshot_config.cluster_identifier.clone();
            let now = chrono::Utc::now();

            let mut seeds = vec![Broadcast::new(kind::CONFIG, &snapshot_config)];
            match store.seed_history(&cluster, now).await {
                Ok(history) => {
                    seeds.push(Broadcast::new(kind::CLUSTER_STATUS_HISTORY, &history));
                }
                Err(e) => warn!(error = %e, "Could not load history seed"),
            }
            match store
                .prediction_snapshots(&cluster, now, state.plan_ahead.get())
                .await
            {
                Ok(predictions) => {
                    seeds.push(Broadcast::new(
                        kind::CLUSTER_STATUS_PREDICTION_HISTORY,
                        &predictions,
                    ));
                }
                Err(e) => warn!(error = %e, "Could not load prediction seed"),
            }
            seeds
        }
        .boxed()
    }))
    .await;
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Could not install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
