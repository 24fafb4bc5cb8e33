// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process, sync::Arc};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use instance_stats::{
    collector::Collector,
    compute::ComputeClient,
    config::Config,
    health,
    influx::{drain_write_errors, InfluxClient, WriterService},
    readiness::ReadinessGate,
};

const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("STATS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    // Startup failures are the only unrecoverable ones: a hole in the
    // environment, rejected credentials, or unreachable storage.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {err}");
            process::exit(1);
        }
    };

    let compute = match ComputeClient::connect(config.compute.clone(), config.scope).await {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!("Error while authenticating with OpenStack for the first time: {err}");
            process::exit(1);
        }
    };

    let influx = match InfluxClient::new(
        &config.influx_server,
        &config.influx_token,
        &config.influx_org,
        &config.influx_bucket,
    ) {
        Ok(client) => client,
        Err(err) => {
            error!("Error creating the InfluxDB client: {err}");
            process::exit(1);
        }
    };
    if let Err(err) = influx.health().await {
        error!("Initial InfluxDB health check failed: {err}");
        process::exit(1);
    }

    let cancel = CancellationToken::new();

    let (writer_service, writer_handle, error_rx) = WriterService::new(influx.clone());
    let writer_task = tokio::spawn(writer_service.run());
    tokio::spawn(drain_write_errors(error_rx, cancel.clone()));

    let gate = ReadinessGate::new();
    gate.begin_warmup(config.warmup_delay);

    let listener = match TcpListener::bind(("0.0.0.0", config.stats_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Unable to bind probe port {}: {err}", config.stats_port);
            process::exit(1);
        }
    };
    tokio::spawn(health::serve(
        listener,
        gate.clone(),
        influx.clone(),
        cancel.clone(),
    ));

    let collector = Collector::new(
        compute.clone(),
        compute,
        writer_handle.clone(),
        config.refresh_interval,
    );
    tokio::spawn(collector.run(cancel.clone()));

    info!(
        "Startup success: collecting every {}s, probes on port {}",
        config.refresh_interval.as_secs(),
        config.stats_port
    );

    shutdown_signal().await;
    info!("Shutdown signal received");
    cancel.cancel();

    // Push out whatever is still buffered before the process goes away.
    if timeout(SHUTDOWN_FLUSH_TIMEOUT, writer_handle.flush())
        .await
        .is_err()
    {
        error!("Timed out flushing buffered points");
    }
    writer_handle.shutdown();
    let _ = writer_task.await;
    info!("exiting");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {err}");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
