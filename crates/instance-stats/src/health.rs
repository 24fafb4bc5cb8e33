// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

//! Liveness and readiness probes.
//!
//! `/healthz` answers 200 whenever the process is up. `/readyz` answers 200
//! only when the storage backend passes a live health round-trip AND the
//! warm-up gate has latched open; the two are checked on every request,
//! never cached.

use crate::influx::InfluxClient;
use crate::readiness::ReadinessGate;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const HEALTHZ_PATH: &str = "/healthz";
const READYZ_PATH: &str = "/readyz";
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Accept probe connections until cancellation, then drain in-flight
/// connections with a bounded timeout.
pub async fn serve(
    listener: TcpListener,
    gate: ReadinessGate,
    influx: InfluxClient,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    debug!("probe accept error: {err}");
                    continue;
                }
            },
        };

        let gate = gate.clone();
        let influx = influx.clone();
        let service = service_fn(move |req| {
            let gate = gate.clone();
            let influx = influx.clone();
            async move { probe_handler(req, gate, influx).await }
        });

        let io = TokioIo::new(stream);
        connections.spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!("probe connection error: {err}");
            }
        });

        // Reap finished connections so the set does not grow unbounded.
        while connections.try_join_next().is_some() {}
    }

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!("probe connections still open after drain timeout");
    }
    debug!("probe server stopped");
}

async fn probe_handler(
    req: Request<Incoming>,
    gate: ReadinessGate,
    influx: InfluxClient,
) -> http::Result<Response<Full<Bytes>>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, HEALTHZ_PATH) => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from_static(b"ok"))),

        (&Method::GET, READYZ_PATH) => {
            if let Err(err) = influx.health().await {
                debug!("readiness probe: storage health check failed: {err}");
                return service_unavailable();
            }
            if !gate.is_ready() {
                debug!("readiness probe: warm-up not complete");
                return service_unavailable();
            }
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from_static(b"ok")))
        }

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::default()),
    }
}

fn service_unavailable() -> http::Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .body(Full::new(Bytes::from_static(b"Service Unavailable")))
}
