// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

//! InfluxDB v2 collaborator: line-protocol points, the HTTP client
//! (`/api/v2/write` and `/health`), and the buffered asynchronous write path.
//!
//! The write path follows a service/handle split: [`WriterService`] owns the
//! point buffer and flushes it on a short interval, on an acknowledged
//! `Flush` command, and once more on shutdown. [`WriterHandle::write_point`]
//! is fire-and-forget; delivery failures surface on a bounded error channel
//! that a separate drain task logs and drops. Nothing feeds back into the
//! collection loop.

use crate::compute::Instance;
use crate::errors::InfluxError;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_CHANNEL_CAPACITY: usize = 64;

const INSTANCE_NAME_TAG: &str = "Instance Name";
const UUID_TAG: &str = "UUID";
const PROJECT_TAG: &str = "Project";

/// One timestamped, tagged, single-field sample.
///
/// Every point carries the three identity tags so it can be correlated back
/// to an instance even after the inventory changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: &'static str,
    pub instance_name: String,
    pub uuid: String,
    pub project_id: String,
    pub field: String,
    pub value: f64,
    /// Nanoseconds since the Unix epoch, stamped at submission time.
    pub timestamp_ns: i64,
}

impl Point {
    /// Build a point for `instance`, stamped with the current wall clock.
    pub fn now(measurement: &'static str, instance: &Instance, field: &str, value: f64) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Point {
            measurement,
            instance_name: instance.name.clone(),
            uuid: instance.uuid.clone(),
            project_id: instance.project_id.clone(),
            field: field.to_string(),
            value,
            timestamp_ns,
        }
    }

    /// Encode as one InfluxDB line-protocol record (nanosecond precision).
    pub fn line(&self) -> String {
        format!(
            "{},{}={},{}={},{}={} {}={} {}",
            escape_measurement(self.measurement),
            escape_tag(INSTANCE_NAME_TAG),
            escape_tag(&self.instance_name),
            escape_tag(UUID_TAG),
            escape_tag(&self.uuid),
            escape_tag(PROJECT_TAG),
            escape_tag(&self.project_id),
            escape_tag(&self.field),
            self.value,
            self.timestamp_ns,
        )
    }
}

// Line protocol escaping: measurements escape commas and spaces; tag keys,
// tag values, and field keys additionally escape equals signs.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Thin client for the InfluxDB v2 HTTP API.
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: Client,
    server: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(
        server: &str,
        token: &str,
        org: &str,
        bucket: &str,
    ) -> Result<Self, InfluxError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
        })
    }

    /// Live health round-trip. Passes only when the backend reports `pass`.
    pub async fn health(&self) -> Result<(), InfluxError> {
        let response = self
            .http
            .get(format!("{}/health", self.server))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InfluxError::Unhealthy(format!(
                "status {}",
                response.status().as_u16()
            )));
        }
        let health: HealthResponse = response.json().await?;
        if health.status != "pass" {
            return Err(InfluxError::Unhealthy(health.status));
        }
        Ok(())
    }

    /// Submit a batch of line-protocol records.
    pub async fn write(&self, lines: &str) -> Result<(), InfluxError> {
        let response = self
            .http
            .post(format!("{}/api/v2/write", self.server))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.to_string())
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(InfluxError::WriteRejected { status, body })
    }
}

#[derive(Debug)]
pub enum WriterCommand {
    Write(Point),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cheap-to-clone submission handle for the writer service.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    pub(crate) tx: mpsc::UnboundedSender<WriterCommand>,
}

impl WriterHandle {
    /// Queue a point without waiting for delivery.
    pub fn write_point(&self, point: Point) {
        if self.tx.send(WriterCommand::Write(point)).is_err() {
            debug!("writer service is gone, dropping point");
        }
    }

    /// Flush the buffer and wait for the write attempt to complete. Used at
    /// shutdown so buffered points are not lost with the process.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).is_err() {
            debug!("writer service is gone, nothing to flush");
            return;
        }
        if ack_rx.await.is_err() {
            warn!("writer service stopped before acknowledging flush");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
    }
}

/// Owns the point buffer and the only mutable write state.
pub struct WriterService {
    client: InfluxClient,
    rx: mpsc::UnboundedReceiver<WriterCommand>,
    errors: mpsc::Sender<InfluxError>,
    buffer: Vec<Point>,
}

impl WriterService {
    /// Returns the service, its submission handle, and the receiving end of
    /// the write error stream.
    pub fn new(client: InfluxClient) -> (Self, WriterHandle, mpsc::Receiver<InfluxError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let service = Self {
            client,
            rx,
            errors: error_tx,
            buffer: Vec::new(),
        };
        (service, WriterHandle { tx }, error_rx)
    }

    pub async fn run(mut self) {
        debug!("writer service started");
        let mut flush_interval = interval(FLUSH_INTERVAL);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        flush_interval.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = flush_interval.tick() => self.flush_buffer().await,
                command = self.rx.recv() => match command {
                    Some(WriterCommand::Write(point)) => self.buffer.push(point),
                    Some(WriterCommand::Flush(ack)) => {
                        self.flush_buffer().await;
                        let _ = ack.send(());
                    }
                    Some(WriterCommand::Shutdown) | None => {
                        self.flush_buffer().await;
                        break;
                    }
                },
            }
        }
        debug!("writer service stopped");
    }

    async fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let count = self.buffer.len();
        let lines = self
            .buffer
            .drain(..)
            .map(|point| point.line())
            .collect::<Vec<_>>()
            .join("\n");
        debug!("flushing {count} points");
        if let Err(err) = self.client.write(&lines).await {
            match self.errors.try_send(err) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(err)) => {
                    error!("storage write failed (error channel full): {err}");
                }
                Err(mpsc::error::TrySendError::Closed(err)) => {
                    error!("storage write failed (drain task gone): {err}");
                }
            }
        }
    }
}

/// Log and drop everything on the write error stream until shutdown. Errors
/// are never retried and never reach the collection loop.
pub async fn drain_write_errors(
    mut errors: mpsc::Receiver<InfluxError>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            err = errors.recv() => match err {
                Some(err) => error!("storage write failed: {err}"),
                None => break,
            },
        }
    }
    debug!("write error drain stopped");
}
