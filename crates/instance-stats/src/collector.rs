// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

//! The periodic collection loop.
//!
//! Each tick: re-list the inventory, then for every ACTIVE instance fetch
//! its diagnostic counters and emit pass-through, CPU, and disk points.
//! Every failure is local: a failed inventory refresh empties the tick, a
//! failed fetch skips that instance, a failed aggregation skips that
//! aggregate. The next tick retries naturally.
//!
//! Overlap policy: one cycle at a time. The cycle is awaited inline and the
//! interval uses skip-on-miss, so a slow cycle delays later ticks instead of
//! running concurrently with them.

use crate::compute::{DiagnosticsFetcher, DiagValue, Instance, InventorySource};
use crate::derive::{self, DISK_MEASUREMENT, METRICS_MEASUREMENT};
use crate::influx::{Point, WriterHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Collector {
    inventory: Arc<dyn InventorySource + Send + Sync>,
    diagnostics: Arc<dyn DiagnosticsFetcher + Send + Sync>,
    writer: WriterHandle,
    refresh_interval: Duration,
}

impl Collector {
    pub fn new(
        inventory: Arc<dyn InventorySource + Send + Sync>,
        diagnostics: Arc<dyn DiagnosticsFetcher + Send + Sync>,
        writer: WriterHandle,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            inventory,
            diagnostics,
            writer,
            refresh_interval,
        }
    }

    /// Run the tick loop until cancellation. The in-flight cycle is not
    /// interrupted; cancellation is observed between cycles.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.collect_once().await,
            }
        }
        debug!("collection loop stopped");
    }

    /// One full cycle: refresh the inventory and process every instance.
    pub async fn collect_once(&self) {
        let instances = match self.inventory.list_instances().await {
            Ok(instances) => instances,
            Err(err) => {
                warn!("failed to refresh instance inventory: {err}");
                Vec::new()
            }
        };
        debug!("collected inventory of {} instances", instances.len());

        for instance in &instances {
            // Only ACTIVE instances are queried; everything else is skipped
            // for this tick and emits nothing.
            if !instance.is_active() {
                continue;
            }
            let counters = match self.diagnostics.diagnostics(&instance.uuid).await {
                Ok(counters) => counters,
                Err(err) => {
                    warn!(
                        "failed to fetch diagnostics for {} ({}): {err}",
                        instance.name, instance.uuid
                    );
                    continue;
                }
            };
            self.process_instance(instance, &counters);
        }
    }

    fn process_instance(&self, instance: &Instance, counters: &HashMap<String, DiagValue>) {
        for (field, value) in derive::passthrough(counters) {
            self.emit(instance, METRICS_MEASUREMENT, &field, value);
        }

        match derive::cpu_total(counters) {
            Ok(total) => self.emit(instance, METRICS_MEASUREMENT, "cpu_total", total),
            Err(err) => warn!("skipping cpu_total for {}: {err}", instance.uuid),
        }

        match derive::disk_io(counters) {
            Ok(io) => {
                for (field, value) in io.fields() {
                    self.emit(instance, DISK_MEASUREMENT, field, value);
                }
            }
            Err(err) => warn!("skipping disk io metrics for {}: {err}", instance.uuid),
        }
    }

    /// Stamp the point at submission time and hand it off without blocking
    /// on delivery.
    fn emit(&self, instance: &Instance, measurement: &'static str, field: &str, value: f64) {
        self.writer
            .write_point(Point::now(measurement, instance, field, value));
    }
}
