// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

//! Collection pipeline shipping OpenStack instance diagnostics to InfluxDB.
//!
//! The library is organized around one periodic collection loop: refresh the
//! instance inventory from the compute API, fetch per-instance diagnostic
//! counters, derive summary metrics, and hand timestamped points to a
//! buffered InfluxDB writer. A latched readiness gate plus a small hyper
//! server expose the `/healthz` and `/readyz` probes.

pub mod collector;
pub mod compute;
pub mod config;
pub mod derive;
pub mod errors;
pub mod health;
pub mod influx;
pub mod readiness;
