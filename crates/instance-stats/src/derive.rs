// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

//! Pure counter-to-metric derivation.
//!
//! Three rules, applied per instance per tick:
//! 1. every numeric counter is passed through unchanged;
//! 2. per-core CPU time counters (`cpu0_time`, `cpu12_time`, ...) are summed
//!    into `cpu_total`;
//! 3. per-device I/O request counters are summed into six disk fields.
//!
//! Pass-through silently skips non-numeric values. The aggregations do not:
//! a single non-numeric counter matching an aggregation pattern aborts that
//! aggregate for the instance-tick. Summation is commutative, so map
//! iteration order never affects the result.

use crate::compute::DiagValue;
use crate::errors::DeriveError;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

/// Measurement holding the raw pass-through counters and `cpu_total`.
pub const METRICS_MEASUREMENT: &str = "OpenStack Metrics";
/// Measurement holding the six derived disk I/O fields.
pub const DISK_MEASUREMENT: &str = "OpenStack disk";

lazy_static! {
    static ref CPU_TIME_REGEX: Regex =
        Regex::new(r"^cpu[0-9]+_time$").expect("failed creating regex");
    static ref VD_READ_REGEX: Regex =
        Regex::new(r"^vd.+read_req$").expect("failed creating regex");
    static ref VD_WRITE_REGEX: Regex =
        Regex::new(r"^vd.+write_req$").expect("failed creating regex");
    static ref HD_READ_REGEX: Regex =
        Regex::new(r"^hd.+read_req$").expect("failed creating regex");
    static ref HD_WRITE_REGEX: Regex =
        Regex::new(r"^hd.+write_req$").expect("failed creating regex");
}

/// One point per numeric counter, keyed by the counter's own name.
/// Non-numeric values are skipped without logging.
pub fn passthrough(counters: &HashMap<String, DiagValue>) -> Vec<(String, f64)> {
    counters
        .iter()
        .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
        .collect()
}

/// Sum of all per-core CPU time counters.
pub fn cpu_total(counters: &HashMap<String, DiagValue>) -> Result<f64, DeriveError> {
    let mut total = 0.0;
    for (name, value) in counters {
        if CPU_TIME_REGEX.is_match(name) {
            total += value
                .as_f64()
                .ok_or_else(|| DeriveError::NonNumeric(name.clone()))?;
        }
    }
    Ok(total)
}

/// Disk I/O request sums: virtio (`vd*`) and legacy (`hd*`) devices, plus
/// the combined totals.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DiskIo {
    pub vd_read_ops: f64,
    pub vd_write_ops: f64,
    pub hd_read_ops: f64,
    pub hd_write_ops: f64,
    pub total_read_ops: f64,
    pub total_write_ops: f64,
}

impl DiskIo {
    /// Field name and value pairs in emission order.
    pub fn fields(&self) -> [(&'static str, f64); 6] {
        [
            ("vd_read_ops", self.vd_read_ops),
            ("vd_write_ops", self.vd_write_ops),
            ("hd_read_ops", self.hd_read_ops),
            ("hd_write_ops", self.hd_write_ops),
            ("total_read_ops", self.total_read_ops),
            ("total_write_ops", self.total_write_ops),
        ]
    }
}

/// Bucket the per-device request counters and compute the combined totals.
pub fn disk_io(counters: &HashMap<String, DiagValue>) -> Result<DiskIo, DeriveError> {
    let mut io = DiskIo::default();
    for (name, value) in counters {
        let bucket = if VD_READ_REGEX.is_match(name) {
            &mut io.vd_read_ops
        } else if VD_WRITE_REGEX.is_match(name) {
            &mut io.vd_write_ops
        } else if HD_READ_REGEX.is_match(name) {
            &mut io.hd_read_ops
        } else if HD_WRITE_REGEX.is_match(name) {
            &mut io.hd_write_ops
        } else {
            continue;
        };
        *bucket += value
            .as_f64()
            .ok_or_else(|| DeriveError::NonNumeric(name.clone()))?;
    }
    io.total_read_ops = io.vd_read_ops + io.hd_read_ops;
    io.total_write_ops = io.vd_write_ops + io.hd_write_ops;
    Ok(io)
}
