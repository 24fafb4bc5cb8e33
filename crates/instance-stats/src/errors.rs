// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while loading the startup configuration. All of these are
/// fatal: the process refuses to start without a complete environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing {0} environment variable")]
    MissingVar(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors from the compute API collaborator (Keystone + Nova).
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("keystone rejected the credentials")]
    Unauthorized,

    #[error("keystone response is missing the X-Subject-Token header")]
    MissingToken,

    #[error("no {interface} compute endpoint for region {region} in the service catalog")]
    NoComputeEndpoint { region: String, interface: String },

    #[error("unexpected status {0} from the compute API")]
    UnexpectedStatus(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors from the metric derivation step.
///
/// Pass-through emission never raises these; only the CPU and disk
/// aggregations abort on a counter that should be numeric but is not.
#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error("counter {0} is not numeric")]
    NonNumeric(String),
}

/// Errors from the InfluxDB collaborator.
#[derive(Debug, thiserror::Error)]
pub enum InfluxError {
    #[error("write endpoint returned status {status}: {body}")]
    WriteRejected { status: u16, body: String },

    #[error("storage health check reported: {0}")]
    Unhealthy(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}
