// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;
use std::env;
use std::time::Duration;

/// Default collection period when `REFRESH_SECONDS` is not set.
pub const DEFAULT_REFRESH_SECONDS: u64 = 15;
/// Delay before the readiness gate latches open.
pub const WARMUP_DELAY_SECONDS: u64 = 10;

/// Whether the inventory covers every tenant or only the caller's project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Project,
    Site,
}

impl Scope {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "site" => Ok(Scope::Site),
            "project" => Ok(Scope::Project),
            other => Err(ConfigError::Invalid(format!(
                "SCOPE must be \"site\" or \"project\", got \"{other}\""
            ))),
        }
    }
}

/// Keystone credentials and endpoint-selection settings, read from the
/// standard `OS_*` environment variables.
#[derive(Debug, Clone)]
pub struct ComputeAuth {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub project_id: String,
    pub project_domain_id: String,
    pub user_domain_name: String,
    pub domain_name: String,
    pub region: String,
    pub interface: String,
}

/// Immutable configuration snapshot, loaded once at startup and passed by
/// value into each task.
#[derive(Debug, Clone)]
pub struct Config {
    pub compute: ComputeAuth,
    pub influx_server: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    /// Port the `/healthz` and `/readyz` probes listen on.
    pub stats_port: u16,
    pub scope: Scope,
    pub refresh_interval: Duration,
    pub warmup_delay: Duration,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

impl Config {
    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_domain_name = required("OS_USER_DOMAIN_NAME")?;
        // Newer OpenStack environments may not set OS_DOMAIN_NAME; fall back
        // to the user domain when it is absent.
        let domain_name = env::var("OS_DOMAIN_NAME")
            .ok()
            .filter(|val| !val.is_empty())
            .unwrap_or_else(|| user_domain_name.clone());

        let compute = ComputeAuth {
            auth_url: required("OS_AUTH_URL")?,
            username: required("OS_USERNAME")?,
            password: required("OS_PASSWORD")?,
            project_name: required("OS_PROJECT_NAME")?,
            project_id: required("OS_PROJECT_ID")?,
            project_domain_id: required("OS_PROJECT_DOMAIN_ID")?,
            user_domain_name,
            domain_name,
            region: required("OS_REGION_NAME")?,
            interface: required("OS_INTERFACE")?,
        };

        let stats_port = required("STATS_PORT")?
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid("STATS_PORT must be a port number".to_string()))?;

        let scope = Scope::parse(&required("SCOPE")?)?;

        let refresh_seconds = match env::var("REFRESH_SECONDS") {
            Ok(val) => val.parse::<u64>().map_err(|_| {
                ConfigError::Invalid("REFRESH_SECONDS must be an integer".to_string())
            })?,
            Err(_) => DEFAULT_REFRESH_SECONDS,
        };

        let config = Self {
            compute,
            influx_server: required("INFLUX_SERVER")?,
            influx_token: required("INFLUX_TOKEN")?,
            influx_org: required("INFLUX_ORG")?,
            influx_bucket: required("INFLUX_BUCKET")?,
            stats_port,
            scope,
            refresh_interval: Duration::from_secs(refresh_seconds),
            warmup_delay: Duration::from_secs(WARMUP_DELAY_SECONDS),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stats_port == 0 {
            return Err(ConfigError::Invalid(
                "STATS_PORT must be greater than 0".to_string(),
            ));
        }

        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "REFRESH_SECONDS must be greater than 0".to_string(),
            ));
        }

        if self.influx_server.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "INFLUX_SERVER cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
