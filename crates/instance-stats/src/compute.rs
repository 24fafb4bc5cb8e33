// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

//! Compute API collaborator: Keystone v3 password auth plus the two Nova
//! calls the pipeline needs (server listing and per-server diagnostics).
//!
//! The collector consumes the API through the [`InventorySource`] and
//! [`DiagnosticsFetcher`] traits so the loop can be tested against in-process
//! fakes. Diagnostic values cross the boundary as [`DiagValue`], an explicit
//! numeric-or-other variant; the deriver never inspects runtime types.

use crate::config::{ComputeAuth, Scope};
use crate::errors::ComputeError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const SUBJECT_TOKEN_HEADER: &str = "x-subject-token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Instance status that makes it eligible for diagnostics collection.
pub const ACTIVE_STATUS: &str = "ACTIVE";

/// One virtual machine as seen at the last inventory refresh. Produced fresh
/// every tick; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub uuid: String,
    pub name: String,
    pub project_id: String,
    pub status: String,
    /// Access address when Nova reports one. Unused by the pipeline.
    pub ip: Option<IpAddr>,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.status == ACTIVE_STATUS
    }
}

/// A diagnostic counter value as reported by the driver: either something
/// that reads as a 64-bit float, or something we will never emit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiagValue {
    Number(f64),
    Other,
}

impl DiagValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DiagValue::Number(v) => Some(*v),
            DiagValue::Other => None,
        }
    }

    fn from_json(value: &serde_json::Value) -> Self {
        value.as_f64().map_or(DiagValue::Other, DiagValue::Number)
    }
}

impl From<f64> for DiagValue {
    fn from(value: f64) -> Self {
        DiagValue::Number(value)
    }
}

/// Full re-list of the instances visible in the configured scope. No
/// pagination state is kept between calls.
#[async_trait]
pub trait InventorySource {
    async fn list_instances(&self) -> Result<Vec<Instance>, ComputeError>;
}

/// Raw diagnostic counter map for one instance.
#[async_trait]
pub trait DiagnosticsFetcher {
    async fn diagnostics(&self, uuid: &str) -> Result<HashMap<String, DiagValue>, ComputeError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    region: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<ServerRecord>,
}

#[derive(Debug, Deserialize)]
struct ServerRecord {
    id: String,
    name: String,
    tenant_id: String,
    status: String,
    #[serde(rename = "accessIPv4", default)]
    access_ipv4: String,
}

impl From<ServerRecord> for Instance {
    fn from(record: ServerRecord) -> Self {
        Instance {
            ip: record.access_ipv4.parse().ok(),
            uuid: record.id,
            name: record.name,
            project_id: record.tenant_id,
            status: record.status,
        }
    }
}

/// Token plus the compute endpoint resolved from the service catalog.
/// Replaced wholesale on re-authentication.
#[derive(Debug, Clone)]
struct AuthState {
    token: String,
    compute_url: String,
}

fn find_compute_endpoint(
    catalog: &[CatalogEntry],
    region: &str,
    interface: &str,
) -> Option<String> {
    catalog
        .iter()
        .filter(|entry| entry.service_type == "compute")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|endpoint| endpoint.region == region && endpoint.interface == interface)
        .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
}

/// Nova client. Tokens expire, so every request gets one transparent
/// re-authentication attempt on 401 before the error is surfaced.
#[derive(Debug)]
pub struct ComputeClient {
    http: Client,
    auth: ComputeAuth,
    scope: Scope,
    state: RwLock<AuthState>,
}

impl ComputeClient {
    /// Authenticate with Keystone and resolve the compute endpoint. Failure
    /// here is fatal to the process.
    pub async fn connect(auth: ComputeAuth, scope: Scope) -> Result<Self, ComputeError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let state = Self::authenticate(&http, &auth).await?;
        debug!("resolved compute endpoint {}", state.compute_url);
        Ok(Self {
            http,
            auth,
            scope,
            state: RwLock::new(state),
        })
    }

    async fn authenticate(http: &Client, auth: &ComputeAuth) -> Result<AuthState, ComputeError> {
        let url = format!("{}/auth/tokens", auth.auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": auth.username,
                            "domain": { "name": auth.user_domain_name },
                            "password": auth.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": auth.project_name,
                        "domain": { "name": auth.domain_name },
                    }
                }
            }
        });

        let response = http.post(&url).json(&body).send().await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(ComputeError::Unauthorized),
            other => return Err(ComputeError::UnexpectedStatus(other.as_u16())),
        }

        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(ComputeError::MissingToken)?;

        let parsed: TokenResponse = response.json().await?;
        let compute_url = find_compute_endpoint(&parsed.token.catalog, &auth.region, &auth.interface)
            .ok_or_else(|| ComputeError::NoComputeEndpoint {
                region: auth.region.clone(),
                interface: auth.interface.clone(),
            })?;

        Ok(AuthState { token, compute_url })
    }

    async fn reauthenticate(&self) -> Result<(), ComputeError> {
        let state = Self::authenticate(&self.http, &self.auth).await?;
        *self.state.write().await = state;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ComputeError> {
        for attempt in 0..2 {
            let (token, base) = {
                let state = self.state.read().await;
                (state.token.clone(), state.compute_url.clone())
            };
            let response = self
                .http
                .get(format!("{base}{path}"))
                .header(AUTH_TOKEN_HEADER, token)
                .send()
                .await?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!("compute token expired, re-authenticating");
                self.reauthenticate().await?;
                continue;
            }
            if !response.status().is_success() {
                return Err(ComputeError::UnexpectedStatus(response.status().as_u16()));
            }
            return Ok(response);
        }
        Err(ComputeError::Unauthorized)
    }
}

#[async_trait]
impl InventorySource for ComputeClient {
    async fn list_instances(&self) -> Result<Vec<Instance>, ComputeError> {
        let path = match self.scope {
            Scope::Site => "/servers/detail?all_tenants=1",
            Scope::Project => "/servers/detail",
        };
        let parsed: ServersResponse = self.get(path).await?.json().await?;
        Ok(parsed.servers.into_iter().map(Instance::from).collect())
    }
}

#[async_trait]
impl DiagnosticsFetcher for ComputeClient {
    async fn diagnostics(&self, uuid: &str) -> Result<HashMap<String, DiagValue>, ComputeError> {
        let raw: HashMap<String, serde_json::Value> = self
            .get(&format!("/servers/{uuid}/diagnostics"))
            .await?
            .json()
            .await?;
        Ok(raw
            .iter()
            .map(|(name, value)| (name.clone(), DiagValue::from_json(value)))
            .collect())
    }
}
