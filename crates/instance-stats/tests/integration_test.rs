// Copyright 2024-Present the openstack-instance-stats authors.
// SPDX-License-Identifier: Apache-2.0

use instance_stats::collector::Collector;
use instance_stats::compute::ComputeClient;
use instance_stats::config::{ComputeAuth, Scope};
use instance_stats::health;
use instance_stats::influx::{InfluxClient, WriterService};
use instance_stats::readiness::ReadinessGate;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn compute_auth(auth_url: String) -> ComputeAuth {
    ComputeAuth {
        auth_url,
        username: "stats".to_string(),
        password: "secret".to_string(),
        project_name: "telemetry".to_string(),
        project_id: "proj-1".to_string(),
        project_domain_id: "default".to_string(),
        user_domain_name: "Default".to_string(),
        domain_name: "Default".to_string(),
        region: "RegionOne".to_string(),
        interface: "public".to_string(),
    }
}

async fn mock_keystone(server: &mut ServerGuard) -> mockito::Mock {
    let compute_url = format!("{}/compute", server.url());
    server
        .mock("POST", "/v3/auth/tokens")
        .with_status(201)
        .with_header("X-Subject-Token", "mock-token")
        .with_body(
            json!({
                "token": {
                    "catalog": [
                        {
                            "type": "compute",
                            "endpoints": [
                                {
                                    "interface": "public",
                                    "region": "RegionOne",
                                    "url": compute_url,
                                }
                            ]
                        }
                    ]
                }
            })
            .to_string(),
        )
        .create_async()
        .await
}

async fn healthy_influx(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("GET", "/health")
        .with_status(200)
        .with_body(json!({ "status": "pass" }).to_string())
        .create_async()
        .await
}

#[tokio::test]
async fn collection_tick_writes_derived_points() {
    let mut server = Server::new_async().await;

    let keystone = mock_keystone(&mut server).await;

    let servers_list = server
        .mock("GET", "/compute/servers/detail")
        .match_header("X-Auth-Token", "mock-token")
        .with_status(200)
        .with_body(
            json!({
                "servers": [
                    { "id": "u1", "name": "web-1", "tenant_id": "proj-1", "status": "ACTIVE" },
                    { "id": "u2", "name": "db-1", "tenant_id": "proj-1", "status": "SHUTOFF" }
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let active_diagnostics = server
        .mock("GET", "/compute/servers/u1/diagnostics")
        .match_header("X-Auth-Token", "mock-token")
        .with_status(200)
        .with_body(
            json!({
                "cpu0_time": 10.0,
                "cpu1_time": 5.5,
                "vda_read_req": 4,
                "hda_read_req": 1,
                "vda_write_req": 2,
                "nic0_mac": "fa:16:3e:00:00:01"
            })
            .to_string(),
        )
        .create_async()
        .await;

    // Non-ACTIVE instances must never be queried for diagnostics.
    let shutoff_diagnostics = server
        .mock("GET", "/compute/servers/u2/diagnostics")
        .expect(0)
        .create_async()
        .await;

    let write = server
        .mock("POST", "/api/v2/write")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("org".into(), "org".into()),
            Matcher::UrlEncoded("bucket".into(), "bucket".into()),
        ]))
        .match_header("Authorization", "Token influx-token")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r"cpu_total=15\.5 ".to_string()),
            Matcher::Regex(r"total_read_ops=5 ".to_string()),
            Matcher::Regex(r"total_write_ops=2 ".to_string()),
            Matcher::Regex(r"UUID=u1".to_string()),
        ]))
        .with_status(204)
        .create_async()
        .await;

    let compute = Arc::new(
        ComputeClient::connect(
            compute_auth(format!("{}/v3", server.url())),
            Scope::Project,
        )
        .await
        .expect("keystone auth should succeed"),
    );

    let influx = InfluxClient::new(&server.url(), "influx-token", "org", "bucket")
        .expect("client construction");
    let (writer_service, writer_handle, _error_rx) = WriterService::new(influx);
    let writer_task = tokio::spawn(writer_service.run());

    let collector = Collector::new(
        compute.clone(),
        compute,
        writer_handle.clone(),
        Duration::from_secs(15),
    );
    collector.collect_once().await;

    writer_handle.flush().await;
    writer_handle.shutdown();
    writer_task.await.expect("writer task");

    keystone.assert_async().await;
    servers_list.assert_async().await;
    active_diagnostics.assert_async().await;
    shutoff_diagnostics.assert_async().await;
    write.assert_async().await;
}

#[tokio::test]
async fn inventory_failure_sends_no_points() {
    let mut server = Server::new_async().await;

    let _keystone = mock_keystone(&mut server).await;
    let _servers_list = server
        .mock("GET", "/compute/servers/detail")
        .with_status(500)
        .create_async()
        .await;
    let write = server
        .mock("POST", "/api/v2/write")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let compute = Arc::new(
        ComputeClient::connect(
            compute_auth(format!("{}/v3", server.url())),
            Scope::Project,
        )
        .await
        .expect("keystone auth should succeed"),
    );
    let influx = InfluxClient::new(&server.url(), "influx-token", "org", "bucket")
        .expect("client construction");
    let (writer_service, writer_handle, _error_rx) = WriterService::new(influx);
    let writer_task = tokio::spawn(writer_service.run());

    let collector = Collector::new(
        compute.clone(),
        compute,
        writer_handle.clone(),
        Duration::from_secs(15),
    );
    collector.collect_once().await;

    writer_handle.flush().await;
    writer_handle.shutdown();
    writer_task.await.expect("writer task");

    write.assert_async().await;
}

async fn start_probe_server(
    gate: ReadinessGate,
    influx: InfluxClient,
    cancel: CancellationToken,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(health::serve(listener, gate, influx, cancel));
    format!("http://{addr}")
}

#[tokio::test]
async fn readyz_requires_warmup_and_healthy_storage() {
    let mut server = Server::new_async().await;
    let _health = healthy_influx(&mut server).await;

    let influx = InfluxClient::new(&server.url(), "t", "o", "b").expect("client construction");
    let gate = ReadinessGate::new();
    let cancel = CancellationToken::new();
    let base = start_probe_server(gate.clone(), influx, cancel.clone()).await;
    let client = reqwest::Client::new();

    // Liveness never depends on warm-up or storage.
    let healthz = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(healthz.status().as_u16(), 200);

    // Storage is healthy, but the warm-up gate is still closed.
    let readyz = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert_eq!(readyz.status().as_u16(), 503);
    assert_eq!(readyz.text().await.unwrap(), "Service Unavailable");

    gate.begin_warmup(Duration::ZERO);
    sleep(Duration::from_millis(50)).await;

    let readyz = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert_eq!(readyz.status().as_u16(), 200);

    let missing = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    cancel.cancel();
}

#[tokio::test]
async fn readyz_fails_when_storage_is_unhealthy() {
    let mut server = Server::new_async().await;
    let _health = server
        .mock("GET", "/health")
        .with_status(503)
        .with_body(json!({ "status": "fail" }).to_string())
        .create_async()
        .await;

    let influx = InfluxClient::new(&server.url(), "t", "o", "b").expect("client construction");
    let gate = ReadinessGate::new();
    gate.begin_warmup(Duration::ZERO);
    sleep(Duration::from_millis(50)).await;
    assert!(gate.is_ready());

    let cancel = CancellationToken::new();
    let base = start_probe_server(gate, influx, cancel.clone()).await;

    let readyz = reqwest::Client::new()
        .get(format!("{base}/readyz"))
        .send()
        .await
        .unwrap();
    assert_eq!(readyz.status().as_u16(), 503);

    cancel.cancel();
}

#[tokio::test]
async fn connect_fails_on_rejected_credentials() {
    let mut server = Server::new_async().await;
    let _keystone = server
        .mock("POST", "/v3/auth/tokens")
        .with_status(401)
        .create_async()
        .await;

    let result = ComputeClient::connect(
        compute_auth(format!("{}/v3", server.url())),
        Scope::Project,
    )
    .await;
    assert!(matches!(
        result,
        Err(instance_stats::errors::ComputeError::Unauthorized)
    ));
}

#[tokio::test]
async fn site_scope_lists_all_tenants() {
    let mut server = Server::new_async().await;
    let _keystone = mock_keystone(&mut server).await;
    let servers_list = server
        .mock("GET", "/compute/servers/detail")
        .match_query(Matcher::UrlEncoded("all_tenants".into(), "1".into()))
        .with_status(200)
        .with_body(json!({ "servers": [] }).to_string())
        .create_async()
        .await;

    let compute = ComputeClient::connect(
        compute_auth(format!("{}/v3", server.url())),
        Scope::Site,
    )
    .await
    .expect("keystone auth should succeed");

    use instance_stats::compute::InventorySource;
    compute.list_instances().await.expect("site-wide list");
    servers_list.assert_async().await;
}
