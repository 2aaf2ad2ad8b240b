//! End-to-end fleet tests over in-memory stores and a scripted adapter.
//!
//! Everything except the LLM CLI is real: envelopes go through the ingest
//! API, workers pull from the buffer, the classifier turn runs on the
//! switchboard's spawner, and subrequests travel over loopback jsonrpsee
//! to the target butlers' `route.execute` tools.

use async_trait::async_trait;
use butlers_config::{ButlerConfig, DaemonTunables, RosterConfig};
use butlers_core::TriggerSource;
use butlers_daemon::{ButlerRpcClient, Daemon, StorageMode};
use butlers_runtime::{AdapterOutcome, AdapterRequest, AdapterUsage, RuntimeAdapter, RuntimeResult};
use butlers_storage::{InboxStatus, InboxStore, RoutingLogStore, SessionStore};
use chrono::Utc;
use jsonrpsee::http_client::HttpClientBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Scripted adapter: classifier turns return routing entries, everything
/// else returns a plain completion.
struct FleetAdapter;

#[async_trait]
impl RuntimeAdapter for FleetAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: AdapterRequest) -> RuntimeResult<AdapterOutcome> {
        let output_text = if request.prompt.starts_with("Decompose") {
            r#"[
                {"butler": "health", "prompt": "Log weight 80kg", "segment": {"rationale": "weight"}},
                {"butler": "relationship", "prompt": "Remind me to call Sarah", "segment": {"rationale": "reminder"}}
            ]"#
            .to_string()
        } else {
            "done".to_string()
        };
        Ok(AdapterOutcome {
            output_text,
            tool_calls: Vec::new(),
            usage: AdapterUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }
}

fn butler(name: &str, schema: &str) -> ButlerConfig {
    ButlerConfig {
        name: name.into(),
        port: 0,
        schema: schema.to_string(),
        description: format!("{name} butler"),
        modules: Vec::new(),
        schedules: Vec::new(),
        trusted_route_callers: Vec::new(),
        gated_tools: Vec::new(),
        model: None,
    }
}

fn roster() -> RosterConfig {
    RosterConfig {
        daemon: DaemonTunables {
            worker_count: 2,
            heartbeat_interval_s: 3600,
            ..DaemonTunables::default()
        },
        butlers: vec![
            butler("switchboard", "switchboard"),
            butler("health", "health"),
            butler("relationship", "relationship"),
            butler("messenger", "messenger"),
        ],
    }
}

async fn start_fleet() -> Daemon {
    let daemon = Daemon::start(
        &roster(),
        &StorageMode::Memory,
        Arc::new(FleetAdapter),
        &HashMap::new(),
    )
    .await
    .expect("fleet starts");

    // Wait until every butler has registered (the peers go through the
    // loopback mesh).
    for _ in 0..200 {
        if daemon.switchboard.registry.list().await.unwrap().len() == 4 {
            return daemon;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("fleet did not finish registering");
}

fn envelope(text: &str, key: &str) -> Vec<u8> {
    serde_json::json!({
        "schema_version": "ingest.v1",
        "source": {
            "channel": "telegram",
            "provider": "telegram",
            "endpoint_identity": "bot:main",
            "sender_identity": "tg:1"
        },
        "payload": {
            "content_type": "text/plain",
            "body": text,
            "sent_at": "2026-03-01T10:00:00+00:00"
        },
        "idempotency_key": key
    })
    .to_string()
    .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multi_domain_message_reaches_both_butlers() {
    let daemon = start_fleet().await;

    let response = daemon
        .switchboard
        .ingest
        .submit_raw(
            &envelope("Log my weight 80kg and remind me to call Sarah", "k1"),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(!response.duplicate);

    // Duplicate submit returns the same request id without new work.
    let duplicate = daemon
        .switchboard
        .ingest
        .submit_raw(
            &envelope("Log my weight 80kg and remind me to call Sarah", "k1"),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(duplicate.duplicate);
    assert_eq!(duplicate.request_id, response.request_id);
    assert_eq!(daemon.switchboard.inbox.count().await.unwrap(), 1);

    // Wait for the record to reach a terminal status.
    let record = {
        let mut terminal = None;
        for _ in 0..500 {
            let record = daemon
                .switchboard
                .inbox
                .get(response.request_id)
                .await
                .unwrap()
                .unwrap();
            if record.status.is_terminal() {
                terminal = Some(record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        terminal.expect("record reached terminal status")
    };

    assert_eq!(record.status, InboxStatus::Completed);
    let results = record.routing_results.unwrap();
    let subrequests = results["subrequests"].as_array().unwrap();
    assert_eq!(subrequests.len(), 2);
    assert!(subrequests.iter().all(|s| s["outcome"] == "success"));

    // Both target butlers ran exactly one route-sourced session.
    for name in ["health", "relationship"] {
        let sessions = daemon
            .butler(name)
            .unwrap()
            .spawner
            .sessions()
            .list_recent(10)
            .await
            .unwrap();
        assert_eq!(sessions.len(), 1, "{name} sessions");
        assert_eq!(sessions[0].trigger_source, TriggerSource::Route);
        assert!(sessions[0].duration_ms.unwrap() >= 0);
    }

    // The fanout log carries both outcomes.
    let fanout = daemon
        .switchboard
        .routing_log
        .fanout_for_request(response.request_id)
        .await
        .unwrap();
    assert_eq!(fanout.len(), 2);

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mesh_surface_and_switchboard_ownership() {
    let daemon = start_fleet().await;

    let switchboard_url = format!("http://{}", daemon.butler("switchboard").unwrap().addr);
    let client = HttpClientBuilder::default().build(&switchboard_url).unwrap();

    // Status and probe.
    assert!(client.probe().await.unwrap());
    let status = client.status().await.unwrap();
    assert_eq!(status.butler, "switchboard");
    assert!(status.tools.contains(&"trigger".to_string()));

    // Connector heartbeat auto-creates, then updates.
    let hb = butlers_core::ConnectorHeartbeat::new("telegram", "bot:main", "inst-1", Utc::now());
    assert!(client.connector_heartbeat(hb.clone()).await.unwrap());
    assert!(!client.connector_heartbeat(hb).await.unwrap());
    let connector = daemon
        .switchboard
        .connectors
        .get("telegram", "bot:main")
        .await
        .unwrap();
    assert!(connector.is_some());

    // Ingest over the mesh too.
    let payload: serde_json::Value =
        serde_json::from_slice(&envelope("hello there", "mesh-k1")).unwrap();
    let accepted = client.ingest(payload).await.unwrap();
    assert_eq!(accepted.status, "accepted");

    // Registry writes are switchboard-only: the same calls against a peer
    // butler are rejected.
    let health_url = format!("http://{}", daemon.butler("health").unwrap().addr);
    let health_client = HttpClientBuilder::default().build(&health_url).unwrap();
    assert!(health_client.heartbeat("health".into()).await.is_err());

    daemon.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tick_over_mesh_is_idempotent() {
    let daemon = start_fleet().await;

    let health_url = format!("http://{}", daemon.butler("health").unwrap().addr);
    let client = HttpClientBuilder::default().build(&health_url).unwrap();

    // No schedules declared: a tick is a clean no-op either way.
    let first = client.tick().await.unwrap();
    let second = client.tick().await.unwrap();
    assert!(first.fired.is_empty());
    assert!(second.fired.is_empty());

    daemon.shutdown().await;
}
