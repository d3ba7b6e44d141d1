//! Gateway client HTTP mapping.

use std::time::Duration;

use serde_json::json;
use tidepool_controller::cluster::ClusterApi;
use tidepool_controller::gateway::{GatewayClient, GatewaySettings};
use tidepool_controller::lease::SweepLease;
use tidepool_controller::model::{RunTaskRequest, TaskRequest};
use tidepool_controller::pool::NodePoolClient;
use tidepool_controller::queue::{DeadLetterStore, TaskQueue};
use tidepool_controller::ApiError;
use tidepool_events::DrainState;
use tidepool_id::{InstanceId, MessageId, NodeId};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> GatewayClient {
    GatewayClient::new(GatewaySettings {
        base_url: server.uri(),
        cluster: "batch".to_string(),
        pool: "batch-pool".to_string(),
        queue: Some("tasks".to_string()),
        call_timeout: Duration::from_secs(5),
        max_receive_count: 20,
    })
    .unwrap()
}

fn run_request() -> RunTaskRequest {
    let task =
        TaskRequest::from_message_body(r#"{"jobName":"etl","taskDefinitionRef":"etl:1"}"#).unwrap();
    RunTaskRequest::for_task("batch", &task)
}

#[tokio::test]
async fn terminate_of_missing_instance_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/pools/batch-pool/instances/i-gone/terminate"))
        .and(body_json(json!({"decrement_desired_capacity": true})))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "not_found",
            "message": "instance i-gone does not exist"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let instance = InstanceId::parse("i-gone").unwrap();
    client(&server)
        .terminate_instance(&instance, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn no_capacity_code_maps_to_no_capacity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/clusters/batch/tasks"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "no_capacity",
            "message": "no container instances were found in the cluster"
        })))
        .mount(&server)
        .await;

    let err = client(&server).run_task(run_request()).await.unwrap_err();
    assert!(err.is_no_capacity());
    assert_eq!(
        err,
        ApiError::NoCapacity("no container instances were found in the cluster".to_string())
    );
}

#[tokio::test]
async fn placement_failures_are_returned_as_output() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/clusters/batch/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [],
            "failures": [{"reason": "RESOURCE:MEMORY", "node_id": "node-1"}]
        })))
        .mount(&server)
        .await;

    let output = client(&server).run_task(run_request()).await.unwrap();
    assert!(output.tasks.is_empty());
    assert_eq!(output.failures.len(), 1);
    assert_eq!(output.failures[0].reason, "RESOURCE:MEMORY");
}

#[tokio::test]
async fn throttling_maps_to_throttled() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/pools/batch-pool/desired-capacity"))
        .and(body_json(json!({"desired_capacity": 3, "honor_cooldown": false})))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let err = client(&server)
        .set_desired_capacity(3, false)
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::Throttled("slow down".to_string()));
}

#[tokio::test]
async fn other_errors_map_to_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/clusters/batch/nodes/node-1/drain-state"))
        .and(body_json(json!({"drain_state": "DRAINING"})))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "boom"})))
        .mount(&server)
        .await;

    let node = NodeId::parse("node-1").unwrap();
    let err = client(&server)
        .set_drain_state(&node, DrainState::Draining)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ApiError::Rejected {
            status: 500,
            message: "boom".to_string()
        }
    );
}

#[tokio::test]
async fn list_nodes_decodes_inventory() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/clusters/batch/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nodes": [
                {
                    "node_id": "node-1",
                    "instance_id": "i-1",
                    "registered_at": "2026-03-01T10:00:00Z",
                    "running_tasks": 2,
                    "drain_state": "ACTIVE",
                    "launch_config_version": "lt-7",
                    "remaining_memory_mib": 2048,
                    "remaining_cpu_units": 1024
                },
                {
                    "node_id": "node-2",
                    "instance_id": "i-2",
                    "registered_at": "2026-03-01T10:05:00Z",
                    "running_tasks": 0,
                    "drain_state": "DRAINING",
                    "launch_config": {"image": "ami-1", "instance_type": "m6i.large"},
                    "remaining_memory_mib": 8192,
                    "remaining_cpu_units": 2048,
                    "last_task_stopped_at": "2026-03-01T11:00:00Z"
                }
            ]
        })))
        .mount(&server)
        .await;

    let nodes = client(&server).list_nodes().await.unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].node_id.as_str(), "node-1");
    assert_eq!(nodes[0].running_tasks, 2);
    assert_eq!(nodes[0].launch_config_version.as_deref(), Some("lt-7"));
    assert_eq!(nodes[1].drain_state, DrainState::Draining);
    assert!(nodes[1]
        .launch_config_version
        .as_deref()
        .is_some_and(|v| v.starts_with("lc:")));
    assert!(nodes[1].last_task_stopped_at.is_some());
}

#[tokio::test]
async fn malformed_inventory_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/clusters/batch/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"nodes": "none"})))
        .mount(&server)
        .await;

    let err = client(&server).list_nodes().await.unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)));
}

#[tokio::test]
async fn receive_maps_messages_to_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/queues/tasks/receive"))
        .and(body_json(json!({"max_messages": 10, "wait_seconds": 0})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{
                "message_id": "msg-1",
                "receipt_handle": "rcpt-1",
                "body": "{}",
                "receive_count": 3
            }]
        })))
        .mount(&server)
        .await;

    let deliveries = client(&server)
        .receive(10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].message_id.as_str(), "msg-1");
    assert_eq!(deliveries[0].receive_count, 3);
}

#[tokio::test]
async fn lease_acquire_reports_holder_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/leases/node-reaper/acquire"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acquired": false})))
        .mount(&server)
        .await;

    let acquired = client(&server)
        .try_acquire("node-reaper", "ctl_a", Duration::from_secs(120))
        .await
        .unwrap();
    assert!(!acquired);
}

#[tokio::test]
async fn dead_letters_are_listed_from_the_queue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/queues/tasks/dead-letters"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dead_letters": [{
                "message_id": "msg-7",
                "body": "{\"jobName\":\"never-fits\",\"taskDefinitionRef\":\"big:1\"}",
                "receive_count": 20,
                "dead_lettered_at": "2026-03-01T12:00:00Z"
            }]
        })))
        .mount(&server)
        .await;

    let dead = client(&server).list_dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id.as_str(), "msg-7");
    assert_eq!(dead[0].receive_count, 20);
}

#[tokio::test]
async fn redrive_posts_to_the_dead_letter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/queues/tasks/dead-letters/msg-7/redrive"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let message_id = MessageId::parse("msg-7").unwrap();
    client(&server)
        .redrive_dead_letter(&message_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn redrive_of_unknown_message_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/queues/tasks/dead-letters/msg-8/redrive"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "not_found",
            "message": "no dead letter msg-8"
        })))
        .mount(&server)
        .await;

    let message_id = MessageId::parse("msg-8").unwrap();
    let err = client(&server)
        .redrive_dead_letter(&message_id)
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::NotFound("no dead letter msg-8".to_string()));
}
