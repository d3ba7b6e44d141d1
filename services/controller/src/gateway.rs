//! Cluster gateway API client.
//!
//! One JSON/REST client fronting every collaborator:
//! - Orchestrator: task placement, node inventory, drain state
//! - Node pool: desired capacity, instance termination
//! - Task queue: receive, acknowledge, send, dead letters
//! - Lease store: sweep lease

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tidepool_events::DrainState;
use tidepool_id::{InstanceId, MessageId, NodeId, ReceiptHandle};
use tidepool_reconcile::LaunchConfigFingerprint;
use tracing::{debug, warn};

use crate::cluster::ClusterApi;
use crate::error::{ApiError, ApiResult};
use crate::lease::SweepLease;
use crate::model::{Node, PoolDescription, RunTaskOutput, RunTaskRequest, StoppedTask};
use crate::pool::NodePoolClient;
use crate::queue::{DeadLetter, DeadLetterStore, Delivery, TaskQueue};

/// Error code the gateway uses for placement capacity shortfalls.
const NO_CAPACITY_CODE: &str = "no_capacity";

/// Gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub base_url: String,
    pub cluster: String,
    pub pool: String,
    pub queue: Option<String>,
    pub call_timeout: Duration,
    pub max_receive_count: u32,
}

/// Cluster gateway client.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: Url,
    cluster: String,
    pool: String,
    queue: Option<String>,
    call_timeout: Duration,
    max_receive_count: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeList {
    nodes: Vec<WireNode>,
}

/// A node as the gateway reports it; the launch configuration may be a
/// version string or a structured document.
#[derive(Debug, Deserialize)]
struct WireNode {
    #[serde(flatten)]
    node: Node,
    #[serde(default)]
    launch_config: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WirePool {
    #[serde(flatten)]
    pool: PoolDescription,
    #[serde(default)]
    launch_config: Option<serde_json::Value>,
}

/// Resolve a launch-config identity, fingerprinting structured documents.
fn launch_config_identity(
    version: Option<String>,
    structured: Option<serde_json::Value>,
) -> Option<String> {
    version.or_else(|| {
        structured
            .filter(|value| !value.is_null())
            .map(|value| LaunchConfigFingerprint::from_json(&value).into())
    })
}

#[derive(Debug, Deserialize)]
struct StoppedTaskList {
    tasks: Vec<StoppedTask>,
}

#[derive(Debug, Serialize)]
struct DrainStateRequest {
    drain_state: DrainState,
}

#[derive(Debug, Serialize)]
struct DesiredCapacityRequest {
    desired_capacity: u32,
    honor_cooldown: bool,
}

#[derive(Debug, Serialize)]
struct TerminateRequest {
    decrement_desired_capacity: bool,
}

#[derive(Debug, Serialize)]
struct ReceiveRequest {
    max_messages: usize,
    wait_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    message_id: MessageId,
    receipt_handle: ReceiptHandle,
    body: String,
    receive_count: u32,
}

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct AckRequest<'a> {
    receipt_handle: &'a ReceiptHandle,
}

#[derive(Debug, Serialize)]
struct SendRequest {
    body: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
struct DeadLetterList {
    #[serde(default)]
    dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Serialize)]
struct LeaseRequest<'a> {
    holder: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    acquired: bool,
}

impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(settings: GatewaySettings) -> ApiResult<Self> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|e| ApiError::Transport(format!("invalid gateway URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Transport(format!(
                "gateway URL {base_url} cannot carry a path"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.call_timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            cluster: settings.cluster,
            pool: settings.pool,
            queue: settings.queue,
            call_timeout: settings.call_timeout,
            max_receive_count: settings.max_receive_count,
        })
    }

    /// Build an endpoint URL; each segment is percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn queue_name(&self) -> ApiResult<&str> {
        self.queue
            .as_deref()
            .ok_or_else(|| ApiError::NotFound("no task queue configured".to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> ApiResult<T> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await.map_err(transport)?;
        decode(check(response).await?).await
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &B,
    ) -> ApiResult<reqwest::Response> {
        debug!(%method, url = %url, "Sending request");
        let response = self
            .client
            .request(method, url)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        check(response).await
    }
}

/// Map a non-2xx response to an [`ApiError`].
async fn check(response: reqwest::Response) -> ApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.clone());

    if parsed
        .as_ref()
        .and_then(|b| b.code.as_deref())
        .is_some_and(|code| code == NO_CAPACITY_CODE)
    {
        return Err(ApiError::NoCapacity(message));
    }

    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::Throttled(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ApiError::Timeout(message),
        _ => {
            warn!(status = %status, body = %body, "Gateway rejected request");
            ApiError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
    response
        .json()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

fn transport(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(e.to_string())
    } else if e.is_decode() {
        ApiError::Decode(e.to_string())
    } else {
        ApiError::Transport(e.to_string())
    }
}

#[async_trait]
impl ClusterApi for GatewayClient {
    async fn run_task(&self, request: RunTaskRequest) -> ApiResult<RunTaskOutput> {
        let url = self.url(&["v1", "clusters", &self.cluster, "tasks"]);
        let response = self
            .send_json(reqwest::Method::POST, url, &request)
            .await?;
        decode(response).await
    }

    async fn list_nodes(&self) -> ApiResult<Vec<Node>> {
        let url = self.url(&["v1", "clusters", &self.cluster, "nodes"]);
        let list: NodeList = self.get_json(url).await?;
        Ok(list
            .nodes
            .into_iter()
            .map(|wire| {
                let mut node = wire.node;
                node.launch_config_version =
                    launch_config_identity(node.launch_config_version, wire.launch_config);
                node
            })
            .collect())
    }

    async fn list_stopped_tasks(&self, node_id: &NodeId) -> ApiResult<Vec<StoppedTask>> {
        let url = self.url(&[
            "v1",
            "clusters",
            &self.cluster,
            "nodes",
            node_id.as_str(),
            "stopped-tasks",
        ]);
        let list: StoppedTaskList = self.get_json(url).await?;
        Ok(list.tasks)
    }

    async fn set_drain_state(&self, node_id: &NodeId, drain_state: DrainState) -> ApiResult<()> {
        let url = self.url(&[
            "v1",
            "clusters",
            &self.cluster,
            "nodes",
            node_id.as_str(),
            "drain-state",
        ]);
        self.send_json(reqwest::Method::PUT, url, &DrainStateRequest { drain_state })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NodePoolClient for GatewayClient {
    async fn describe_pool(&self) -> ApiResult<PoolDescription> {
        let wire: WirePool = self.get_json(self.url(&["v1", "pools", &self.pool])).await?;
        let mut pool = wire.pool;
        pool.launch_config_version =
            launch_config_identity(pool.launch_config_version, wire.launch_config);
        Ok(pool)
    }

    async fn set_desired_capacity(&self, desired: u32, honor_cooldown: bool) -> ApiResult<()> {
        let url = self.url(&["v1", "pools", &self.pool, "desired-capacity"]);
        let body = DesiredCapacityRequest {
            desired_capacity: desired,
            honor_cooldown,
        };
        self.send_json(reqwest::Method::PUT, url, &body).await?;
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &InstanceId,
        decrement_desired: bool,
    ) -> ApiResult<()> {
        let url = self.url(&[
            "v1",
            "pools",
            &self.pool,
            "instances",
            instance_id.as_str(),
            "terminate",
        ]);
        let body = TerminateRequest {
            decrement_desired_capacity: decrement_desired,
        };

        match self.send_json(reqwest::Method::POST, url, &body).await {
            Ok(_) => Ok(()),
            Err(ApiError::NotFound(_)) => {
                debug!(instance_id = %instance_id, "Instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TaskQueue for GatewayClient {
    async fn receive(&self, max: usize, wait: Duration) -> ApiResult<Vec<Delivery>> {
        let url = self.url(&["v1", "queues", self.queue_name()?, "receive"]);
        let body = ReceiveRequest {
            max_messages: max,
            wait_seconds: wait.as_secs(),
        };

        // The long poll legitimately outlasts the call timeout.
        let response = self
            .client
            .post(url)
            .timeout(wait + self.call_timeout)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let received: ReceiveResponse = decode(check(response).await?).await?;

        Ok(received
            .messages
            .into_iter()
            .map(|m| Delivery {
                message_id: m.message_id,
                receipt: m.receipt_handle,
                body: m.body,
                receive_count: m.receive_count,
            })
            .collect())
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> ApiResult<()> {
        let url = self.url(&["v1", "queues", self.queue_name()?, "ack"]);
        let body = AckRequest {
            receipt_handle: receipt,
        };
        self.send_json(reqwest::Method::POST, url, &body).await?;
        Ok(())
    }

    async fn send(&self, body: String) -> ApiResult<MessageId> {
        let url = self.url(&["v1", "queues", self.queue_name()?, "messages"]);
        let response = self
            .send_json(reqwest::Method::POST, url, &SendRequest { body })
            .await?;
        let sent: SendResponse = decode(response).await?;
        Ok(sent.message_id)
    }

    fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }
}

#[async_trait]
impl DeadLetterStore for GatewayClient {
    async fn list_dead_letters(&self) -> ApiResult<Vec<DeadLetter>> {
        let url = self.url(&["v1", "queues", self.queue_name()?, "dead-letters"]);
        let list: DeadLetterList = self.get_json(url).await?;
        Ok(list.dead_letters)
    }

    async fn redrive_dead_letter(&self, message_id: &MessageId) -> ApiResult<()> {
        let url = self.url(&[
            "v1",
            "queues",
            self.queue_name()?,
            "dead-letters",
            message_id.as_str(),
            "redrive",
        ]);
        self.send_json(reqwest::Method::POST, url, &serde_json::json!({}))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SweepLease for GatewayClient {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> ApiResult<bool> {
        let url = self.url(&["v1", "leases", name, "acquire"]);
        let body = LeaseRequest {
            holder,
            ttl_seconds: Some(ttl.as_secs().max(1)),
        };
        let response = self.send_json(reqwest::Method::POST, url, &body).await?;
        let lease: LeaseResponse = decode(response).await?;
        Ok(lease.acquired)
    }

    async fn release(&self, name: &str, holder: &str) -> ApiResult<()> {
        let url = self.url(&["v1", "leases", name, "release"]);
        let body = LeaseRequest {
            holder,
            ttl_seconds: None,
        };
        match self.send_json(reqwest::Method::POST, url, &body).await {
            Ok(_) | Err(ApiError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
