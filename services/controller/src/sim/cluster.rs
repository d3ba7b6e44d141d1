//! In-memory orchestrator and node pool.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tidepool_events::DrainState;
use tidepool_id::{InstanceId, NodeId, TaskDefinitionRef, TaskId};
use tidepool_reconcile::{InstanceLifecycle, PoolMember};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::error::{ApiError, ApiResult};
use crate::model::{
    Node, PlacementFailure, PoolDescription, RunTaskOutput, RunTaskRequest, StartedTask,
    StoppedTask,
};
use crate::placement::{rank_binpack_memory, ResourceRequest};
use crate::pool::NodePoolClient;

/// CPU units every simulated node offers.
const NODE_CPU_UNITS: u32 = 2048;

/// Entries kept in each inspection log (started, terminated, killed).
const HISTORY_LIMIT: usize = 1024;

/// Stopped tasks remembered per node; only the latest stop drives idleness.
const STOPPED_TASKS_PER_NODE: usize = 16;

fn record<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() >= HISTORY_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

/// A task the simulated orchestrator accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedRecord {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub task_definition: TaskDefinitionRef,
    pub started_by: String,
}

#[derive(Debug, Clone)]
struct RunningTask {
    request: ResourceRequest,
    started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SimNode {
    instance_id: InstanceId,
    registered_at: DateTime<Utc>,
    drain_state: DrainState,
    launch_config_version: Option<String>,
    memory_mib: u32,
    cpu_units: u32,
    running: BTreeMap<TaskId, RunningTask>,
    stopped: Vec<StoppedTask>,
}

impl SimNode {
    fn view(&self, node_id: &NodeId) -> Node {
        let used_memory: u32 = self.running.values().map(|t| t.request.memory_mib).sum();
        let used_cpu: u32 = self.running.values().map(|t| t.request.cpu_units).sum();
        Node {
            node_id: node_id.clone(),
            instance_id: self.instance_id.clone(),
            registered_at: self.registered_at,
            running_tasks: u32::try_from(self.running.len()).unwrap_or(u32::MAX),
            drain_state: self.drain_state,
            launch_config_version: self.launch_config_version.clone(),
            remaining_memory_mib: self.memory_mib.saturating_sub(used_memory),
            remaining_cpu_units: self.cpu_units.saturating_sub(used_cpu),
            last_task_stopped_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    run_task: Option<ApiError>,
    list_nodes: bool,
    terminate: bool,
    drain: HashSet<NodeId>,
    hung_activity: HashSet<NodeId>,
    failing_activity: HashSet<NodeId>,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<NodeId, SimNode>,
    instances: BTreeMap<InstanceId, PoolMember>,
    task_index: HashMap<TaskId, NodeId>,
    desired_capacity: u32,
    max_size: Option<u32>,
    launch_config_version: Option<String>,
    started: VecDeque<StartedRecord>,
    terminated: VecDeque<InstanceId>,
    killed_tasks: VecDeque<TaskId>,
    capacity_changes: u32,
    cooldown_bypasses: u32,
    faults: Faults,
}

impl State {
    fn live_instances(&self) -> usize {
        self.instances
            .values()
            .filter(|m| !m.lifecycle.is_leaving())
            .count()
    }

    /// Launch pending instances until the live count meets desired capacity.
    fn launch_to_desired(&mut self) {
        let target = usize::try_from(self.desired_capacity).unwrap_or(usize::MAX);
        while self.live_instances() < target {
            let instance_id = InstanceId::generate("i");
            debug!(instance_id = %instance_id, "Launching simulated instance");
            self.instances.insert(
                instance_id.clone(),
                PoolMember {
                    instance_id,
                    launched_at: Utc::now(),
                    lifecycle: InstanceLifecycle::Pending,
                    launch_config_version: self.launch_config_version.clone(),
                },
            );
        }
    }

    fn register(&mut self, instance_id: &InstanceId, memory_mib: u32) -> Option<NodeId> {
        let member = self.instances.get_mut(instance_id)?;
        if member.lifecycle.is_leaving() {
            return None;
        }
        member.lifecycle = InstanceLifecycle::InService;
        let version = member.launch_config_version.clone();
        Some(self.attach_node(instance_id, memory_mib, version))
    }

    fn attach_node(
        &mut self,
        instance_id: &InstanceId,
        memory_mib: u32,
        launch_config_version: Option<String>,
    ) -> NodeId {
        let node_id = NodeId::generate("node");
        self.nodes.insert(
            node_id.clone(),
            SimNode {
                instance_id: instance_id.clone(),
                registered_at: Utc::now(),
                drain_state: DrainState::Active,
                launch_config_version,
                memory_mib,
                cpu_units: NODE_CPU_UNITS,
                running: BTreeMap::new(),
                stopped: Vec::new(),
            },
        );
        node_id
    }

    fn stop(&mut self, task_id: &TaskId, at: DateTime<Utc>) -> ApiResult<()> {
        let node_id = self
            .task_index
            .remove(task_id)
            .ok_or_else(|| ApiError::NotFound(format!("task {task_id}")))?;
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")))?;
        node.running.remove(task_id);
        node.stopped.push(StoppedTask {
            task_id: task_id.clone(),
            stopped_at: at,
        });
        if node.stopped.len() > STOPPED_TASKS_PER_NODE {
            node.stopped.sort_by_key(|t| std::cmp::Reverse(t.stopped_at));
            node.stopped.truncate(STOPPED_TASKS_PER_NODE);
        }
        Ok(())
    }
}

/// Background behaviour of the simulated cluster.
#[derive(Debug, Clone, Copy)]
pub struct SimulationSettings {
    /// Time between launch and registration.
    pub boot_delay: Duration,
    /// Memory each registered node offers.
    pub node_memory_mib: u32,
    /// How long each task runs before stopping.
    pub task_runtime: Duration,
    pub tick: Duration,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            boot_delay: Duration::from_secs(90),
            node_memory_mib: 8192,
            task_runtime: Duration::from_secs(300),
            tick: Duration::from_secs(1),
        }
    }
}

/// An in-memory cluster: the orchestrator and the node pool behind it.
///
/// Placement is binpack by memory. Desired capacity increases launch
/// `Pending` instances that join the cluster only when registered; decreases
/// never remove instances on their own.
#[derive(Debug)]
pub struct SimulatedCluster {
    cluster_name: String,
    state: Mutex<State>,
}

impl SimulatedCluster {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_max_size(mut self, max_size: u32) -> Self {
        self.state.get_mut().max_size = Some(max_size);
        self
    }

    /// Launch configuration new instances are created from.
    pub fn with_launch_config(mut self, version: impl Into<String>) -> Self {
        self.state.get_mut().launch_config_version = Some(version.into());
        self
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    // =========================================================================
    // Cluster manipulation
    // =========================================================================

    /// Add an in-service instance with a registered node, growing desired
    /// capacity to match.
    pub async fn add_registered_node(&self, memory_mib: u32) -> NodeId {
        let mut state = self.state.lock().await;
        let version = state.launch_config_version.clone();
        Self::add_node_locked(&mut state, memory_mib, version)
    }

    /// Same as [`Self::add_registered_node`] with an explicit launch configuration.
    pub async fn add_registered_node_with_config(
        &self,
        memory_mib: u32,
        launch_config_version: impl Into<String>,
    ) -> NodeId {
        let mut state = self.state.lock().await;
        Self::add_node_locked(&mut state, memory_mib, Some(launch_config_version.into()))
    }

    fn add_node_locked(state: &mut State, memory_mib: u32, version: Option<String>) -> NodeId {
        let instance_id = InstanceId::generate("i");
        state.instances.insert(
            instance_id.clone(),
            PoolMember {
                instance_id: instance_id.clone(),
                launched_at: Utc::now(),
                lifecycle: InstanceLifecycle::InService,
                launch_config_version: version.clone(),
            },
        );
        state.desired_capacity = state.desired_capacity.saturating_add(1);
        state.attach_node(&instance_id, memory_mib, version)
    }

    /// Register every pending instance as a node.
    pub async fn register_pending_instances(&self, memory_mib: u32) -> Vec<NodeId> {
        let mut state = self.state.lock().await;
        let pending: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|m| m.lifecycle == InstanceLifecycle::Pending)
            .map(|m| m.instance_id.clone())
            .collect();

        pending
            .iter()
            .filter_map(|id| state.register(id, memory_mib))
            .collect()
    }

    /// Register pending instances launched at or before `cutoff`.
    pub async fn register_instances_launched_before(
        &self,
        cutoff: DateTime<Utc>,
        memory_mib: u32,
    ) -> Vec<NodeId> {
        let mut state = self.state.lock().await;
        let ready: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|m| m.lifecycle == InstanceLifecycle::Pending && m.launched_at <= cutoff)
            .map(|m| m.instance_id.clone())
            .collect();

        ready
            .iter()
            .filter_map(|id| state.register(id, memory_mib))
            .collect()
    }

    /// Start a task directly on a node, bypassing placement.
    pub async fn start_task_on(&self, node_id: &NodeId, memory_mib: u32) -> ApiResult<TaskId> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")))?;

        let task_id = TaskId::generate("task");
        node.running.insert(
            task_id.clone(),
            RunningTask {
                request: ResourceRequest::with_memory(Some(memory_mib)),
                started_at: Utc::now(),
            },
        );
        state.task_index.insert(task_id.clone(), node_id.clone());
        Ok(task_id)
    }

    /// Stop a running task now.
    pub async fn stop_task(&self, task_id: &TaskId) -> ApiResult<()> {
        self.stop_task_at(task_id, Utc::now()).await
    }

    /// Stop a running task, recording the given stop time.
    pub async fn stop_task_at(&self, task_id: &TaskId, at: DateTime<Utc>) -> ApiResult<()> {
        self.state.lock().await.stop(task_id, at)
    }

    /// Stop every task running on a node.
    pub async fn stop_all_tasks_on(&self, node_id: &NodeId) -> usize {
        let mut state = self.state.lock().await;
        let running: Vec<TaskId> = state
            .nodes
            .get(node_id)
            .map(|n| n.running.keys().cloned().collect())
            .unwrap_or_default();

        let now = Utc::now();
        running
            .iter()
            .filter(|task_id| state.stop(task_id, now).is_ok())
            .count()
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Fail every run-task call with `error`.
    pub async fn fail_run_task(&self, error: ApiError) {
        self.state.lock().await.faults.run_task = Some(error);
    }

    pub async fn fail_list_nodes(&self, fail: bool) {
        self.state.lock().await.faults.list_nodes = fail;
    }

    pub async fn fail_terminations(&self, fail: bool) {
        self.state.lock().await.faults.terminate = fail;
    }

    /// Make stopped-task queries for a node never answer.
    pub async fn hang_activity_queries(&self, node_id: &NodeId) {
        self.state.lock().await.faults.hung_activity.insert(node_id.clone());
    }

    /// Make stopped-task queries for a node fail.
    pub async fn fail_activity_queries(&self, node_id: &NodeId) {
        self.state
            .lock()
            .await
            .faults
            .failing_activity
            .insert(node_id.clone());
    }

    /// Make drain-state changes for a node fail.
    pub async fn fail_drain(&self, node_id: &NodeId) {
        self.state.lock().await.faults.drain.insert(node_id.clone());
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn desired_capacity(&self) -> u32 {
        self.state.lock().await.desired_capacity
    }

    /// Number of desired-capacity changes requested through the pool API.
    pub async fn capacity_changes(&self) -> u32 {
        self.state.lock().await.capacity_changes
    }

    /// Number of those changes that bypassed the cool-down.
    pub async fn cooldown_bypasses(&self) -> u32 {
        self.state.lock().await.cooldown_bypasses
    }

    pub async fn registered_nodes(&self) -> Vec<NodeId> {
        self.state.lock().await.nodes.keys().cloned().collect()
    }

    /// Drain state of a node, or `None` once it is gone.
    pub async fn drain_state(&self, node_id: &NodeId) -> Option<DrainState> {
        self.state
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(|n| n.drain_state)
    }

    pub async fn running_tasks(&self, node_id: &NodeId) -> Option<u32> {
        self.state
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(|n| u32::try_from(n.running.len()).unwrap_or(u32::MAX))
    }

    pub async fn started_tasks(&self) -> Vec<StartedRecord> {
        self.state.lock().await.started.iter().cloned().collect()
    }

    pub async fn terminated_instances(&self) -> Vec<InstanceId> {
        self.state.lock().await.terminated.iter().cloned().collect()
    }

    /// Tasks that were still running when their node was terminated.
    pub async fn killed_tasks(&self) -> Vec<TaskId> {
        self.state.lock().await.killed_tasks.iter().cloned().collect()
    }

    pub async fn pool_members(&self) -> Vec<PoolMember> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    // =========================================================================
    // Background simulation
    // =========================================================================

    /// Register booted instances and finish long-running tasks until shutdown.
    pub async fn run(&self, settings: SimulationSettings, mut shutdown: watch::Receiver<bool>) {
        info!(
            boot_delay_secs = settings.boot_delay.as_secs(),
            task_runtime_secs = settings.task_runtime.as_secs(),
            "Starting cluster simulation"
        );

        let mut interval = tokio::time::interval(settings.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.simulate_tick(settings).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cluster simulation shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn simulate_tick(&self, settings: SimulationSettings) {
        let now = Utc::now();
        let boot = chrono::Duration::from_std(settings.boot_delay).unwrap_or_default();
        let runtime = chrono::Duration::from_std(settings.task_runtime).unwrap_or_default();

        let registered = self
            .register_instances_launched_before(now - boot, settings.node_memory_mib)
            .await;
        for node_id in registered {
            info!(node_id = %node_id, "Simulated node registered");
        }

        let mut state = self.state.lock().await;
        let finished: Vec<TaskId> = state
            .nodes
            .values()
            .flat_map(|n| n.running.iter())
            .filter(|(_, t)| now - t.started_at >= runtime)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in finished {
            if state.stop(&task_id, now).is_ok() {
                debug!(task_id = %task_id, "Simulated task finished");
            }
        }
    }
}

#[async_trait]
impl ClusterApi for SimulatedCluster {
    async fn run_task(&self, request: RunTaskRequest) -> ApiResult<RunTaskOutput> {
        let mut state = self.state.lock().await;
        if let Some(error) = &state.faults.run_task {
            return Err(error.clone());
        }
        if request.cluster != self.cluster_name {
            return Err(ApiError::NotFound(format!("cluster {}", request.cluster)));
        }

        let nodes: Vec<Node> = state.nodes.iter().map(|(id, n)| n.view(id)).collect();
        if nodes.iter().all(|n| n.drain_state != DrainState::Active) {
            return Err(ApiError::NoCapacity(
                "no ACTIVE nodes registered in cluster".to_string(),
            ));
        }

        let resources =
            ResourceRequest::with_memory(request.overrides.as_ref().and_then(|o| o.memory));
        let Some(node_id) = rank_binpack_memory(&nodes, resources)
            .first()
            .map(|n| n.node_id.clone())
        else {
            let failures = nodes
                .iter()
                .filter(|n| n.drain_state == DrainState::Active)
                .map(|n| PlacementFailure {
                    reason: if n.remaining_memory_mib < resources.memory_mib {
                        "RESOURCE:MEMORY".to_string()
                    } else {
                        "RESOURCE:CPU".to_string()
                    },
                    node_id: Some(n.node_id.clone()),
                })
                .collect();
            return Ok(RunTaskOutput {
                tasks: Vec::new(),
                failures,
            });
        };

        let task_id = TaskId::generate("task");
        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.running.insert(
                task_id.clone(),
                RunningTask {
                    request: resources,
                    started_at: Utc::now(),
                },
            );
        }
        state.task_index.insert(task_id.clone(), node_id.clone());
        record(
            &mut state.started,
            StartedRecord {
                task_id: task_id.clone(),
                node_id: node_id.clone(),
                task_definition: request.task_definition,
                started_by: request.started_by,
            },
        );

        Ok(RunTaskOutput {
            tasks: vec![StartedTask { task_id, node_id }],
            failures: Vec::new(),
        })
    }

    async fn list_nodes(&self) -> ApiResult<Vec<Node>> {
        let state = self.state.lock().await;
        if state.faults.list_nodes {
            return Err(ApiError::Transport("simulated list_nodes failure".to_string()));
        }
        Ok(state.nodes.iter().map(|(id, n)| n.view(id)).collect())
    }

    async fn list_stopped_tasks(&self, node_id: &NodeId) -> ApiResult<Vec<StoppedTask>> {
        {
            let state = self.state.lock().await;
            if state.faults.failing_activity.contains(node_id) {
                return Err(ApiError::Transport(format!(
                    "simulated stopped-task query failure for {node_id}"
                )));
            }
            if !state.faults.hung_activity.contains(node_id) {
                return state
                    .nodes
                    .get(node_id)
                    .map(|n| n.stopped.clone())
                    .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")));
            }
        }

        std::future::pending::<ApiResult<Vec<StoppedTask>>>().await
    }

    async fn set_drain_state(&self, node_id: &NodeId, drain_state: DrainState) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.drain.contains(node_id) {
            return Err(ApiError::Transport(format!(
                "simulated drain-state failure for {node_id}"
            )));
        }
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ApiError::NotFound(format!("node {node_id}")))?;
        node.drain_state = drain_state;
        Ok(())
    }
}

#[async_trait]
impl NodePoolClient for SimulatedCluster {
    async fn describe_pool(&self) -> ApiResult<PoolDescription> {
        let state = self.state.lock().await;
        Ok(PoolDescription {
            desired_capacity: state.desired_capacity,
            min_size: 0,
            max_size: state.max_size,
            launch_config_version: state.launch_config_version.clone(),
            instances: state.instances.values().cloned().collect(),
        })
    }

    async fn set_desired_capacity(&self, desired: u32, honor_cooldown: bool) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if let Some(max) = state.max_size.filter(|max| desired > *max) {
            return Err(ApiError::Rejected {
                status: 400,
                message: format!("desired capacity {desired} exceeds max size {max}"),
            });
        }

        state.capacity_changes += 1;
        if !honor_cooldown {
            state.cooldown_bypasses += 1;
        }
        state.desired_capacity = desired;
        state.launch_to_desired();
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &InstanceId,
        decrement_desired: bool,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        if state.faults.terminate {
            return Err(ApiError::Transport("simulated terminate failure".to_string()));
        }

        // Already gone or on its way out.
        match state.instances.get(instance_id) {
            Some(member) if !member.lifecycle.is_leaving() => {}
            _ => return Ok(()),
        }
        state.instances.remove(instance_id);

        let backing: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(_, n)| &n.instance_id == instance_id)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in backing {
            if let Some(node) = state.nodes.remove(&node_id) {
                for task_id in node.running.keys() {
                    state.task_index.remove(task_id);
                    record(&mut state.killed_tasks, task_id.clone());
                }
            }
        }

        record(&mut state.terminated, instance_id.clone());
        if decrement_desired {
            state.desired_capacity = state.desired_capacity.saturating_sub(1);
        }
        debug!(instance_id = %instance_id, decrement_desired, "Terminated simulated instance");
        Ok(())
    }
}
