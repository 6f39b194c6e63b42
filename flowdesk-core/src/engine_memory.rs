use crate::bpmn_xml::{self, FlowNode, ParsedProcess};
use crate::engine::{DefinitionFilter, ExecutionEngine, InstanceFilter, TaskFilter};
use crate::error::{EngineError, EngineResult, EntityKind};
use crate::expr;
use crate::types::*;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

/// In-memory execution engine for tests and the CLI.
///
/// All state sits behind one lock; every mutation (claim, complete, cascading
/// delete) runs under a single write guard and is therefore atomic. Token
/// execution covers start/end events, user tasks, pass-through tasks and
/// exclusive/parallel gateways.
pub struct MemoryEngine {
    state: RwLock<EngineState>,
    fail_next: AtomicU32,
    lose_next: AtomicU32,
    latency_ms: AtomicU64,
}

#[derive(Default)]
struct EngineState {
    deployments: BTreeMap<String, Deployment>,
    definitions: HashMap<String, StoredDefinition>,
    instances: HashMap<String, RuntimeInstance>,
    historic_instances: HashMap<String, HistoricProcessInstance>,
    tasks: HashMap<String, Task>,
    task_history: Vec<HistoricTaskInstance>,
    activity_history: Vec<HistoricActivityInstance>,
    deploy_requests: HashMap<Uuid, String>,
    start_requests: HashMap<Uuid, String>,
    /// Claim request id → the task as the claim left it.
    claim_requests: HashMap<Uuid, Task>,
}

/// What one instance's token run can touch; restored when the run fails.
struct InstanceSlice {
    instance_id: String,
    runtime: Option<RuntimeInstance>,
    historic: Option<HistoricProcessInstance>,
    tasks: Vec<Task>,
    task_history_len: usize,
    activity_history_len: usize,
}

#[derive(Clone)]
struct StoredDefinition {
    definition: ProcessDefinition,
    process: Arc<ParsedProcess>,
    layout: Arc<DiagramLayout>,
}

#[derive(Clone)]
struct RuntimeInstance {
    instance: ProcessInstance,
    /// Parallel join id → tokens arrived so far.
    joins: HashMap<String, usize>,
    next_sequence: u64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EngineState::default()),
            fail_next: AtomicU32::new(0),
            lose_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    // ── Fault injection ──

    /// The next `n` calls fail with `Unavailable` before touching state.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` deploy/start calls commit, then report `Unavailable`
    /// as if the response had been lost in transit.
    pub fn lose_next_responses(&self, n: u32) {
        self.lose_next.store(n, Ordering::SeqCst);
    }

    /// Delay applied to every call before it runs.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn gate(&self, operation: &str) -> EngineResult<()> {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if take_one(&self.fail_next) {
            return Err(EngineError::Unavailable(format!(
                "injected outage during {operation}"
            )));
        }
        Ok(())
    }

    fn response_lost(&self, operation: &str) -> EngineResult<()> {
        if take_one(&self.lose_next) {
            return Err(EngineError::Unavailable(format!(
                "connection dropped after {operation} committed"
            )));
        }
        Ok(())
    }

    fn read(&self) -> EngineResult<RwLockReadGuard<'_, EngineState>> {
        self.state
            .read()
            .map_err(|e| EngineError::Unavailable(format!("Lock: {}", e)))
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, EngineState>> {
        self.state
            .write()
            .map_err(|e| EngineError::Unavailable(format!("Lock: {}", e)))
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn is_definition_resource(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".bpmn") || lower.ends_with(".bpmn20.xml") || lower.ends_with(".xml")
}

// ── Token execution ──

impl EngineState {
    fn slice(&self, instance_id: &str) -> InstanceSlice {
        InstanceSlice {
            instance_id: instance_id.to_string(),
            runtime: self.instances.get(instance_id).cloned(),
            historic: self.historic_instances.get(instance_id).cloned(),
            tasks: self
                .tasks
                .values()
                .filter(|t| t.process_instance_id == instance_id)
                .cloned()
                .collect(),
            task_history_len: self.task_history.len(),
            activity_history_len: self.activity_history.len(),
        }
    }

    /// History is append-only under the write lock, so truncating undoes the run.
    fn restore(&mut self, slice: InstanceSlice) {
        let id = slice.instance_id;
        match slice.runtime {
            Some(runtime) => self.instances.insert(id.clone(), runtime),
            None => self.instances.remove(&id),
        };
        match slice.historic {
            Some(historic) => self.historic_instances.insert(id.clone(), historic),
            None => self.historic_instances.remove(&id),
        };
        self.tasks.retain(|_, t| t.process_instance_id != id);
        self.tasks
            .extend(slice.tasks.into_iter().map(|t| (t.id.clone(), t)));
        self.task_history.truncate(slice.task_history_len);
        self.activity_history.truncate(slice.activity_history_len);
    }

    fn latest_definition(&self, key: &str) -> Option<&StoredDefinition> {
        self.definitions
            .values()
            .filter(|d| d.definition.key == key)
            .max_by_key(|d| d.definition.version)
    }

    fn next_version(&self, key: &str) -> u32 {
        self.latest_definition(key)
            .map(|d| d.definition.version)
            .unwrap_or(0)
            + 1
    }

    /// Enter each queued node in turn until every token waits or ends.
    fn advance(
        &mut self,
        process: &ParsedProcess,
        instance_id: &str,
        entries: Vec<String>,
    ) -> EngineResult<()> {
        let mut queue: VecDeque<String> = entries.into();

        while let Some(node_id) = queue.pop_front() {
            let node = process.node(&node_id).ok_or_else(|| {
                EngineError::Rejected(format!("flow targets unknown element '{node_id}'"))
            })?;
            let runtime = self
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| EngineError::not_found(EntityKind::Instance, instance_id))?;

            let sequence_order = runtime.next_sequence;
            runtime.next_sequence += 1;
            self.activity_history.push(HistoricActivityInstance {
                process_instance_id: instance_id.to_string(),
                activity_id: node.id.clone(),
                activity_name: node.name.clone(),
                activity_type: node.kind,
                sequence_order,
                started_at: Utc::now(),
            });

            match node.kind {
                NodeKind::StartEvent
                | NodeKind::ServiceTask
                | NodeKind::ScriptTask
                | NodeKind::ManualTask => {
                    queue.extend(taken_flows(process, node, &runtime.instance.variables));
                }
                NodeKind::UserTask => {
                    let task = create_task(node, &runtime.instance);
                    tracing::debug!(
                        process_instance_id = %instance_id,
                        task_id = %task.id,
                        activity_id = %node.id,
                        assignee = ?task.assignee,
                        "user task created"
                    );
                    self.tasks.insert(task.id.clone(), task);
                }
                NodeKind::ExclusiveGateway => {
                    queue.push_back(choose_exclusive(process, node, &runtime.instance.variables)?);
                }
                NodeKind::ParallelGateway => {
                    let incoming = process.incoming_count(&node.id);
                    if incoming > 1 {
                        let arrived = runtime.joins.entry(node.id.clone()).or_insert(0);
                        *arrived += 1;
                        if *arrived < incoming {
                            continue;
                        }
                        runtime.joins.remove(&node.id);
                    }
                    queue.extend(process.outgoing(&node.id).map(|f| f.target.clone()));
                }
                NodeKind::EndEvent => {}
            }
        }

        let waiting = self
            .tasks
            .values()
            .any(|t| t.process_instance_id == instance_id);
        if let Some(runtime) = self.instances.get_mut(instance_id) {
            if !waiting && runtime.joins.is_empty() {
                let now = Utc::now();
                runtime.instance.status = InstanceStatus::Completed;
                runtime.instance.ended_at = Some(now);
                if let Some(h) = self.historic_instances.get_mut(instance_id) {
                    h.status = InstanceStatus::Completed;
                    h.ended_at = Some(now);
                }
            }
        }
        Ok(())
    }

    /// Move a task to history and continue from its node.
    fn complete(
        &mut self,
        process: &ParsedProcess,
        task_id: &str,
        assignee: &str,
        variables: &Variables,
    ) -> EngineResult<()> {
        let task = self
            .tasks
            .remove(task_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Task, task_id))?;
        let instance_id = task.process_instance_id.clone();
        let runtime = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Instance, &instance_id))?;
        runtime.instance.variables.extend(variables.clone());

        self.task_history.push(HistoricTaskInstance {
            process_instance_id: instance_id.clone(),
            task_id: task.id,
            activity_id: task.activity_id.clone(),
            name: task.name,
            assignee: assignee.to_string(),
            created_at: task.created_at,
            completed_at: Utc::now(),
            variables: variables.clone(),
        });

        let node = process.node(&task.activity_id).ok_or_else(|| {
            EngineError::Rejected(format!("task node '{}' not in definition", task.activity_id))
        })?;
        let next = taken_flows(process, node, &runtime.instance.variables);
        self.advance(process, &instance_id, next)
    }

    /// Remove an instance and every record that mentions it.
    fn purge_instance(&mut self, instance_id: &str) {
        self.instances.remove(instance_id);
        self.historic_instances.remove(instance_id);
        self.tasks.retain(|_, t| t.process_instance_id != instance_id);
        self.task_history
            .retain(|h| h.process_instance_id != instance_id);
        self.activity_history
            .retain(|h| h.process_instance_id != instance_id);
        self.start_requests.retain(|_, id| id != instance_id);
        self.claim_requests
            .retain(|_, t| t.process_instance_id != instance_id);
    }
}

/// Outgoing flows of a non-gateway node whose condition holds.
fn taken_flows(process: &ParsedProcess, node: &FlowNode, vars: &Variables) -> Vec<String> {
    process
        .outgoing(&node.id)
        .filter(|f| f.condition.as_ref().map_or(true, |c| c.evaluate(vars)))
        .map(|f| f.target.clone())
        .collect()
}

fn choose_exclusive(
    process: &ParsedProcess,
    node: &FlowNode,
    vars: &Variables,
) -> EngineResult<String> {
    let default = node.default_flow.as_deref();
    let mut fallback = None;
    for flow in process.outgoing(&node.id) {
        if Some(flow.id.as_str()) == default {
            fallback = Some(flow.target.clone());
            continue;
        }
        if flow.condition.as_ref().map_or(true, |c| c.evaluate(vars)) {
            return Ok(flow.target.clone());
        }
    }
    fallback.ok_or_else(|| {
        EngineError::Rejected(format!(
            "no outgoing flow of gateway '{}' matched and no default flow is set",
            node.id
        ))
    })
}

fn create_task(node: &FlowNode, instance: &ProcessInstance) -> Task {
    let vars = &instance.variables;
    let initiator = instance.started_by.as_str();
    let assignee = node
        .assignee
        .as_deref()
        .and_then(|a| expr::resolve_assignee(a, vars, initiator));
    let candidates = |raw: &Option<String>| {
        raw.as_deref()
            .map(|r| expr::resolve_candidates(r, vars, initiator))
            .unwrap_or_default()
    };
    Task {
        id: Uuid::now_v7().to_string(),
        process_instance_id: instance.id.clone(),
        activity_id: node.id.clone(),
        name: node.name.clone().unwrap_or_else(|| node.id.clone()),
        status: if assignee.is_some() {
            TaskStatus::Assigned
        } else {
            TaskStatus::Unassigned
        },
        assignee,
        candidate_users: candidates(&node.candidate_users),
        candidate_groups: candidates(&node.candidate_groups),
        variables: Variables::new(),
        created_at: Utc::now(),
    }
}

#[async_trait]
impl ExecutionEngine for MemoryEngine {
    async fn deploy(&self, source: &DeploymentSource) -> EngineResult<Deployment> {
        self.gate("deploy").await?;

        let mut parsed = Vec::with_capacity(source.resources.len());
        for resource in &source.resources {
            if !is_definition_resource(&resource.name) {
                return Err(EngineError::Rejected(format!(
                    "resource '{}' is not a BPMN definition",
                    resource.name
                )));
            }
            let xml = std::str::from_utf8(&resource.bytes).map_err(|e| {
                EngineError::Rejected(format!("resource '{}' is not UTF-8: {e}", resource.name))
            })?;
            let defs = bpmn_xml::parse_definitions(xml)
                .map_err(|e| EngineError::Rejected(format!("{}: {e}", resource.name)))?;
            parsed.push((resource.name.clone(), defs));
        }
        if parsed.is_empty() {
            return Err(EngineError::Rejected(
                "deployment contains no resources".to_string(),
            ));
        }

        let mut guard = self.write()?;
        let state = &mut *guard;

        if let Some(existing) = state
            .deploy_requests
            .get(&source.request_id)
            .and_then(|id| state.deployments.get(id))
        {
            tracing::debug!(deployment_id = %existing.id, "duplicate deploy request");
            return Ok(existing.clone());
        }

        let deployment_id = Uuid::now_v7().to_string();
        let mut definitions = Vec::new();
        for (resource_name, defs) in &parsed {
            for process in &defs.processes {
                let version = state.next_version(&process.key);
                let definition = ProcessDefinition {
                    id: format!("{}:{}:{}", process.key, version, Uuid::now_v7()),
                    key: process.key.clone(),
                    name: process.name.clone().unwrap_or_else(|| process.key.clone()),
                    version,
                    deployment_id: deployment_id.clone(),
                    resource_name: resource_name.clone(),
                };
                let layout = defs.layout_for(process, &definition.id);
                state.definitions.insert(
                    definition.id.clone(),
                    StoredDefinition {
                        definition: definition.clone(),
                        process: Arc::new(process.clone()),
                        layout: Arc::new(layout),
                    },
                );
                definitions.push(definition);
            }
        }

        let deployment = Deployment {
            id: deployment_id.clone(),
            name: source.name.clone(),
            model_id: source.model_id.clone(),
            created_at: Utc::now(),
            definitions,
        };
        state
            .deployments
            .insert(deployment_id.clone(), deployment.clone());
        state.deploy_requests.insert(source.request_id, deployment_id);
        drop(guard);

        self.response_lost("deploy")?;
        Ok(deployment)
    }

    async fn list_deployments(&self) -> EngineResult<Vec<Deployment>> {
        self.gate("list_deployments").await?;
        let state = self.read()?;
        Ok(state.deployments.values().cloned().collect())
    }

    async fn delete_deployment(&self, deployment_id: &str, cascade: bool) -> EngineResult<()> {
        self.gate("delete_deployment").await?;
        let mut guard = self.write()?;
        let state = &mut *guard;

        let deployment = state
            .deployments
            .get(deployment_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Deployment, deployment_id))?;
        let definition_ids: HashSet<String> =
            deployment.definitions.iter().map(|d| d.id.clone()).collect();

        let affected: Vec<(String, InstanceStatus)> = state
            .instances
            .values()
            .filter(|r| definition_ids.contains(&r.instance.definition_id))
            .map(|r| (r.instance.id.clone(), r.instance.status))
            .collect();
        let active = affected
            .iter()
            .filter(|(_, s)| *s == InstanceStatus::Active)
            .count();

        if !cascade && active > 0 {
            return Err(EngineError::ActiveInstances {
                deployment_id: deployment_id.to_string(),
                count: active,
            });
        }
        if cascade {
            for (instance_id, _) in &affected {
                state.purge_instance(instance_id);
            }
        }
        state.definitions.retain(|id, _| !definition_ids.contains(id));
        state.deployments.remove(deployment_id);
        state.deploy_requests.retain(|_, id| id != deployment_id);
        drop(guard);

        self.response_lost("delete_deployment")
    }

    async fn query_definitions(
        &self,
        filter: &DefinitionFilter,
        page: PageRequest,
    ) -> EngineResult<Page<ProcessDefinition>> {
        self.gate("query_definitions").await?;
        let state = self.read()?;

        let mut latest: HashMap<&str, u32> = HashMap::new();
        if filter.latest_only {
            for d in state.definitions.values() {
                let v = latest.entry(d.definition.key.as_str()).or_insert(0);
                *v = (*v).max(d.definition.version);
            }
        }

        let mut matches: Vec<ProcessDefinition> = state
            .definitions
            .values()
            .map(|d| &d.definition)
            .filter(|d| filter.id.as_ref().map_or(true, |id| &d.id == id))
            .filter(|d| filter.key.as_ref().map_or(true, |k| &d.key == k))
            .filter(|d| {
                filter
                    .deployment_id
                    .as_ref()
                    .map_or(true, |id| &d.deployment_id == id)
            })
            .filter(|d| !filter.latest_only || latest.get(d.key.as_str()) == Some(&d.version))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(Page::from_sorted(matches, page))
    }

    async fn get_layout(&self, definition_id: &str) -> EngineResult<DiagramLayout> {
        self.gate("get_layout").await?;
        let state = self.read()?;
        state
            .definitions
            .get(definition_id)
            .map(|d| d.layout.as_ref().clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Definition, definition_id))
    }

    async fn start(&self, request: &StartRequest) -> EngineResult<ProcessInstance> {
        self.gate("start").await?;
        let mut guard = self.write()?;
        let state = &mut *guard;

        if let Some(existing) = state
            .start_requests
            .get(&request.correlation_id)
            .and_then(|id| state.instances.get(id))
        {
            tracing::debug!(process_instance_id = %existing.instance.id, "duplicate start request");
            return Ok(existing.instance.clone());
        }

        let stored = state
            .latest_definition(&request.definition_key)
            .ok_or_else(|| EngineError::not_found(EntityKind::Definition, &request.definition_key))?;
        let process = stored.process.clone();
        let definition_id = stored.definition.id.clone();
        let start = process
            .start_event()
            .map(|n| n.id.clone())
            .ok_or_else(|| EngineError::Rejected(format!("process '{}' has no start event", process.key)))?;

        let now = Utc::now();
        let instance = ProcessInstance {
            id: Uuid::now_v7().to_string(),
            definition_id: definition_id.clone(),
            definition_key: request.definition_key.clone(),
            name: request.name.clone(),
            variables: request.variables.clone(),
            status: InstanceStatus::Active,
            started_by: request.started_by.clone(),
            started_at: now,
            ended_at: None,
        };
        let instance_id = instance.id.clone();

        let slice = state.slice(&instance_id);
        state.historic_instances.insert(
            instance_id.clone(),
            HistoricProcessInstance {
                id: instance_id.clone(),
                definition_id,
                definition_key: request.definition_key.clone(),
                started_by: request.started_by.clone(),
                started_at: now,
                ended_at: None,
                status: InstanceStatus::Active,
            },
        );
        state.instances.insert(
            instance_id.clone(),
            RuntimeInstance {
                instance,
                joins: HashMap::new(),
                next_sequence: 0,
            },
        );
        if let Err(e) = state.advance(&process, &instance_id, vec![start]) {
            state.restore(slice);
            return Err(e);
        }
        state
            .start_requests
            .insert(request.correlation_id, instance_id.clone());

        let started = state
            .instances
            .get(&instance_id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Instance, &instance_id))?;
        drop(guard);

        self.response_lost("start")?;
        Ok(started)
    }

    async fn query_instances(
        &self,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> EngineResult<Page<ProcessInstance>> {
        self.gate("query_instances").await?;
        let state = self.read()?;
        let mut matches: Vec<ProcessInstance> = state
            .instances
            .values()
            .map(|r| &r.instance)
            .filter(|i| filter.id.as_ref().map_or(true, |id| &i.id == id))
            .filter(|i| {
                filter
                    .definition_key
                    .as_ref()
                    .map_or(true, |k| &i.definition_key == k)
            })
            .filter(|i| {
                filter
                    .definition_id
                    .as_ref()
                    .map_or(true, |d| &i.definition_id == d)
            })
            .filter(|i| filter.started_by.as_ref().map_or(true, |u| &i.started_by == u))
            .filter(|i| filter.status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(Page::from_sorted(matches, page))
    }

    async fn delete_instances(
        &self,
        instance_ids: &[String],
        reason: &str,
        cascade: bool,
    ) -> EngineResult<()> {
        self.gate("delete_instances").await?;
        let mut guard = self.write()?;
        let state = &mut *guard;

        // All or nothing.
        for id in instance_ids {
            if !state.instances.contains_key(id) && !state.historic_instances.contains_key(id) {
                return Err(EngineError::not_found(EntityKind::Instance, id));
            }
        }

        let now = Utc::now();
        for id in instance_ids {
            if cascade {
                state.purge_instance(id);
                continue;
            }
            state.tasks.retain(|_, t| &t.process_instance_id != id);
            if let Some(runtime) = state.instances.get_mut(id) {
                if !runtime.instance.status.is_terminal() {
                    runtime.instance.status = InstanceStatus::Deleted;
                    runtime.instance.ended_at = Some(now);
                    runtime.joins.clear();
                }
            }
            if let Some(h) = state.historic_instances.get_mut(id) {
                if !h.status.is_terminal() {
                    h.status = InstanceStatus::Deleted;
                    h.ended_at = Some(now);
                }
            }
        }
        tracing::debug!(count = instance_ids.len(), cascade, reason, "instances deleted");
        Ok(())
    }

    async fn query_tasks(&self, filter: &TaskFilter, page: PageRequest) -> EngineResult<Page<Task>> {
        self.gate("query_tasks").await?;
        let state = self.read()?;
        let mut matches: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.id.as_ref().map_or(true, |id| &t.id == id))
            .filter(|t| {
                filter
                    .process_instance_id
                    .as_ref()
                    .map_or(true, |p| &t.process_instance_id == p)
            })
            .filter(|t| {
                filter
                    .assignee
                    .as_ref()
                    .map_or(true, |a| t.assignee.as_ref() == Some(a))
            })
            .filter(|t| {
                filter
                    .visible_to
                    .as_ref()
                    .map_or(true, |who| t.is_visible_to(who))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(Page::from_sorted(matches, page))
    }

    async fn claim_task(
        &self,
        request_id: Uuid,
        task_id: &str,
        assignee: &str,
    ) -> EngineResult<Task> {
        self.gate("claim_task").await?;
        let mut guard = self.write()?;
        let state = &mut *guard;

        if let Some(claimed) = state
            .claim_requests
            .get(&request_id)
            .filter(|t| t.id == task_id && t.assignee.as_deref() == Some(assignee))
        {
            tracing::debug!(task_id, "duplicate claim request");
            return Ok(claimed.clone());
        }

        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Task, task_id))?;
        if let Some(holder) = &task.assignee {
            return Err(EngineError::AlreadyClaimed {
                task_id: task_id.to_string(),
                assignee: holder.clone(),
            });
        }
        task.assignee = Some(assignee.to_string());
        task.status = TaskStatus::Assigned;
        let claimed = task.clone();
        state.claim_requests.insert(request_id, claimed.clone());
        drop(guard);

        self.response_lost("claim_task")?;
        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: &str,
        assignee: &str,
        variables: &Variables,
    ) -> EngineResult<()> {
        self.gate("complete_task").await?;
        let mut guard = self.write()?;
        let state = &mut *guard;

        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Task, task_id))?;
        if task.assignee.as_deref() != Some(assignee) {
            return Err(EngineError::NotAssignee {
                task_id: task_id.to_string(),
                user: assignee.to_string(),
            });
        }
        let instance_id = task.process_instance_id.clone();
        let runtime = state
            .instances
            .get(&instance_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Instance, &instance_id))?;
        let process = state
            .definitions
            .get(&runtime.instance.definition_id)
            .map(|d| d.process.clone())
            .ok_or_else(|| {
                EngineError::not_found(EntityKind::Definition, &runtime.instance.definition_id)
            })?;

        let slice = state.slice(&instance_id);
        if let Err(e) = state.complete(&process, task_id, assignee, variables) {
            state.restore(slice);
            return Err(e);
        }
        Ok(())
    }

    async fn historic_instance(
        &self,
        instance_id: &str,
    ) -> EngineResult<Option<HistoricProcessInstance>> {
        self.gate("historic_instance").await?;
        let state = self.read()?;
        Ok(state.historic_instances.get(instance_id).cloned())
    }

    async fn query_task_history(
        &self,
        instance_id: &str,
    ) -> EngineResult<Vec<HistoricTaskInstance>> {
        self.gate("query_task_history").await?;
        let state = self.read()?;
        Ok(state
            .task_history
            .iter()
            .filter(|h| h.process_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn query_activity_history(
        &self,
        instance_id: &str,
    ) -> EngineResult<Vec<HistoricActivityInstance>> {
        self.gate("query_activity_history").await?;
        let state = self.read()?;
        let mut records: Vec<_> = state
            .activity_history
            .iter()
            .filter(|h| h.process_instance_id == instance_id)
            .cloned()
            .collect();
        records.sort_by_key(|h| h.sequence_order);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PARALLEL: &str = r#"<definitions>
  <process id="onboard" name="Onboarding">
    <startEvent id="start"/>
    <parallelGateway id="fork"/>
    <userTask id="laptop" name="Order laptop" assignee="it"/>
    <userTask id="badge" name="Print badge" assignee="security"/>
    <parallelGateway id="join"/>
    <serviceTask id="notify" name="Notify"/>
    <endEvent id="end"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="fork"/>
    <sequenceFlow id="f2" sourceRef="fork" targetRef="laptop"/>
    <sequenceFlow id="f3" sourceRef="fork" targetRef="badge"/>
    <sequenceFlow id="f4" sourceRef="laptop" targetRef="join"/>
    <sequenceFlow id="f5" sourceRef="badge" targetRef="join"/>
    <sequenceFlow id="f6" sourceRef="join" targetRef="notify"/>
    <sequenceFlow id="f7" sourceRef="notify" targetRef="end"/>
  </process>
</definitions>"#;

    const GATED: &str = r#"<definitions>
  <process id="expense">
    <startEvent id="start"/>
    <exclusiveGateway id="gw"/>
    <userTask id="review" assignee="${initiator}"/>
    <endEvent id="end"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="gw"/>
    <sequenceFlow id="big" sourceRef="gw" targetRef="review">
      <conditionExpression>${amount > 100}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="small" sourceRef="gw" targetRef="end">
      <conditionExpression>${amount &lt;= 100}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f2" sourceRef="review" targetRef="end"/>
  </process>
</definitions>"#;

    fn source(name: &str, xml: &str) -> DeploymentSource {
        DeploymentSource {
            request_id: Uuid::now_v7(),
            name: name.to_string(),
            model_id: None,
            resources: vec![DeploymentResource {
                name: format!("{name}.bpmn20.xml"),
                bytes: xml.as_bytes().to_vec(),
            }],
        }
    }

    fn start_req(key: &str, user: &str, vars: serde_json::Value) -> StartRequest {
        StartRequest {
            correlation_id: Uuid::now_v7(),
            definition_key: key.to_string(),
            name: format!("{key} - {user}"),
            started_by: user.to_string(),
            variables: serde_json::from_value(vars).unwrap(),
        }
    }

    async fn tasks_of(engine: &MemoryEngine, instance_id: &str) -> Vec<Task> {
        let filter = TaskFilter {
            process_instance_id: Some(instance_id.to_string()),
            ..Default::default()
        };
        engine
            .query_tasks(&filter, PageRequest::all())
            .await
            .unwrap()
            .content
    }

    #[tokio::test]
    async fn test_versions_increase_per_key() {
        let engine = MemoryEngine::new();
        let d1 = engine.deploy(&source("onboard", PARALLEL)).await.unwrap();
        let d2 = engine.deploy(&source("onboard", PARALLEL)).await.unwrap();
        assert_eq!(d1.version(), Some(1));
        assert_eq!(d2.version(), Some(2));
        assert!(d2.definitions[0].id.starts_with("onboard:2:"));

        let latest = engine
            .query_definitions(&DefinitionFilter::latest_of("onboard"), PageRequest::all())
            .await
            .unwrap();
        assert_eq!(latest.content.len(), 1);
        assert_eq!(latest.content[0].version, 2);
    }

    #[tokio::test]
    async fn test_duplicate_deploy_request_is_deduplicated() {
        let engine = MemoryEngine::new();
        let src = source("onboard", PARALLEL);
        let a = engine.deploy(&src).await.unwrap();
        let b = engine.deploy(&src).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(engine.list_deployments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_fork_join_completes() {
        let engine = MemoryEngine::new();
        engine.deploy(&source("onboard", PARALLEL)).await.unwrap();
        let inst = engine
            .start(&start_req("onboard", "hr", json!({})))
            .await
            .unwrap();
        assert_eq!(inst.status, InstanceStatus::Active);

        let tasks = tasks_of(&engine, &inst.id).await;
        assert_eq!(tasks.len(), 2);
        for t in &tasks {
            let who = t.assignee.clone().unwrap();
            engine.complete_task(&t.id, &who, &Variables::new()).await.unwrap();
        }

        let done = engine
            .query_instances(&InstanceFilter::by_id(&inst.id), PageRequest::all())
            .await
            .unwrap();
        assert_eq!(done.content[0].status, InstanceStatus::Completed);

        let trace: Vec<String> = engine
            .query_activity_history(&inst.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.activity_id)
            .collect();
        // The join is entered once per arriving token; notify runs once.
        assert_eq!(trace.iter().filter(|a| *a == "join").count(), 2);
        assert_eq!(trace.iter().filter(|a| *a == "notify").count(), 1);
        assert_eq!(trace.last().map(String::as_str), Some("end"));
    }

    #[tokio::test]
    async fn test_exclusive_gateway_routes_on_variables() {
        let engine = MemoryEngine::new();
        engine.deploy(&source("expense", GATED)).await.unwrap();

        let small = engine
            .start(&start_req("expense", "alice", json!({"amount": 20})))
            .await
            .unwrap();
        assert_eq!(small.status, InstanceStatus::Completed);

        let big = engine
            .start(&start_req("expense", "alice", json!({"amount": 500})))
            .await
            .unwrap();
        let tasks = tasks_of(&engine, &big.id).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].assignee.as_deref(), Some("alice"));
        assert_eq!(tasks[0].status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_unroutable_start_rolls_back() {
        let engine = MemoryEngine::new();
        engine.deploy(&source("expense", GATED)).await.unwrap();
        let err = engine
            .start(&start_req("expense", "alice", json!({"amount": "lots"})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let all = engine
            .query_instances(&InstanceFilter::default(), PageRequest::all())
            .await
            .unwrap();
        assert_eq!(all.total, 0);
    }

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let engine = MemoryEngine::new();
        let xml = GATED.replace(r#"assignee="${initiator}""#, "");
        engine.deploy(&source("expense", &xml)).await.unwrap();
        let inst = engine
            .start(&start_req("expense", "alice", json!({"amount": 500})))
            .await
            .unwrap();
        let task = &tasks_of(&engine, &inst.id).await[0];
        assert_eq!(task.status, TaskStatus::Unassigned);

        let claimed = engine
            .claim_task(Uuid::now_v7(), &task.id, "bob")
            .await
            .unwrap();
        assert_eq!(claimed.assignee.as_deref(), Some("bob"));

        let err = engine
            .claim_task(Uuid::now_v7(), &task.id, "carol")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::AlreadyClaimed {
                task_id: task.id.clone(),
                assignee: "bob".into()
            }
        );

        let err = engine
            .complete_task(&task.id, "carol", &Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotAssignee { .. }));
    }

    #[tokio::test]
    async fn test_claim_request_is_deduplicated() {
        let engine = MemoryEngine::new();
        let xml = GATED.replace(r#"assignee="${initiator}""#, "");
        engine.deploy(&source("expense", &xml)).await.unwrap();
        let inst = engine
            .start(&start_req("expense", "alice", json!({"amount": 500})))
            .await
            .unwrap();
        let task_id = tasks_of(&engine, &inst.id).await[0].id.clone();

        let request_id = Uuid::now_v7();
        engine.lose_next_responses(1);
        assert!(engine.claim_task(request_id, &task_id, "bob").await.is_err());
        // The lost claim committed; re-sending the same request returns it.
        let retried = engine.claim_task(request_id, &task_id, "bob").await.unwrap();
        assert_eq!(retried.assignee.as_deref(), Some("bob"));

        // A fresh claim by the holder is a new claim and fails.
        let err = engine
            .claim_task(Uuid::now_v7(), &task_id, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClaimed { .. }));
        // The request id does not carry over to another user.
        let err = engine
            .claim_task(request_id, &task_id, "carol")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClaimed { .. }));
    }

    #[tokio::test]
    async fn test_unroutable_completion_rolls_back_only_that_instance() {
        const FORM_THEN_GATE: &str = r#"<definitions>
  <process id="claim">
    <startEvent id="start"/>
    <userTask id="fill" assignee="${initiator}"/>
    <exclusiveGateway id="gw"/>
    <userTask id="review" assignee="auditor"/>
    <endEvent id="end"/>
    <sequenceFlow id="f1" sourceRef="start" targetRef="fill"/>
    <sequenceFlow id="f2" sourceRef="fill" targetRef="gw"/>
    <sequenceFlow id="big" sourceRef="gw" targetRef="review">
      <conditionExpression>${amount > 100}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="small" sourceRef="gw" targetRef="end">
      <conditionExpression>${amount &lt;= 100}</conditionExpression>
    </sequenceFlow>
    <sequenceFlow id="f3" sourceRef="review" targetRef="end"/>
  </process>
</definitions>"#;
        let engine = MemoryEngine::new();
        engine.deploy(&source("claim", FORM_THEN_GATE)).await.unwrap();
        let other = engine
            .start(&start_req("claim", "carol", json!({})))
            .await
            .unwrap();
        let inst = engine
            .start(&start_req("claim", "alice", json!({})))
            .await
            .unwrap();
        let task_id = tasks_of(&engine, &inst.id).await[0].id.clone();
        let trace_before = engine.query_activity_history(&inst.id).await.unwrap().len();

        let mut vars = Variables::new();
        vars.insert("amount".into(), json!("lots"));
        let err = engine
            .complete_task(&task_id, "alice", &vars)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));

        let tasks = tasks_of(&engine, &inst.id).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task_id);
        assert_eq!(tasks[0].assignee.as_deref(), Some("alice"));
        assert!(engine.query_task_history(&inst.id).await.unwrap().is_empty());
        assert_eq!(
            engine.query_activity_history(&inst.id).await.unwrap().len(),
            trace_before
        );
        let runtime = engine
            .query_instances(&InstanceFilter::by_id(&inst.id), PageRequest::all())
            .await
            .unwrap()
            .content
            .remove(0);
        assert!(!runtime.variables.contains_key("amount"));
        assert_eq!(tasks_of(&engine, &other.id).await.len(), 1);

        vars.insert("amount".into(), json!(20));
        engine.complete_task(&task_id, "alice", &vars).await.unwrap();
        let h = engine.historic_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(h.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_delete_deployment_guards_active_instances() {
        let engine = MemoryEngine::new();
        let dep = engine.deploy(&source("onboard", PARALLEL)).await.unwrap();
        let inst = engine
            .start(&start_req("onboard", "hr", json!({})))
            .await
            .unwrap();

        let err = engine.delete_deployment(&dep.id, false).await.unwrap_err();
        assert!(matches!(err, EngineError::ActiveInstances { count: 1, .. }));

        engine.delete_deployment(&dep.id, true).await.unwrap();
        assert!(engine.historic_instance(&inst.id).await.unwrap().is_none());
        assert!(tasks_of(&engine, &inst.id).await.is_empty());
        assert!(engine
            .query_activity_history(&inst.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_non_cascade_delete_keeps_history() {
        let engine = MemoryEngine::new();
        engine.deploy(&source("onboard", PARALLEL)).await.unwrap();
        let inst = engine
            .start(&start_req("onboard", "hr", json!({})))
            .await
            .unwrap();

        engine
            .delete_instances(&[inst.id.clone()], "cancelled", false)
            .await
            .unwrap();
        let h = engine.historic_instance(&inst.id).await.unwrap().unwrap();
        assert_eq!(h.status, InstanceStatus::Deleted);
        assert!(tasks_of(&engine, &inst.id).await.is_empty());

        let err = engine
            .delete_instances(&[inst.id.clone(), "ghost".into()], "x", true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: EntityKind::Instance, .. }));
        // Nothing was removed by the failed batch.
        assert!(engine.historic_instance(&inst.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let engine = MemoryEngine::new();
        engine.fail_next(1);
        let err = engine.list_deployments().await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
        assert!(engine.list_deployments().await.is_ok());

        engine.lose_next_responses(1);
        let src = source("onboard", PARALLEL);
        assert!(engine.deploy(&src).await.is_err());
        // The lost deploy committed; the retry returns it.
        let retried = engine.deploy(&src).await.unwrap();
        assert_eq!(retried.version(), Some(1));
        assert_eq!(engine.list_deployments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_definition_resource() {
        let engine = MemoryEngine::new();
        let mut src = source("onboard", PARALLEL);
        src.resources[0].name = "notes.txt".into();
        assert!(matches!(
            engine.deploy(&src).await.unwrap_err(),
            EngineError::Rejected(_)
        ));
    }
}
