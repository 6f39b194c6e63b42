use crate::error::EngineResult;
use crate::types::*;
use async_trait::async_trait;
use uuid::Uuid;

// ── Filters ──
// One criteria value per entity; unset fields do not constrain the query.

#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    pub id: Option<String>,
    pub key: Option<String>,
    pub deployment_id: Option<String>,
    /// Only the highest version of each key.
    pub latest_only: bool,
}

impl DefinitionFilter {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn latest_of(key: &str) -> Self {
        Self {
            key: Some(key.to_string()),
            latest_only: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub id: Option<String>,
    pub definition_key: Option<String>,
    pub definition_id: Option<String>,
    pub started_by: Option<String>,
    pub status: Option<InstanceStatus>,
}

impl InstanceFilter {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub id: Option<String>,
    pub process_instance_id: Option<String>,
    pub assignee: Option<String>,
    /// Assigned to, or claimable by, this identity.
    pub visible_to: Option<Identity>,
}

// ── Engine ──

/// The BPMN token-execution engine the core orchestrates.
///
/// Every mutation is atomic from the caller's point of view. `deploy` and
/// `start` deduplicate on their request ids so a re-run after a transient
/// failure is harmless.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    // Repository
    async fn deploy(&self, source: &DeploymentSource) -> EngineResult<Deployment>;
    async fn list_deployments(&self) -> EngineResult<Vec<Deployment>>;
    async fn delete_deployment(&self, deployment_id: &str, cascade: bool) -> EngineResult<()>;
    async fn query_definitions(
        &self,
        filter: &DefinitionFilter,
        page: PageRequest,
    ) -> EngineResult<Page<ProcessDefinition>>;
    async fn get_layout(&self, definition_id: &str) -> EngineResult<DiagramLayout>;

    // Runtime
    async fn start(&self, request: &StartRequest) -> EngineResult<ProcessInstance>;
    async fn query_instances(
        &self,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> EngineResult<Page<ProcessInstance>>;
    /// Removes every listed instance, or none of them.
    async fn delete_instances(
        &self,
        instance_ids: &[String],
        reason: &str,
        cascade: bool,
    ) -> EngineResult<()>;
    async fn query_tasks(&self, filter: &TaskFilter, page: PageRequest) -> EngineResult<Page<Task>>;
    /// Compare-and-set: succeeds only while the task is unassigned. A repeated
    /// `request_id` from the same assignee returns the original claim.
    async fn claim_task(
        &self,
        request_id: Uuid,
        task_id: &str,
        assignee: &str,
    ) -> EngineResult<Task>;
    /// Succeeds only while `assignee` still holds the task.
    async fn complete_task(
        &self,
        task_id: &str,
        assignee: &str,
        variables: &Variables,
    ) -> EngineResult<()>;

    // History
    async fn historic_instance(
        &self,
        instance_id: &str,
    ) -> EngineResult<Option<HistoricProcessInstance>>;
    async fn query_task_history(&self, instance_id: &str)
        -> EngineResult<Vec<HistoricTaskInstance>>;
    async fn query_activity_history(
        &self,
        instance_id: &str,
    ) -> EngineResult<Vec<HistoricActivityInstance>>;
}
