use crate::engine::{DefinitionFilter, ExecutionEngine, InstanceFilter, TaskFilter};
use crate::error::{EngineResult, EntityKind, OrchestratorError};
use crate::types::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Deadline-bounded view of the execution engine.
///
/// Every call either completes within the deadline or fails with
/// `Timeout`; engine errors are mapped into the public taxonomy.
#[derive(Clone)]
pub struct EngineClient {
    engine: Arc<dyn ExecutionEngine>,
    deadline: Duration,
}

impl EngineClient {
    pub fn new(engine: Arc<dyn ExecutionEngine>, deadline: Duration) -> Self {
        Self { engine, deadline }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = EngineResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result.map_err(OrchestratorError::from),
            Err(_) => {
                let after_ms = self.deadline.as_millis() as u64;
                tracing::warn!(operation, after_ms, "Engine call timed out");
                Err(OrchestratorError::Timeout {
                    operation: operation.to_string(),
                    after_ms,
                })
            }
        }
    }

    // ── Repository ──

    pub async fn deploy(&self, source: &DeploymentSource) -> Result<Deployment> {
        self.call("deploy", self.engine.deploy(source)).await
    }

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        self.call("list_deployments", self.engine.list_deployments())
            .await
    }

    pub async fn delete_deployment(&self, deployment_id: &str, cascade: bool) -> Result<()> {
        self.call(
            "delete_deployment",
            self.engine.delete_deployment(deployment_id, cascade),
        )
        .await
    }

    pub async fn query_definitions(
        &self,
        filter: &DefinitionFilter,
        page: PageRequest,
    ) -> Result<Page<ProcessDefinition>> {
        self.call(
            "query_definitions",
            self.engine.query_definitions(filter, page),
        )
        .await
    }

    pub async fn get_definition(&self, definition_id: &str) -> Result<ProcessDefinition> {
        self.query_definitions(&DefinitionFilter::by_id(definition_id), PageRequest::of(0, 1))
            .await?
            .content
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Definition, definition_id))
    }

    pub async fn latest_definition(&self, key: &str) -> Result<ProcessDefinition> {
        self.query_definitions(&DefinitionFilter::latest_of(key), PageRequest::of(0, 1))
            .await?
            .content
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Definition, key))
    }

    pub async fn get_layout(&self, definition_id: &str) -> Result<DiagramLayout> {
        self.call("get_layout", self.engine.get_layout(definition_id))
            .await
    }

    // ── Runtime ──

    pub async fn start(&self, request: &StartRequest) -> Result<ProcessInstance> {
        self.call("start", self.engine.start(request)).await
    }

    pub async fn query_instances(
        &self,
        filter: &InstanceFilter,
        page: PageRequest,
    ) -> Result<Page<ProcessInstance>> {
        self.call("query_instances", self.engine.query_instances(filter, page))
            .await
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<ProcessInstance> {
        self.query_instances(&InstanceFilter::by_id(instance_id), PageRequest::of(0, 1))
            .await?
            .content
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Instance, instance_id))
    }

    pub async fn delete_instances(
        &self,
        instance_ids: &[String],
        reason: &str,
        cascade: bool,
    ) -> Result<()> {
        self.call(
            "delete_instances",
            self.engine.delete_instances(instance_ids, reason, cascade),
        )
        .await
    }

    pub async fn query_tasks(&self, filter: &TaskFilter, page: PageRequest) -> Result<Page<Task>> {
        self.call("query_tasks", self.engine.query_tasks(filter, page))
            .await
    }

    /// The task by id, with no visibility restriction.
    pub async fn find_task(&self, task_id: &str) -> Result<Option<Task>> {
        let filter = TaskFilter {
            id: Some(task_id.to_string()),
            ..Default::default()
        };
        Ok(self
            .query_tasks(&filter, PageRequest::of(0, 1))
            .await?
            .content
            .into_iter()
            .next())
    }

    pub async fn claim_task(&self, request_id: Uuid, task_id: &str, assignee: &str) -> Result<Task> {
        self.call(
            "claim_task",
            self.engine.claim_task(request_id, task_id, assignee),
        )
        .await
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        assignee: &str,
        variables: &Variables,
    ) -> Result<()> {
        self.call(
            "complete_task",
            self.engine.complete_task(task_id, assignee, variables),
        )
        .await
    }

    // ── History ──

    pub async fn historic_instance(&self, instance_id: &str) -> Result<HistoricProcessInstance> {
        self.call(
            "historic_instance",
            self.engine.historic_instance(instance_id),
        )
        .await?
        .ok_or_else(|| OrchestratorError::not_found(EntityKind::Instance, instance_id))
    }

    pub async fn query_task_history(&self, instance_id: &str) -> Result<Vec<HistoricTaskInstance>> {
        self.call(
            "query_task_history",
            self.engine.query_task_history(instance_id),
        )
        .await
    }

    pub async fn query_activity_history(
        &self,
        instance_id: &str,
    ) -> Result<Vec<HistoricActivityInstance>> {
        self.call(
            "query_activity_history",
            self.engine.query_activity_history(instance_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_memory::MemoryEngine;

    #[tokio::test(start_paused = true)]
    async fn test_slow_engine_times_out() {
        let engine = Arc::new(MemoryEngine::new());
        engine.set_latency(Duration::from_millis(500));
        let client = EngineClient::new(engine, Duration::from_millis(50));

        let err = client.list_deployments().await.unwrap_err();
        match err {
            OrchestratorError::Timeout { operation, after_ms } => {
                assert_eq!(operation, "list_deployments");
                assert_eq!(after_ms, 50);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_lookups_are_not_found() {
        let client = EngineClient::new(Arc::new(MemoryEngine::new()), Duration::from_secs(1));
        assert!(client
            .get_definition("nope:1:x")
            .await
            .unwrap_err()
            .is_not_found(EntityKind::Definition));
        assert!(client
            .historic_instance("ghost")
            .await
            .unwrap_err()
            .is_not_found(EntityKind::Instance));
        assert!(client.find_task("ghost").await.unwrap().is_none());
    }
}
