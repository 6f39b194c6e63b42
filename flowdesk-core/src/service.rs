//! The public operation surface.
//!
//! Every operation that reaches the engine runs under the retry policy as a
//! whole; request and correlation ids are minted once, before the first
//! attempt, so a re-run is deduplicated by the engine.

use crate::config::{FlowDeskConfig, PagingSettings};
use crate::deployment::DeploymentManager;
use crate::diagram::{DiagramEncoder, DiagramRenderer, SvgDiagramEncoder};
use crate::engine::ExecutionEngine;
use crate::engine_client::EngineClient;
use crate::engine_memory::MemoryEngine;
use crate::error::OrchestratorError;
use crate::history::{HistoryReader, HistoryTrace};
use crate::identity::{IdentityProvider, StaticIdentityProvider};
use crate::models::{MemoryModelStore, ModelStore};
use crate::orchestrator::InstanceOrchestrator;
use crate::retry::RetryPolicy;
use crate::tasks::TaskManager;
use crate::types::*;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Cheap to clone; share one across request tasks.
#[derive(Clone)]
pub struct ProcessService {
    retry: RetryPolicy,
    paging: PagingSettings,
    identities: Arc<dyn IdentityProvider>,
    deployments: Arc<DeploymentManager>,
    instances: Arc<InstanceOrchestrator>,
    tasks: Arc<TaskManager>,
    history: HistoryReader,
    renderer: Arc<DiagramRenderer>,
}

impl ProcessService {
    pub fn new(
        config: &FlowDeskConfig,
        engine: Arc<dyn ExecutionEngine>,
        models: Arc<dyn ModelStore>,
        identities: Arc<dyn IdentityProvider>,
        encoder: Arc<dyn DiagramEncoder>,
    ) -> Self {
        let client = EngineClient::new(engine, config.engine.deadline());
        let history = HistoryReader::new(client.clone());
        Self {
            retry: RetryPolicy::new(&config.retry),
            paging: config.paging.clone(),
            identities,
            deployments: Arc::new(DeploymentManager::new(client.clone(), models)),
            instances: Arc::new(InstanceOrchestrator::new(
                client.clone(),
                config.instances.form_variable.clone(),
            )),
            tasks: Arc::new(TaskManager::new(
                client.clone(),
                config.tasks.approval_variable.clone(),
                config.tasks.approval_value.clone(),
            )),
            renderer: Arc::new(DiagramRenderer::new(
                client,
                history.clone(),
                encoder,
            )),
            history,
        }
    }

    /// Wire the in-memory engine, model store, static identities and SVG encoder.
    pub fn in_memory(config: &FlowDeskConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryEngine::new()),
            Arc::new(MemoryModelStore::new()),
            Arc::new(StaticIdentityProvider::new(config.identities.clone())),
            Arc::new(SvgDiagramEncoder),
        )
    }

    async fn identity(&self, user_id: &str) -> Result<Identity> {
        self.identities.resolve(user_id).await
    }

    // ── Models ──

    pub async fn list_models(&self) -> Result<Vec<ProcessModel>> {
        self.deployments.list_models().await
    }

    pub async fn create_model(&self, name: &str, key: &str, description: &str) -> Result<ProcessModel> {
        self.deployments.create_model(name, key, description).await
    }

    #[instrument(skip(self, source), fields(bytes = source.len()))]
    pub async fn save_model_source(&self, model_id: &str, source: Vec<u8>) -> Result<ProcessModel> {
        self.deployments.save_model_source(model_id, source).await
    }

    pub async fn get_model(&self, model_id: &str) -> Result<ProcessModel> {
        self.deployments.get_model(model_id).await
    }

    // ── Deployments ──

    #[instrument(skip(self))]
    pub async fn publish(&self, model_id: &str) -> Result<Deployment> {
        let request_id = Uuid::now_v7();
        self.retry
            .run("publish", move || self.deployments.publish(model_id, request_id))
            .await
    }

    #[instrument(skip(self))]
    pub async fn revoke(&self, model_id: &str, cascade: bool) -> Result<()> {
        self.retry
            .run("revoke", move || self.deployments.revoke(model_id, cascade))
            .await
    }

    #[instrument(skip(self, content), fields(bytes = content.len()))]
    pub async fn deploy(&self, file_name: &str, content: &[u8], name: Option<&str>) -> Result<Deployment> {
        let request_id = Uuid::now_v7();
        self.retry
            .run("deploy", move || {
                self.deployments
                    .upload_and_deploy(file_name, content, name, request_id)
            })
            .await
    }

    pub async fn list_definitions(&self, page: usize, size: usize) -> Result<Page<ProcessDefinition>> {
        let page = self.paging.clamp(page, size);
        self.retry
            .run("list_definitions", move || self.deployments.list_definitions(page))
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_all_definitions(&self) -> Result<Page<ProcessDefinition>> {
        let page = self.paging.first_page();
        self.retry
            .run("delete_all_definitions", move || {
                self.deployments.delete_all_definitions(page)
            })
            .await
    }

    // ── Instances ──

    #[instrument(skip(self, data))]
    pub async fn start_process(&self, definition_id: &str, user: &str, data: &Variables) -> Result<ProcessInstance> {
        let identity = self.identity(user).await?;
        let correlation_id = Uuid::now_v7();
        let identity = &identity;
        self.retry
            .run("start_process", move || {
                self.instances
                    .start(definition_id, identity, data, correlation_id)
            })
            .await
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<ProcessInstance> {
        self.retry
            .run("get_instance", move || self.instances.get(instance_id))
            .await
    }

    pub async fn list_instances(&self, user: &str, page: usize, size: usize) -> Result<Page<ProcessInstance>> {
        let identity = self.identity(user).await?;
        let identity = &identity;
        let page = self.paging.clamp(page, size);
        self.retry
            .run("list_instances", move || self.instances.list(identity, page))
            .await
    }

    /// Deletes, with history, every instance `list_instances` shows `user`.
    #[instrument(skip(self))]
    pub async fn delete_all_instances(&self, user: &str) -> Result<Page<ProcessInstance>> {
        let identity = self.identity(user).await?;
        let identity = &identity;
        let page = self.paging.first_page();
        self.retry
            .run("delete_all_instances", move || {
                self.instances.delete_all(identity, page)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_model_instances(&self, model_id: &str) -> Result<usize> {
        let model = self.deployments.get_model(model_id).await?;
        let key = model.key.as_str();
        self.retry
            .run("delete_model_instances", move || {
                self.instances.delete_by_definition_key(key)
            })
            .await
    }

    // ── History ──

    pub async fn instance_history(&self, instance_id: &str) -> Result<HistoryTrace<HistoricTaskInstance>> {
        self.retry
            .run("instance_history", move || {
                self.history.tasks_for_instance(instance_id)
            })
            .await
    }

    pub async fn instance_activities(&self, instance_id: &str) -> Result<Vec<String>> {
        self.retry
            .run("instance_activities", move || {
                self.history.activities_for_instance(instance_id)
            })
            .await
    }

    pub async fn activity_trace(&self, instance_id: &str) -> Result<HistoryTrace<HistoricActivityInstance>> {
        self.retry
            .run("activity_trace", move || self.history.activity_trace(instance_id))
            .await
    }

    // ── Tasks ──

    pub async fn list_tasks(&self, user: &str, page: usize, size: usize) -> Result<Page<Task>> {
        let identity = self.identity(user).await?;
        let identity = &identity;
        let page = self.paging.clamp(page, size);
        self.retry
            .run("list_tasks", move || self.tasks.list(identity, page))
            .await
    }

    #[instrument(skip(self))]
    pub async fn claim_task(&self, user: &str, task_id: &str) -> Result<Task> {
        let identity = self.identity(user).await?;
        let identity = &identity;
        let request_id = Uuid::now_v7();
        self.retry
            .run("claim_task", move || {
                self.tasks.claim(identity, task_id, request_id)
            })
            .await
    }

    #[instrument(skip(self, variables))]
    pub async fn complete_task(&self, user: &str, task_id: &str, variables: &Variables) -> Result<()> {
        let identity = self.identity(user).await?;
        let identity = &identity;
        self.retry
            .run("complete_task", move || {
                self.tasks.complete(identity, task_id, variables)
            })
            .await
    }

    /// Claim when unassigned, approve, complete; returns the user's refreshed task list.
    #[instrument(skip(self))]
    pub async fn handle_task(&self, user: &str, task_id: &str) -> Result<Page<Task>> {
        let identity = self.identity(user).await?;
        let identity = &identity;
        let page = self.paging.first_page();
        self.retry
            .run("handle_task", move || self.tasks.handle(identity, task_id, page))
            .await
    }

    // ── Diagrams ──

    pub fn diagram_content_type(&self) -> &'static str {
        self.renderer.content_type()
    }

    /// Empty when the definition carries no layout geometry.
    pub async fn render_definition_diagram(&self, definition_id: &str) -> Result<Vec<u8>> {
        self.retry
            .run("render_definition_diagram", move || {
                self.renderer.render_definition(definition_id)
            })
            .await
    }

    pub async fn render_trace_diagram(&self, instance_id: &str) -> Result<Vec<u8>> {
        self.retry
            .run("render_trace_diagram", move || {
                self.renderer.render_trace(instance_id)
            })
            .await
    }
}
