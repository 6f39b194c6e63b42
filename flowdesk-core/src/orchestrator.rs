//! Starting, listing and deleting process instances.

use crate::engine::{InstanceFilter, TaskFilter};
use crate::engine_client::EngineClient;
use crate::error::OrchestratorError;
use crate::types::*;
use uuid::Uuid;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Process Instance Orchestrator.
///
/// Instances are owner-scoped: a user lists and bulk-deletes only the
/// instances they started.
pub struct InstanceOrchestrator {
    engine: EngineClient,
    form_variable: String,
}

impl InstanceOrchestrator {
    pub fn new(engine: EngineClient, form_variable: impl Into<String>) -> Self {
        Self {
            engine,
            form_variable: form_variable.into(),
        }
    }

    /// Bind submitted form data under the configured instance variable.
    fn bind_form(&self, data: &Variables) -> Variables {
        let form: serde_json::Map<String, serde_json::Value> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut vars = Variables::new();
        vars.insert(self.form_variable.clone(), serde_json::Value::Object(form));
        vars
    }

    /// Start the latest version of `definition_id`'s key as `identity`.
    ///
    /// When the first activity is a user task assigned to the starter, it is
    /// completed in the same call with the same variables (intake).
    pub async fn start(
        &self,
        definition_id: &str,
        identity: &Identity,
        data: &Variables,
        correlation_id: Uuid,
    ) -> Result<ProcessInstance> {
        let requested = self.engine.get_definition(definition_id).await?;
        let latest = self.engine.latest_definition(&requested.key).await?;
        let variables = self.bind_form(data);

        let instance = self
            .engine
            .start(&StartRequest {
                correlation_id,
                definition_key: latest.key.clone(),
                name: format!("{} - {}", latest.name, identity.user_id),
                started_by: identity.user_id.clone(),
                variables: variables.clone(),
            })
            .await?;
        tracing::info!(
            process_instance_id = %instance.id,
            definition_id = %instance.definition_id,
            user = %identity.user_id,
            "Process instance started"
        );

        // The engine resolves the version itself; a publish may have landed since `latest`.
        if let Some(task) = self
            .intake_task(&instance.definition_id, &instance.id, identity)
            .await?
        {
            self.engine
                .complete_task(&task.id, &identity.user_id, &variables)
                .await?;
            tracing::info!(
                process_instance_id = %instance.id,
                task_id = %task.id,
                activity_id = %task.activity_id,
                "Intake task completed"
            );
        }

        self.engine.get_instance(&instance.id).await
    }

    /// The pending first-activity task of a fresh instance, if it belongs to the starter.
    async fn intake_task(
        &self,
        definition_id: &str,
        instance_id: &str,
        identity: &Identity,
    ) -> Result<Option<Task>> {
        let layout = self.engine.get_layout(definition_id).await?;
        let Some(first) = layout
            .first_activity()
            .filter(|n| n.kind == NodeKind::UserTask)
        else {
            return Ok(None);
        };

        let filter = TaskFilter {
            process_instance_id: Some(instance_id.to_string()),
            assignee: Some(identity.user_id.clone()),
            ..Default::default()
        };
        let tasks = self.engine.query_tasks(&filter, PageRequest::all()).await?;
        Ok(tasks
            .content
            .into_iter()
            .find(|t| t.activity_id == first.id))
    }

    /// Active instances started by `identity`, oldest first.
    pub async fn list(&self, identity: &Identity, page: PageRequest) -> Result<Page<ProcessInstance>> {
        let instances = self
            .engine
            .query_instances(&owner_filter(identity), page)
            .await?;
        tracing::debug!(user = %identity.user_id, total = instances.total, "Instances listed");
        Ok(instances)
    }

    pub async fn get(&self, instance_id: &str) -> Result<ProcessInstance> {
        self.engine.get_instance(instance_id).await
    }

    /// Cascade-delete everything `list` shows `identity`, in one engine call.
    pub async fn delete_all(&self, identity: &Identity, page: PageRequest) -> Result<Page<ProcessInstance>> {
        let ids: Vec<String> = self
            .engine
            .query_instances(&owner_filter(identity), PageRequest::all())
            .await?
            .content
            .into_iter()
            .map(|i| i.id)
            .collect();
        if !ids.is_empty() {
            self.engine
                .delete_instances(&ids, "deleted by owner", true)
                .await?;
        }
        tracing::info!(user = %identity.user_id, deleted = ids.len(), "Instances deleted");
        self.list(identity, page).await
    }

    /// Cascade-delete every instance of a definition key, finished ones included.
    pub async fn delete_by_definition_key(&self, key: &str) -> Result<usize> {
        let filter = InstanceFilter {
            definition_key: Some(key.to_string()),
            ..Default::default()
        };
        let ids: Vec<String> = self
            .engine
            .query_instances(&filter, PageRequest::all())
            .await?
            .content
            .into_iter()
            .map(|i| i.id)
            .collect();
        if !ids.is_empty() {
            self.engine
                .delete_instances(&ids, "model instances deleted", true)
                .await?;
        }
        tracing::info!(key, deleted = ids.len(), "Model instances deleted");
        Ok(ids.len())
    }
}

fn owner_filter(identity: &Identity) -> InstanceFilter {
    InstanceFilter {
        started_by: Some(identity.user_id.clone()),
        status: Some(InstanceStatus::Active),
        ..Default::default()
    }
}
