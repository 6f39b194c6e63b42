//! Task Lifecycle Manager: claim / complete transitions with exclusivity guards.

use crate::engine::TaskFilter;
use crate::engine_client::EngineClient;
use crate::error::{EntityKind, OrchestratorError};
use crate::types::*;
use uuid::Uuid;

type Result<T> = std::result::Result<T, OrchestratorError>;

// ── Task state machine ──
// UNASSIGNED --claim--> ASSIGNED --complete(by assignee)--> COMPLETED (moved to history)

pub struct TaskManager {
    engine: EngineClient,
    approval_variable: String,
    approval_value: serde_json::Value,
}

impl TaskManager {
    pub fn new(
        engine: EngineClient,
        approval_variable: impl Into<String>,
        approval_value: serde_json::Value,
    ) -> Self {
        Self {
            engine,
            approval_variable: approval_variable.into(),
            approval_value,
        }
    }

    /// Tasks assigned to or claimable by `identity`, oldest first.
    pub async fn list(&self, identity: &Identity, page: PageRequest) -> Result<Page<Task>> {
        let filter = TaskFilter {
            visible_to: Some(identity.clone()),
            ..Default::default()
        };
        let tasks = self.engine.query_tasks(&filter, page).await?;
        tracing::debug!(user = %identity.user_id, total = tasks.total, "Tasks listed");
        Ok(tasks)
    }

    /// Take an unassigned task. Exactly one of several concurrent claimers wins;
    /// a task that already has an assignee fails `AlreadyClaimed`, whoever holds it.
    pub async fn claim(&self, identity: &Identity, task_id: &str, request_id: Uuid) -> Result<Task> {
        let task = self
            .engine
            .find_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Task, task_id))?;

        match task.assignee.as_deref() {
            // Only the engine can tell a re-sent claim of ours from a fresh one.
            Some(holder) if holder == identity.user_id => {}
            Some(holder) => {
                tracing::warn!(task_id, user = %identity.user_id, assignee = holder, "Claim rejected");
                return Err(OrchestratorError::AlreadyClaimed {
                    task_id: task_id.to_string(),
                    assignee: holder.to_string(),
                });
            }
            None if !task.is_claimable_by(identity) => {
                return Err(OrchestratorError::not_found(EntityKind::Task, task_id));
            }
            None => {}
        }

        let claimed = self
            .engine
            .claim_task(request_id, task_id, &identity.user_id)
            .await?;
        tracing::info!(task_id, user = %identity.user_id, "Task claimed");
        Ok(claimed)
    }

    /// Complete a task held by `identity`, writing `variables` into the instance.
    pub async fn complete(&self, identity: &Identity, task_id: &str, variables: &Variables) -> Result<()> {
        let task = self
            .engine
            .find_task(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Task, task_id))?;
        if task.assignee.as_deref() != Some(identity.user_id.as_str()) {
            tracing::warn!(task_id, user = %identity.user_id, "Completion rejected: not the assignee");
            return Err(OrchestratorError::NotAssignee {
                task_id: task_id.to_string(),
                user: identity.user_id.clone(),
            });
        }

        self.engine
            .complete_task(task_id, &identity.user_id, variables)
            .await?;
        tracing::info!(
            task_id,
            process_instance_id = %task.process_instance_id,
            user = %identity.user_id,
            "Task completed"
        );
        Ok(())
    }

    /// Claim if needed, approve, complete; returns the caller's refreshed task list.
    pub async fn handle(&self, identity: &Identity, task_id: &str, page: PageRequest) -> Result<Page<Task>> {
        let task = self
            .engine
            .find_task(task_id)
            .await?
            .filter(|t| t.status != TaskStatus::Completed && t.is_visible_to(identity))
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Task, task_id))?;

        if task.assignee.is_none() {
            self.engine
                .claim_task(Uuid::now_v7(), task_id, &identity.user_id)
                .await?;
            tracing::info!(task_id, user = %identity.user_id, "Task claimed");
        }

        let mut variables = Variables::new();
        variables.insert(self.approval_variable.clone(), self.approval_value.clone());
        self.complete(identity, task_id, &variables).await?;

        self.list(identity, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_memory::MemoryEngine;
    use std::sync::Arc;
    use std::time::Duration;

    const REVIEW: &str = r#"<definitions><process id="review" name="Review">
        <startEvent id="start"/>
        <userTask id="check" name="Check" candidateGroups="reviewers"/>
        <endEvent id="end"/>
        <sequenceFlow id="f1" sourceRef="start" targetRef="check"/>
        <sequenceFlow id="f2" sourceRef="check" targetRef="end"/>
      </process></definitions>"#;

    async fn setup() -> (TaskManager, EngineClient, String) {
        let client = EngineClient::new(Arc::new(MemoryEngine::new()), Duration::from_secs(5));
        client
            .deploy(&DeploymentSource {
                request_id: Uuid::now_v7(),
                name: "review".into(),
                model_id: None,
                resources: vec![DeploymentResource {
                    name: "review.bpmn".into(),
                    bytes: REVIEW.as_bytes().to_vec(),
                }],
            })
            .await
            .unwrap();
        let inst = client
            .start(&StartRequest {
                correlation_id: Uuid::now_v7(),
                definition_key: "review".into(),
                name: "Review - alice".into(),
                started_by: "alice".into(),
                variables: Variables::new(),
            })
            .await
            .unwrap();
        let filter = TaskFilter {
            process_instance_id: Some(inst.id),
            ..Default::default()
        };
        let task_id = client
            .query_tasks(&filter, PageRequest::all())
            .await
            .unwrap()
            .content[0]
            .id
            .clone();
        let mgr = TaskManager::new(client.clone(), "approved", serde_json::Value::Bool(true));
        (mgr, client, task_id)
    }

    fn reviewer(user: &str) -> Identity {
        Identity::new(user).with_groups(["reviewers"])
    }

    #[tokio::test]
    async fn test_list_respects_candidates() {
        let (mgr, _, task_id) = setup().await;
        let visible = mgr.list(&reviewer("bob"), PageRequest::of(0, 10)).await.unwrap();
        assert_eq!(visible.content[0].id, task_id);
        let hidden = mgr.list(&Identity::new("mallory"), PageRequest::of(0, 10)).await.unwrap();
        assert!(hidden.is_empty());
    }

    #[tokio::test]
    async fn test_claim_guards() {
        let (mgr, _, task_id) = setup().await;
        let err = mgr
            .claim(&Identity::new("mallory"), &task_id, Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(err.is_not_found(EntityKind::Task));

        let request_id = Uuid::now_v7();
        let task = mgr.claim(&reviewer("bob"), &task_id, request_id).await.unwrap();
        assert_eq!(task.assignee.as_deref(), Some("bob"));
        assert_eq!(task.status, TaskStatus::Assigned);

        // A second claim fails even for the holder; only a re-sent request succeeds.
        let err = mgr
            .claim(&reviewer("bob"), &task_id, Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyClaimed { ref assignee, .. } if assignee == "bob"));
        let resent = mgr.claim(&reviewer("bob"), &task_id, request_id).await.unwrap();
        assert_eq!(resent.id, task_id);

        let err = mgr
            .claim(&reviewer("carol"), &task_id, Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyClaimed { ref assignee, .. } if assignee == "bob"));

        let err = mgr
            .claim(&reviewer("bob"), "ghost", Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(err.is_not_found(EntityKind::Task));
    }

    #[tokio::test]
    async fn test_complete_requires_assignee() {
        let (mgr, client, task_id) = setup().await;
        let err = mgr
            .complete(&reviewer("bob"), &task_id, &Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotAssignee { .. }));

        mgr.claim(&reviewer("bob"), &task_id, Uuid::now_v7())
            .await
            .unwrap();
        let err = mgr
            .complete(&reviewer("carol"), &task_id, &Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotAssignee { .. }));
        let still = client.find_task(&task_id).await.unwrap().unwrap();
        assert_eq!(still.assignee.as_deref(), Some("bob"));

        mgr.complete(&reviewer("bob"), &task_id, &Variables::new())
            .await
            .unwrap();
        assert!(client.find_task(&task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_claims_approves_and_completes() {
        let (mgr, client, task_id) = setup().await;
        let bob = reviewer("bob");
        let remaining = mgr.handle(&bob, &task_id, PageRequest::of(0, 10)).await.unwrap();
        assert!(remaining.is_empty());

        let inst_id = client
            .query_instances(&Default::default(), PageRequest::all())
            .await
            .unwrap()
            .content[0]
            .id
            .clone();
        let history = client.query_task_history(&inst_id).await.unwrap();
        assert_eq!(history[0].assignee, "bob");
        assert_eq!(history[0].variables["approved"], true);

        let err = mgr.handle(&bob, &task_id, PageRequest::of(0, 10)).await.unwrap_err();
        assert!(err.is_not_found(EntityKind::Task));
    }
}
