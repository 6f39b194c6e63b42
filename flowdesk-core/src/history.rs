//! History & Trace Reader.

use crate::engine_client::EngineClient;
use crate::error::OrchestratorError;
use crate::types::*;
use std::sync::Arc;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// An ordered, immutable snapshot of committed history records.
///
/// Iterating never touches the engine and can be repeated any number of
/// times with the same result.
#[derive(Debug)]
pub struct HistoryTrace<T> {
    records: Arc<[T]>,
}

impl<T> Clone for HistoryTrace<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<T> HistoryTrace<T> {
    fn new(records: Vec<T>) -> Self {
        Self {
            records: records.into(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.records
    }
}

impl<'a, T> IntoIterator for &'a HistoryTrace<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Clone)]
pub struct HistoryReader {
    engine: EngineClient,
}

impl HistoryReader {
    pub fn new(engine: EngineClient) -> Self {
        Self { engine }
    }

    /// The engine's record that the instance existed; `NotFound(Instance)` otherwise.
    pub async fn historic_instance(&self, instance_id: &str) -> Result<HistoricProcessInstance> {
        self.engine.historic_instance(instance_id).await
    }

    /// Completed tasks of an instance in completion order.
    pub async fn tasks_for_instance(&self, instance_id: &str) -> Result<HistoryTrace<HistoricTaskInstance>> {
        self.historic_instance(instance_id).await?;
        let mut records = self.engine.query_task_history(instance_id).await?;
        records.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        tracing::debug!(process_instance_id = instance_id, tasks = records.len(), "Task history read");
        Ok(HistoryTrace::new(records))
    }

    /// Executed activities of an instance ordered by `sequence_order`.
    pub async fn activity_trace(
        &self,
        instance_id: &str,
    ) -> Result<HistoryTrace<HistoricActivityInstance>> {
        self.historic_instance(instance_id).await?;
        let mut records = self.engine.query_activity_history(instance_id).await?;
        records.sort_by_key(|r| r.sequence_order);
        for record in &records {
            tracing::trace!(
                process_instance_id = instance_id,
                activity_id = %record.activity_id,
                activity_name = record.activity_name.as_deref().unwrap_or(""),
                activity_type = ?record.activity_type,
                "activity"
            );
        }
        Ok(HistoryTrace::new(records))
    }

    /// Executed activity ids, in execution order. The sole input to trace overlays.
    pub async fn activities_for_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        Ok(self
            .activity_trace(instance_id)
            .await?
            .iter()
            .map(|r| r.activity_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskFilter;
    use crate::engine_memory::MemoryEngine;
    use crate::error::EntityKind;
    use std::time::Duration;
    use uuid::Uuid;

    const TWO_STEP: &str = r#"<definitions><process id="two" name="Two Step">
        <startEvent id="start"/>
        <userTask id="first" name="First"/>
        <serviceTask id="notify" name="Notify"/>
        <userTask id="second" name="Second"/>
        <endEvent id="end"/>
        <sequenceFlow id="f1" sourceRef="start" targetRef="first"/>
        <sequenceFlow id="f2" sourceRef="first" targetRef="notify"/>
        <sequenceFlow id="f3" sourceRef="notify" targetRef="second"/>
        <sequenceFlow id="f4" sourceRef="second" targetRef="end"/>
      </process></definitions>"#;

    async fn finished_instance() -> (HistoryReader, String) {
        let client = EngineClient::new(Arc::new(MemoryEngine::new()), Duration::from_secs(5));
        client
            .deploy(&DeploymentSource {
                request_id: Uuid::now_v7(),
                name: "two".into(),
                model_id: None,
                resources: vec![DeploymentResource {
                    name: "two.bpmn".into(),
                    bytes: TWO_STEP.as_bytes().to_vec(),
                }],
            })
            .await
            .unwrap();
        let inst = client
            .start(&StartRequest {
                correlation_id: Uuid::now_v7(),
                definition_key: "two".into(),
                name: "Two Step - alice".into(),
                started_by: "alice".into(),
                variables: Variables::new(),
            })
            .await
            .unwrap();
        let filter = TaskFilter {
            process_instance_id: Some(inst.id.clone()),
            ..Default::default()
        };
        for user in ["alice", "bob"] {
            let task = client
                .query_tasks(&filter, PageRequest::all())
                .await
                .unwrap()
                .content
                .remove(0);
            client.claim_task(Uuid::now_v7(), &task.id, user).await.unwrap();
            client
                .complete_task(&task.id, user, &Variables::new())
                .await
                .unwrap();
        }
        (HistoryReader::new(client), inst.id)
    }

    #[tokio::test]
    async fn test_activities_in_execution_order() {
        let (reader, id) = finished_instance().await;
        let activities = reader.activities_for_instance(&id).await.unwrap();
        assert_eq!(activities, vec!["start", "first", "notify", "second", "end"]);

        let trace = reader.activity_trace(&id).await.unwrap();
        let orders: Vec<u64> = trace.iter().map(|r| r.sequence_order).collect();
        assert!(orders.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_task_history_is_restartable() {
        let (reader, id) = finished_instance().await;
        let trace = reader.tasks_for_instance(&id).await.unwrap();
        let first: Vec<_> = trace.iter().map(|t| t.assignee.clone()).collect();
        let second: Vec<_> = (&trace).into_iter().map(|t| t.assignee.clone()).collect();
        assert_eq!(first, vec!["alice", "bob"]);
        assert_eq!(first, second);

        let again = reader.tasks_for_instance(&id).await.unwrap();
        assert_eq!(again.len(), trace.len());
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let (reader, _) = finished_instance().await;
        assert!(reader
            .tasks_for_instance("ghost")
            .await
            .unwrap_err()
            .is_not_found(EntityKind::Instance));
        assert!(reader
            .activities_for_instance("ghost")
            .await
            .unwrap_err()
            .is_not_found(EntityKind::Instance));
    }
}
