use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Process and task variables. Values are opaque JSON to the core.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ─── Identity ─────────────────────────────────────────────────

/// The caller of an orchestration operation. Always passed explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

// ─── Process model ────────────────────────────────────────────

/// An editable process model. Publishing turns its editor source into a deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessModel {
    pub id: String,
    pub key: String,
    pub name: String,
    /// `{name, description, revision}` as written by the modeler.
    pub meta_info: serde_json::Value,
    /// Raw editor graph (JSON). `None` until the model has been designed and saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_source: Option<Vec<u8>>,
    /// Latest deployment produced from this model. May be stale after an edit.
    pub deployment_id: Option<String>,
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl ProcessModel {
    pub fn new(name: impl Into<String>, key: impl Into<String>, description: &str) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            key: key.into(),
            meta_info: serde_json::json!({
                "name": name,
                "description": description,
                "revision": 1,
            }),
            name,
            editor_source: None,
            deployment_id: None,
            revision: 1,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn has_source(&self) -> bool {
        self.editor_source.as_ref().is_some_and(|s| !s.is_empty())
    }
}

// ─── Repository ───────────────────────────────────────────────

/// An immutable publication of one or more process definitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Definitions produced by this deployment.
    pub definitions: Vec<ProcessDefinition>,
}

impl Deployment {
    /// Highest definition version produced by this deployment.
    pub fn version(&self) -> Option<u32> {
        self.definitions.iter().map(|d| d.version).max()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// `<key>:<version>:<uuid>`
    pub id: String,
    pub key: String,
    pub name: String,
    /// Monotonic per key.
    pub version: u32,
    pub deployment_id: String,
    pub resource_name: String,
}

/// Source handed to the engine on deploy.
#[derive(Clone, Debug)]
pub struct DeploymentSource {
    /// Stable across boundary retries; the engine deduplicates on it.
    pub request_id: Uuid,
    pub name: String,
    pub model_id: Option<String>,
    pub resources: Vec<DeploymentResource>,
}

#[derive(Clone, Debug)]
pub struct DeploymentResource {
    pub name: String,
    pub bytes: Vec<u8>,
}

// ─── Layout ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    UserTask,
    ServiceTask,
    ScriptTask,
    ManualTask,
    ExclusiveGateway,
    ParallelGateway,
}

impl NodeKind {
    pub fn is_event(&self) -> bool {
        matches!(self, NodeKind::StartEvent | NodeKind::EndEvent)
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, NodeKind::ExclusiveGateway | NodeKind::ParallelGateway)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    /// `None` when the definition carries no diagram interchange for this node.
    pub bounds: Option<Bounds>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub waypoints: Vec<Point>,
}

/// Static geometry of a definition: the renderer's only structural input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagramLayout {
    pub definition_id: String,
    pub nodes: Vec<LayoutNode>,
    pub edges: Vec<LayoutEdge>,
}

impl DiagramLayout {
    /// True if at least one node has stored position data.
    pub fn has_geometry(&self) -> bool {
        self.nodes.iter().any(|n| n.bounds.is_some())
    }

    pub fn node(&self, id: &str) -> Option<&LayoutNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The activity entered directly after the start event.
    pub fn first_activity(&self) -> Option<&LayoutNode> {
        let start = self.nodes.iter().find(|n| n.kind == NodeKind::StartEvent)?;
        let edge = self.edges.iter().find(|e| e.source == start.id)?;
        self.node(&edge.target)
    }
}

// ─── Runtime ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Active,
    Completed,
    Deleted,
}

impl InstanceStatus {
    /// Both terminal states are irreversible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Deleted)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_key: String,
    pub name: String,
    pub variables: Variables,
    pub status: InstanceStatus,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Request to start an instance of the latest version of `definition_key`.
#[derive(Clone, Debug)]
pub struct StartRequest {
    /// Stable across boundary retries; the engine deduplicates on it.
    pub correlation_id: Uuid,
    pub definition_key: String,
    pub name: String,
    pub started_by: String,
    pub variables: Variables,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unassigned,
    Assigned,
    Completed,
}

/// A human work item within an instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub process_instance_id: String,
    /// User-task node that created this task.
    pub activity_id: String,
    pub name: String,
    pub assignee: Option<String>,
    #[serde(default)]
    pub candidate_users: Vec<String>,
    #[serde(default)]
    pub candidate_groups: Vec<String>,
    pub status: TaskStatus,
    pub variables: Variables,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Unassigned and open to `identity` as a candidate. Tasks that declare no
    /// candidates at all are open to everyone.
    pub fn is_claimable_by(&self, identity: &Identity) -> bool {
        if self.assignee.is_some() || self.status == TaskStatus::Completed {
            return false;
        }
        if self.candidate_users.is_empty() && self.candidate_groups.is_empty() {
            return true;
        }
        self.candidate_users.iter().any(|u| u == &identity.user_id)
            || self.candidate_groups.iter().any(|g| identity.in_group(g))
    }

    pub fn is_visible_to(&self, identity: &Identity) -> bool {
        self.assignee.as_deref() == Some(identity.user_id.as_str()) || self.is_claimable_by(identity)
    }
}

// ─── History ──────────────────────────────────────────────────

/// Engine record that an instance existed. Removed only by cascading deletion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoricProcessInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_key: String,
    pub started_by: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivityInstance {
    pub process_instance_id: String,
    pub activity_id: String,
    pub activity_name: Option<String>,
    pub activity_type: NodeKind,
    /// Monotonic per instance.
    pub sequence_order: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoricTaskInstance {
    pub process_instance_id: String,
    pub task_id: String,
    pub activity_id: String,
    pub name: String,
    pub assignee: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub variables: Variables,
}

// ─── Paging ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn of(page: usize, size: usize) -> Self {
        Self { page, size }
    }

    /// A single page large enough for every record.
    pub fn all() -> Self {
        Self {
            page: 0,
            size: usize::MAX,
        }
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.size)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

impl<T> Page<T> {
    /// Slice an already ordered result set.
    pub fn from_sorted(items: Vec<T>, request: PageRequest) -> Self {
        let total = items.len();
        let content = items
            .into_iter()
            .skip(request.offset())
            .take(request.size)
            .collect();
        Self {
            content,
            total,
            page: request.page,
            size: request.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
