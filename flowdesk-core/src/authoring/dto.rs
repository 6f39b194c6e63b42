use crate::types::NodeKind;
use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level graph ──

/// Editor source of a process model, as saved by the modeler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditorGraph {
    #[serde(default)]
    pub nodes: Vec<EditorNode>,
    #[serde(default)]
    pub edges: Vec<EditorEdge>,
}

// ── Edge ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorEdge {
    pub from: String,
    pub to: String,
    /// Condition expression, e.g. `${form.days > 3}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, rename = "isDefault", skip_serializing_if = "is_false")]
    pub is_default: bool,
}

// ── Node (tagged enum) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EditorNode {
    StartEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    EndEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    UserTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// User id or `${initiator}` / `${variable}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        #[serde(default, rename = "candidateUsers", skip_serializing_if = "Vec::is_empty")]
        candidate_users: Vec<String>,
        #[serde(default, rename = "candidateGroups", skip_serializing_if = "Vec::is_empty")]
        candidate_groups: Vec<String>,
    },
    ServiceTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ExclusiveGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ParallelGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl EditorNode {
    pub fn id(&self) -> &str {
        match self {
            EditorNode::StartEvent { id, .. } => id,
            EditorNode::EndEvent { id, .. } => id,
            EditorNode::UserTask { id, .. } => id,
            EditorNode::ServiceTask { id, .. } => id,
            EditorNode::ExclusiveGateway { id, .. } => id,
            EditorNode::ParallelGateway { id, .. } => id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            EditorNode::StartEvent { name, .. }
            | EditorNode::EndEvent { name, .. }
            | EditorNode::UserTask { name, .. }
            | EditorNode::ServiceTask { name, .. }
            | EditorNode::ExclusiveGateway { name, .. }
            | EditorNode::ParallelGateway { name, .. } => name.as_deref(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            EditorNode::StartEvent { .. } => NodeKind::StartEvent,
            EditorNode::EndEvent { .. } => NodeKind::EndEvent,
            EditorNode::UserTask { .. } => NodeKind::UserTask,
            EditorNode::ServiceTask { .. } => NodeKind::ServiceTask,
            EditorNode::ExclusiveGateway { .. } => NodeKind::ExclusiveGateway,
            EditorNode::ParallelGateway { .. } => NodeKind::ParallelGateway,
        }
    }
}

impl EditorGraph {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Deterministic JSON: clone, sort nodes by id, sort edges by (from, to), serialize to pretty JSON.
    pub fn deterministic_json(&self) -> String {
        let mut graph = self.clone();
        graph.nodes.sort_by(|a, b| a.id().cmp(b.id()));
        graph
            .edges
            .sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.to.cmp(&b.to)));
        serde_json::to_string_pretty(&graph).unwrap_or_default()
    }
}
